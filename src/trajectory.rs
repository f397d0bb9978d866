//! Waypoint storage: the N×M trajectory matrix, its fixed endpoints, the
//! border-repeat indexer, 2× upsampling, and the even-row subsample view.

use crate::types::{ChompError, ObjectiveType};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};

// 4-point upsampling stencil for the acceleration objective.
const UP_C1: f64 = 81.0 / 160.0;
const UP_C3: f64 = -1.0 / 160.0;

/// An N×M matrix of interior waypoints between two fixed endpoints.
///
/// Endpoints `q0` and `q1` carry one or more rows; row i is the
/// coefficient of tⁱ when the endpoint is evaluated at a time offset
/// beyond the interior (so a single-row endpoint extends as a constant
/// and a two-row endpoint extends linearly).  Δt is always
/// `t_total / (rows + 1)`.
///
/// While the subsample view is active, [`Trajectory::update`] applies an
/// N_sub×M delta to the even-indexed rows and nothing else.
#[derive(Debug, Clone)]
pub struct Trajectory {
    xi: Array2<f64>,
    q0: Array2<f64>,
    q1: Array2<f64>,
    t_total: f64,
    dt: f64,
    subsampled: bool,
}

impl Trajectory {
    /// Linearly interpolate `n` interior waypoints between the endpoints.
    pub fn initialize(
        q0: Array2<f64>,
        q1: Array2<f64>,
        n: usize,
        t_total: f64,
    ) -> Result<Self, ChompError> {
        check_endpoints(&q0, &q1)?;
        if n == 0 {
            return Err(ChompError::InvalidConfiguration(
                "trajectory needs at least one interior waypoint".into(),
            ));
        }
        if !(t_total > 0.0) {
            return Err(ChompError::InvalidConfiguration(format!(
                "total time must be positive, got {t_total}"
            )));
        }
        let m = q0.ncols();
        let mut xi = Array2::zeros((n, m));
        for t in 0..n {
            let s = (t + 1) as f64 / (n + 1) as f64;
            for j in 0..m {
                xi[[t, j]] = q0[[0, j]] + s * (q1[[0, j]] - q0[[0, j]]);
            }
        }
        let dt = t_total / (n + 1) as f64;
        Ok(Self { xi, q0, q1, t_total, dt, subsampled: false })
    }

    /// Wrap an existing waypoint matrix.
    pub fn from_matrix(
        xi: Array2<f64>,
        q0: Array2<f64>,
        q1: Array2<f64>,
        t_total: f64,
    ) -> Result<Self, ChompError> {
        check_endpoints(&q0, &q1)?;
        if xi.ncols() != q0.ncols() {
            return Err(ChompError::ShapeMismatch(format!(
                "trajectory has {} columns, endpoints have {}",
                xi.ncols(),
                q0.ncols()
            )));
        }
        if xi.nrows() == 0 {
            return Err(ChompError::InvalidConfiguration(
                "trajectory needs at least one interior waypoint".into(),
            ));
        }
        if !(t_total > 0.0) {
            return Err(ChompError::InvalidConfiguration(format!(
                "total time must be positive, got {t_total}"
            )));
        }
        let dt = t_total / (xi.nrows() + 1) as f64;
        Ok(Self { xi, q0, q1, t_total, dt, subsampled: false })
    }

    pub fn rows(&self) -> usize {
        self.xi.nrows()
    }

    pub fn cols(&self) -> usize {
        self.xi.ncols()
    }

    pub fn size(&self) -> usize {
        self.xi.len()
    }

    /// Number of rows in the active subsample view.
    pub fn sub_rows(&self) -> usize {
        (self.rows() + 1) / 2
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn t_total(&self) -> f64 {
        self.t_total
    }

    pub fn is_subsampled(&self) -> bool {
        self.subsampled
    }

    pub fn row(&self, t: usize) -> ArrayView1<'_, f64> {
        self.xi.row(t)
    }

    pub fn row_mut(&mut self, t: usize) -> ArrayViewMut1<'_, f64> {
        self.xi.row_mut(t)
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.xi
    }

    /// Overwrite the waypoint matrix (same shape).
    pub fn assign_matrix(&mut self, xi: &Array2<f64>) {
        self.xi.assign(xi);
    }

    pub fn q0(&self) -> &Array2<f64> {
        &self.q0
    }

    pub fn q1(&self) -> &Array2<f64> {
        &self.q1
    }

    // ── Endpoint policy ────────────────────────────────────

    /// Evaluate an endpoint polynomial at time offset `t`:
    /// Σᵢ q.row(i)·tⁱ.
    pub fn endpoint_position(q: &Array2<f64>, t: f64, out: &mut Array1<f64>) {
        out.fill(0.0);
        let mut tp = 1.0;
        for i in 0..q.nrows() {
            for j in 0..q.ncols() {
                out[j] += q[[i, j]] * tp;
            }
            tp *= t;
        }
    }

    /// The virtual waypoint at tick `t`, extended past the interior by
    /// the endpoint polynomials: for t < 0 the offset is (t+1)·Δt from
    /// q0, for t ≥ N it is (t−N)·Δt from q1.
    pub fn tick_border_repeat_into(&self, t: isize, out: &mut Array1<f64>) {
        let n = self.rows() as isize;
        if t < 0 {
            Self::endpoint_position(&self.q0, (t + 1) as f64 * self.dt, out);
        } else if t >= n {
            Self::endpoint_position(&self.q1, (t - n) as f64 * self.dt, out);
        } else {
            out.assign(&self.xi.row(t as usize));
        }
    }

    pub fn tick_border_repeat(&self, t: isize) -> Array1<f64> {
        let mut out = Array1::zeros(self.cols());
        self.tick_border_repeat_into(t, &mut out);
        out
    }

    // ── Updates ────────────────────────────────────────────

    /// Subtract a delta from the trajectory.  While subsampled the delta
    /// is N_sub×M and lands on the even rows.
    pub fn update(&mut self, delta: &Array2<f64>) {
        if self.subsampled {
            debug_assert_eq!(delta.nrows(), self.sub_rows());
            for (i, drow) in delta.rows().into_iter().enumerate() {
                let mut row = self.xi.row_mut(2 * i);
                row -= &drow;
            }
        } else {
            debug_assert_eq!(delta.nrows(), self.rows());
            self.xi -= delta;
        }
    }

    /// Subtract a delta from row `t`.
    pub fn update_row(&mut self, delta: ArrayView1<f64>, t: usize) {
        let mut row = self.xi.row_mut(t);
        row -= &delta;
    }

    /// Add a delta to row `t` (the local-smoothing path integrates its
    /// update rather than subtracting it).
    pub fn accumulate_row(&mut self, delta: ArrayView1<f64>, t: usize) {
        let mut row = self.xi.row_mut(t);
        row += &delta;
    }

    /// Clamp every waypoint into the per-DOF box bounds.
    pub fn clamp(&mut self, lower: Option<&Array1<f64>>, upper: Option<&Array1<f64>>) {
        let (n, m) = (self.rows(), self.cols());
        for t in 0..n {
            for j in 0..m {
                if let Some(lo) = lower {
                    if self.xi[[t, j]] < lo[j] {
                        self.xi[[t, j]] = lo[j];
                    }
                }
                if let Some(hi) = upper {
                    if self.xi[[t, j]] > hi[j] {
                        self.xi[[t, j]] = hi[j];
                    }
                }
            }
        }
    }

    // ── Subsample view ─────────────────────────────────────

    pub fn subsample(&mut self) {
        self.subsampled = true;
    }

    pub fn end_subsample(&mut self) {
        self.subsampled = false;
    }

    // ── Resolution changes ─────────────────────────────────

    /// Double the temporal resolution: new N = 2·N + 1.  Old rows land at
    /// odd indices of the new grid; even rows are interpolated with the
    /// stencil of the active objective, reading past the interior through
    /// the border-repeat policy.
    pub fn upsample(&mut self, objective: ObjectiveType) {
        let n = self.rows();
        let m = self.cols();
        let n_up = 2 * n + 1;
        let mut xi_up = Array2::zeros((n_up, m));
        let mut a = Array1::zeros(m);
        let mut b = Array1::zeros(m);
        let mut c = Array1::zeros(m);
        let mut d = Array1::zeros(m);

        for t in 0..n_up {
            if t % 2 == 0 {
                let half = (t / 2) as isize;
                match objective {
                    ObjectiveType::MinimizeVelocity => {
                        self.tick_border_repeat_into(half - 1, &mut a);
                        self.tick_border_repeat_into(half, &mut b);
                        for j in 0..m {
                            xi_up[[t, j]] = 0.5 * (a[j] + b[j]);
                        }
                    }
                    ObjectiveType::MinimizeAcceleration => {
                        self.tick_border_repeat_into(half - 2, &mut a);
                        self.tick_border_repeat_into(half - 1, &mut b);
                        self.tick_border_repeat_into(half, &mut c);
                        self.tick_border_repeat_into(half + 1, &mut d);
                        for j in 0..m {
                            xi_up[[t, j]] = UP_C3 * (a[j] + d[j]) + UP_C1 * (b[j] + c[j]);
                        }
                    }
                }
            } else {
                xi_up.row_mut(t).assign(&self.xi.row(t / 2));
            }
        }

        self.xi = xi_up;
        self.subsampled = false;
        self.dt = self.t_total / (n_up + 1) as f64;
    }

    // ── Goal-set phase ─────────────────────────────────────

    /// Enter goal-set mode: the goal becomes a free extra row appended to
    /// the trajectory.
    pub fn start_goalset(&mut self) {
        debug_assert!(!self.subsampled);
        let n = self.rows();
        let m = self.cols();
        let mut xi = Array2::zeros((n + 1, m));
        xi.slice_mut(ndarray::s![..n, ..]).assign(&self.xi);
        let mut goal = Array1::zeros(m);
        Self::endpoint_position(&self.q1, 0.0, &mut goal);
        xi.row_mut(n).assign(&goal);
        self.xi = xi;
        self.dt = self.t_total / (self.rows() + 1) as f64;
    }

    /// Leave goal-set mode: the last row becomes the new fixed goal and
    /// is dropped from the interior.
    pub fn end_goalset(&mut self) {
        let n = self.rows();
        let m = self.cols();
        let mut q1 = Array2::zeros((1, m));
        q1.row_mut(0).assign(&self.xi.row(n - 1));
        self.q1 = q1;
        self.xi = self.xi.slice(ndarray::s![..n - 1, ..]).to_owned();
        self.dt = self.t_total / (self.rows() + 1) as f64;
    }
}

fn check_endpoints(q0: &Array2<f64>, q1: &Array2<f64>) -> Result<(), ChompError> {
    if q0.nrows() == 0 || q1.nrows() == 0 {
        return Err(ChompError::ShapeMismatch("endpoints need at least one row".into()));
    }
    if q0.ncols() != q1.ncols() {
        return Err(ChompError::ShapeMismatch(format!(
            "endpoint dimensions disagree: {} vs {}",
            q0.ncols(),
            q1.ncols()
        )));
    }
    Ok(())
}
