//! Equality constraints: the per-waypoint `Constraint` interface and the
//! factory that materializes interval-tagged constraints for a given
//! resolution and assembles the global violation vector h and
//! block-diagonal Jacobian H.
//!
//! H is stored as a CSR matrix whose sparsity pattern is built once per
//! `prepare_run`; each evaluation only rewrites the value array in place.

use crate::trajectory::Trajectory;
use crate::types::ChompError;
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, ArrayViewMut2};
use sprs::CsMat;

/// A smooth equality constraint h(q) = 0 on a single waypoint.
pub trait Constraint {
    /// Number of scalar outputs k (may be 0 for inactive constraints).
    fn num_outputs(&self) -> usize;

    /// Write h(q) (length k) and the Jacobian ∂h/∂q (k × M).
    fn evaluate(&self, q: ArrayView1<f64>, h: ArrayViewMut1<f64>, jacobian: ArrayViewMut2<f64>);
}

struct ConstraintInterval {
    start: f64,
    stop: f64,
    constraint: Box<dyn Constraint>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Interval(usize),
    Goal,
}

/// Provider of per-waypoint constraints and assembler of (h, H).
///
/// Constraints are registered on normalized time intervals [start, stop]
/// ⊆ [0, 1]; for a given N the interval covering t/(N−1) supplies the
/// constraint at waypoint t (first match after sorting by start).  A
/// goal-set constraint, when present, overrides the last waypoint.
pub struct ConstraintFactory {
    intervals: Vec<ConstraintInterval>,
    sorted: bool,
    goalset: Option<Box<dyn Constraint>>,

    // per-run tables, rebuilt by prepare_run
    prepared_n: usize,
    slots: Vec<Slot>,
    row_offset: Vec<usize>,
    total_outputs: usize,
    sub_total_outputs: usize,
    jacobian: Option<CsMat<f64>>,
    sub_jacobian: Option<CsMat<f64>>,
    h: Array1<f64>,
    h_sub: Array1<f64>,
    scratch_jac: Array2<f64>,
}

impl ConstraintFactory {
    pub fn new() -> Self {
        Self {
            intervals: Vec::new(),
            sorted: true,
            goalset: None,
            prepared_n: 0,
            slots: Vec::new(),
            row_offset: Vec::new(),
            total_outputs: 0,
            sub_total_outputs: 0,
            jacobian: None,
            sub_jacobian: None,
            h: Array1::zeros(0),
            h_sub: Array1::zeros(0),
            scratch_jac: Array2::zeros((0, 0)),
        }
    }

    /// Register a constraint active on the normalized time interval
    /// [start, stop].
    pub fn add_constraint(
        &mut self,
        constraint: Box<dyn Constraint>,
        start: f64,
        stop: f64,
    ) -> Result<(), ChompError> {
        if !(0.0..=1.0).contains(&start) || !(0.0..=1.0).contains(&stop) || start > stop {
            return Err(ChompError::InvalidConfiguration(format!(
                "constraint interval [{start}, {stop}] is not within [0, 1]"
            )));
        }
        if let Some(last) = self.intervals.last() {
            if last.start > start {
                self.sorted = false;
            }
        }
        self.intervals.push(ConstraintInterval { start, stop, constraint });
        self.prepared_n = 0;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty() && self.goalset.is_none()
    }

    pub fn set_goalset(&mut self, constraint: Box<dyn Constraint>) {
        self.goalset = Some(constraint);
        self.prepared_n = 0;
    }

    pub fn take_goalset(&mut self) -> Option<Box<dyn Constraint>> {
        self.prepared_n = 0;
        self.goalset.take()
    }

    /// Σ k_t over the waypoints covered by the current assembly.
    pub fn num_outputs(&self) -> usize {
        self.total_outputs
    }

    pub fn num_outputs_subsampled(&self) -> usize {
        self.sub_total_outputs
    }

    /// The constraint materialized at waypoint `t`, if any.
    pub fn constraint_at(&self, t: usize) -> Option<&dyn Constraint> {
        match self.slots.get(t).copied().unwrap_or(Slot::Empty) {
            Slot::Empty => None,
            Slot::Interval(i) => Some(self.intervals[i].constraint.as_ref()),
            Slot::Goal => self.goalset.as_deref(),
        }
    }

    /// Row offset of waypoint `t` in the assembled h vector.
    pub fn row_offset(&self, t: usize) -> usize {
        self.row_offset[t]
    }

    /// Assembled violation vector of the last `evaluate` call.
    pub fn h(&self, subsampled: bool) -> &Array1<f64> {
        if subsampled { &self.h_sub } else { &self.h }
    }

    /// Assembled block-diagonal Jacobian of the last `evaluate` call.
    pub fn jacobian(&self, subsampled: bool) -> Option<&CsMat<f64>> {
        if subsampled {
            self.sub_jacobian.as_ref()
        } else {
            self.jacobian.as_ref()
        }
    }

    // ── Per-run preparation ────────────────────────────────

    /// Materialize the per-waypoint constraint list and the CSR patterns
    /// for N waypoints with M columns each.  Lazy: a repeat call with
    /// the same N is a no-op.
    pub fn prepare_run(&mut self, n: usize, m: usize) {
        if self.prepared_n == n {
            return;
        }
        if !self.sorted {
            self.intervals.sort_by(|a, b| {
                a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal)
            });
            self.sorted = true;
        }

        self.slots.clear();
        self.slots.resize(n, Slot::Empty);
        for t in 0..n {
            let s = if n > 1 { t as f64 / (n - 1) as f64 } else { 0.0 };
            for (i, iv) in self.intervals.iter().enumerate() {
                if iv.start <= s && s <= iv.stop {
                    self.slots[t] = Slot::Interval(i);
                    break;
                }
            }
        }
        if self.goalset.is_some() {
            self.slots[n - 1] = Slot::Goal;
        }

        // row offsets, full and subsampled
        self.row_offset.clear();
        let mut offset = 0;
        let mut sub_offset = 0;
        let mut max_k = 0;
        for t in 0..n {
            self.row_offset.push(offset);
            let k = self.constraint_at(t).map_or(0, Constraint::num_outputs);
            max_k = max_k.max(k);
            offset += k;
            if t % 2 == 0 {
                sub_offset += k;
            }
        }
        self.total_outputs = offset;
        self.sub_total_outputs = sub_offset;

        self.h = Array1::zeros(self.total_outputs);
        self.h_sub = Array1::zeros(self.sub_total_outputs);
        self.scratch_jac = Array2::zeros((max_k.max(1), m));

        self.jacobian = (self.total_outputs > 0).then(|| self.build_pattern(n, m, false));
        self.sub_jacobian =
            (self.sub_total_outputs > 0).then(|| self.build_pattern(n, m, true));
        self.prepared_n = n;
    }

    // CSR pattern: each constrained waypoint contributes k_t dense rows
    // over its own M-column block.
    fn build_pattern(&self, n: usize, m: usize, subsampled: bool) -> CsMat<f64> {
        let (rows, cols) = if subsampled {
            (self.sub_total_outputs, ((n + 1) / 2) * m)
        } else {
            (self.total_outputs, n * m)
        };
        let mut indptr = Vec::with_capacity(rows + 1);
        let mut indices = Vec::with_capacity(rows * m);
        indptr.push(0);
        for t in 0..n {
            if subsampled && t % 2 != 0 {
                continue;
            }
            let k = self.constraint_at(t).map_or(0, Constraint::num_outputs);
            let block = if subsampled { t / 2 } else { t };
            for _ in 0..k {
                for j in 0..m {
                    indices.push(block * m + j);
                }
                indptr.push(indices.len());
            }
        }
        let data = vec![0.0; indices.len()];
        CsMat::new((rows, cols), indptr, indices, data)
    }

    // ── Assembly ───────────────────────────────────────────

    /// Evaluate every materialized constraint on the trajectory (only
    /// even waypoints while subsampled), filling h and, when requested,
    /// the Jacobian values in place.  Returns ‖h‖∞.
    pub fn evaluate(&mut self, trajectory: &Trajectory, with_jacobian: bool) -> f64 {
        let n = trajectory.rows();
        let m = trajectory.cols();
        let sub = trajectory.is_subsampled();
        debug_assert_eq!(self.prepared_n, n);

        // borrow juggling: detach the jacobian while iterating slots
        let mut jac = if sub { self.sub_jacobian.take() } else { self.jacobian.take() };

        let mut hmag = 0.0f64;
        let mut row = 0;
        for t in 0..n {
            if sub && t % 2 != 0 {
                continue;
            }
            let k = match self.slots[t] {
                Slot::Empty => 0,
                Slot::Interval(i) => self.intervals[i].constraint.num_outputs(),
                Slot::Goal => self.goalset.as_ref().map_or(0, |g| g.num_outputs()),
            };
            if k == 0 {
                continue;
            }
            let constraint: &dyn Constraint = match self.slots[t] {
                Slot::Interval(i) => self.intervals[i].constraint.as_ref(),
                Slot::Goal => self.goalset.as_deref().expect("goal slot without goalset"),
                Slot::Empty => unreachable!(),
            };

            let h_vec = if sub { &mut self.h_sub } else { &mut self.h };
            let h_slice = h_vec.slice_mut(ndarray::s![row..row + k]);
            constraint.evaluate(
                trajectory.row(t),
                h_slice,
                self.scratch_jac.slice_mut(ndarray::s![..k, ..]),
            );
            for r in row..row + k {
                hmag = hmag.max(h_vec[r].abs());
            }
            if with_jacobian {
                if let Some(j) = jac.as_mut() {
                    let data = j.data_mut();
                    for r in 0..k {
                        for c in 0..m {
                            data[(row + r) * m + c] = self.scratch_jac[[r, c]];
                        }
                    }
                }
            }
            row += k;
        }

        if sub {
            self.sub_jacobian = jac;
        } else {
            self.jacobian = jac;
        }
        hmag
    }
}

impl Default for ConstraintFactory {
    fn default() -> Self {
        Self::new()
    }
}
