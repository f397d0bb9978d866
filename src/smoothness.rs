//! Smoothness energy  E(ξ) = ½·tr(ξᵀAξ) + tr(bᵀξ) + c  and its gradient
//! Aξ + b.  The constant vector b and scalar c fold the fixed endpoints
//! into the interior quadratic form.

use crate::metric::Metric;
use crate::trajectory::Trajectory;
use crate::types::ObjectiveType;
use ndarray::{Array1, Array2};

/// Evaluator for the banded quadratic smoothness objective.
///
/// `prepare` must be called whenever N, Δt, or the goal-set phase
/// changes; it rebuilds b and c from the current endpoints.  Gradient
/// evaluation is accumulative: the caller zero-initializes.
#[derive(Debug, Clone)]
pub struct SmoothnessFunction {
    b: Array2<f64>,
    c: f64,
    ax: Array2<f64>,
}

impl SmoothnessFunction {
    pub fn new() -> Self {
        Self {
            b: Array2::zeros((0, 0)),
            c: 0.0,
            ax: Array2::zeros((0, 0)),
        }
    }

    /// Rebuild the boundary vector b = w·Dᵀe and constant c = ½·w·‖e‖²,
    /// where e collects the endpoint terms of each difference row of the
    /// smoothness operator.
    pub fn prepare(&mut self, trajectory: &Trajectory, objective: ObjectiveType, goalset: bool) {
        let n = trajectory.rows();
        let m = trajectory.cols();
        let dt = trajectory.dt();
        let inv_dt = 1.0 / dt;
        let w = match objective {
            ObjectiveType::MinimizeVelocity => inv_dt * inv_dt,
            ObjectiveType::MinimizeAcceleration => inv_dt.powi(4),
        };

        let mut q0 = Array1::zeros(m);
        let mut q1 = Array1::zeros(m);
        Trajectory::endpoint_position(trajectory.q0(), 0.0, &mut q0);
        Trajectory::endpoint_position(trajectory.q1(), 0.0, &mut q1);

        self.b = Array2::zeros((n, m));
        self.c = 0.0;
        self.ax = Array2::zeros((n, m));

        match objective {
            ObjectiveType::MinimizeVelocity => {
                // Row 0 of D: ξ₀ − q0, so e₀ = −q0.  The closing row
                // q1 − ξ_{N−1} exists only outside goal-set mode.
                for j in 0..m {
                    self.b[[0, j]] -= w * q0[j];
                    self.c += 0.5 * w * q0[j] * q0[j];
                }
                if !goalset {
                    for j in 0..m {
                        self.b[[n - 1, j]] -= w * q1[j];
                        self.c += 0.5 * w * q1[j] * q1[j];
                    }
                }
            }
            ObjectiveType::MinimizeAcceleration => {
                // Second-difference rows centered at the first and last
                // waypoints reach one step past the interior:
                // e₀ = q0 and (outside goal-set mode) e_{N−1} = q1.
                // b = w·Dᵀe puts −2·e on the centered row and +1·e on
                // its neighbor.
                let rows = if goalset { n - 1 } else { n };
                let mut e0 = q0.clone();
                let mut e_last = q1.clone();
                if rows == 1 && !goalset {
                    // single stencil touches both boundaries
                    for j in 0..m {
                        e0[j] += q1[j];
                    }
                    e_last.fill(0.0);
                }
                for j in 0..m {
                    self.b[[0, j]] -= 2.0 * w * e0[j];
                    if n > 1 {
                        self.b[[1, j]] += w * e0[j];
                    }
                    self.c += 0.5 * w * e0[j] * e0[j];
                }
                if rows > 1 && !goalset {
                    for j in 0..m {
                        self.b[[rows - 1, j]] -= 2.0 * w * e_last[j];
                        self.b[[rows - 2, j]] += w * e_last[j];
                        self.c += 0.5 * w * e_last[j] * e_last[j];
                    }
                }
            }
        }
    }

    pub fn boundary_vector(&self) -> &Array2<f64> {
        &self.b
    }

    /// E(ξ) without the gradient.
    pub fn evaluate(&mut self, trajectory: &Trajectory, metric: &Metric) -> f64 {
        self.energy(trajectory, metric)
    }

    /// E(ξ); adds Aξ + b into `gradient`.
    pub fn evaluate_with_gradient(
        &mut self,
        trajectory: &Trajectory,
        metric: &Metric,
        gradient: &mut Array2<f64>,
    ) -> f64 {
        let value = self.energy(trajectory, metric);
        *gradient += &self.ax;
        *gradient += &self.b;
        value
    }

    fn energy(&mut self, trajectory: &Trajectory, metric: &Metric) -> f64 {
        let xi = trajectory.matrix();
        metric.multiply_into(xi, &mut self.ax);
        let mut value = self.c;
        for (x, ax) in xi.iter().zip(self.ax.iter()) {
            value += 0.5 * x * ax;
        }
        for (x, b) in xi.iter().zip(self.b.iter()) {
            value += x * b;
        }
        value
    }
}

impl Default for SmoothnessFunction {
    fn default() -> Self {
        Self::new()
    }
}
