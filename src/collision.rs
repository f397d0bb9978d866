//! Obstacle-cost interface and its integration over the trajectory.
//!
//! The crate never evaluates distance fields itself: a
//! [`CollisionFunction`] maps a configuration to per-body workspace
//! points, Jacobians, and workspace cost gradients, and the integrator
//! here composes the configuration-space gradient ∂x/∂qᵀ·∇ₓc with the
//! arc-length weight γ·‖ẋ‖·Δt of the CHOMP obstacle functional.

use crate::trajectory::Trajectory;
use ndarray::{Array1, Array2, ArrayView1};

/// Per-body workspace embedding with cost.
///
/// Implementations are external collaborators (distance-field samplers,
/// robot body models); the optimizer only relies on this surface.
pub trait CollisionFunction {
    /// Dimension of the workspace the bodies live in.
    fn workspace_dim(&self) -> usize;

    /// Number of bodies sampled per waypoint.
    fn num_bodies(&self) -> usize;

    /// Write the workspace position of `body` at configuration `q`.
    fn workspace_position(&self, q: ArrayView1<f64>, body: usize, x: &mut Array1<f64>);

    /// Full evaluation at `q`: workspace position, Jacobian ∂x/∂q
    /// (workspace_dim × M), and workspace cost gradient ∇ₓc.  Returns the
    /// scalar cost c(x).
    fn evaluate(
        &self,
        q: ArrayView1<f64>,
        body: usize,
        x: &mut Array1<f64>,
        jacobian: &mut Array2<f64>,
        gradient: &mut Array1<f64>,
    ) -> f64;
}

/// Integrates a [`CollisionFunction`] over a trajectory.
///
/// Owns all scratch buffers so that repeated evaluation allocates
/// nothing; buffers are sized on first use and resized only when the
/// trajectory dimensions change.
#[derive(Debug)]
pub struct CollisionIntegrator {
    q_prev: Array1<f64>,
    q_next: Array1<f64>,
    x: Array1<f64>,
    x_prev: Array1<f64>,
    x_next: Array1<f64>,
    jacobian: Array2<f64>,
    wgrad: Array1<f64>,
}

impl CollisionIntegrator {
    pub fn new() -> Self {
        Self {
            q_prev: Array1::zeros(0),
            q_next: Array1::zeros(0),
            x: Array1::zeros(0),
            x_prev: Array1::zeros(0),
            x_next: Array1::zeros(0),
            jacobian: Array2::zeros((0, 0)),
            wgrad: Array1::zeros(0),
        }
    }

    fn reserve(&mut self, wdim: usize, m: usize) {
        if self.jacobian.nrows() != wdim || self.jacobian.ncols() != m {
            self.q_prev = Array1::zeros(m);
            self.q_next = Array1::zeros(m);
            self.x = Array1::zeros(wdim);
            self.x_prev = Array1::zeros(wdim);
            self.x_next = Array1::zeros(wdim);
            self.jacobian = Array2::zeros((wdim, m));
            self.wgrad = Array1::zeros(wdim);
        }
    }

    /// Total obstacle cost; if `gradient` is given, adds the
    /// configuration-space gradient rows into it.
    ///
    /// For each waypoint and body, the workspace velocity ẋ is the
    /// central difference of the body position across the neighboring
    /// waypoints (border repeat past the interior), and both the cost
    /// and the gradient pick up the weight γ·‖ẋ‖·Δt.
    pub fn evaluate(
        &mut self,
        function: &dyn CollisionFunction,
        trajectory: &Trajectory,
        gamma: f64,
        mut gradient: Option<&mut Array2<f64>>,
    ) -> f64 {
        let n = trajectory.rows() as isize;
        let m = trajectory.cols();
        let wdim = function.workspace_dim();
        self.reserve(wdim, m);

        let dt = trajectory.dt();
        let half_inv_dt = 0.5 / dt;
        let mut total = 0.0;

        for t in 0..n {
            trajectory.tick_border_repeat_into(t - 1, &mut self.q_prev);
            trajectory.tick_border_repeat_into(t + 1, &mut self.q_next);
            let q = trajectory.row(t as usize);

            for body in 0..function.num_bodies() {
                let cost = function.evaluate(
                    q,
                    body,
                    &mut self.x,
                    &mut self.jacobian,
                    &mut self.wgrad,
                );
                function.workspace_position(self.q_prev.view(), body, &mut self.x_prev);
                function.workspace_position(self.q_next.view(), body, &mut self.x_next);

                let mut speed_sq = 0.0;
                for d in 0..wdim {
                    let v = (self.x_next[d] - self.x_prev[d]) * half_inv_dt;
                    speed_sq += v * v;
                }
                let weight = gamma * speed_sq.sqrt() * dt;

                total += weight * cost;

                if let Some(g) = gradient.as_deref_mut() {
                    // g.row(t) += weight · Jᵀ·∇ₓc
                    for j in 0..m {
                        let mut s = 0.0;
                        for d in 0..wdim {
                            s += self.jacobian[[d, j]] * self.wgrad[d];
                        }
                        g[[t as usize, j]] += weight * s;
                    }
                }
            }
        }
        total
    }
}

impl Default for CollisionIntegrator {
    fn default() -> Self {
        Self::new()
    }
}
