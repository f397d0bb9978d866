//! The single handle the optimizers see: trajectory, metric, smoothness,
//! collision, and constraints aggregated behind one owner, with lazy
//! cache synchronization and the covariant reparameterization.

use crate::collision::{CollisionFunction, CollisionIntegrator};
use crate::constraint::{Constraint, ConstraintFactory};
use crate::metric::{Metric, MetricVariant};
use crate::smoothness::SmoothnessFunction;
use crate::trajectory::Trajectory;
use crate::types::{ChompError, ObjectiveType};
use ndarray::{Array2, ArrayView1};

/// Aggregated problem state.
///
/// Every evaluator first runs `prepare_data`, which brings the cached
/// metric, boundary vector, and constraint assembly into sync with the
/// current N and subsample state.  The optimizer owns this exclusively
/// for the duration of a solve.
pub struct ProblemDescription {
    trajectory: Trajectory,
    factory: ConstraintFactory,
    collision: Option<Box<dyn CollisionFunction>>,
    collision_integrator: CollisionIntegrator,
    smoothness: SmoothnessFunction,
    objective_type: ObjectiveType,
    gamma: f64,
    collision_constraint: bool,

    metric: Option<Metric>,
    sub_metric: Option<Metric>,

    is_covariant: bool,
    doing_covariant: bool,
    /// Covariant state y = Lᵀξ, maintained while `doing_covariant`.
    covariant_state: Array2<f64>,

    use_goalset: bool,
    dirty: bool,
}

impl ProblemDescription {
    pub fn new(trajectory: Trajectory, objective_type: ObjectiveType) -> Self {
        Self {
            trajectory,
            factory: ConstraintFactory::new(),
            collision: None,
            collision_integrator: CollisionIntegrator::new(),
            smoothness: SmoothnessFunction::new(),
            objective_type,
            gamma: 0.1,
            collision_constraint: false,
            metric: None,
            sub_metric: None,
            is_covariant: false,
            doing_covariant: false,
            covariant_state: Array2::zeros((0, 0)),
            use_goalset: false,
            dirty: true,
        }
    }

    // ── Configuration ──────────────────────────────────────

    pub fn set_collision_function(&mut self, f: Box<dyn CollisionFunction>, gamma: f64) {
        self.collision = Some(f);
        self.gamma = gamma;
    }

    pub fn set_collision_constraint(&mut self, on: bool) {
        self.collision_constraint = on;
    }

    pub fn set_covariant(&mut self, on: bool) {
        self.is_covariant = on;
        self.dirty = true;
    }

    pub fn add_constraint(
        &mut self,
        constraint: Box<dyn Constraint>,
        start: f64,
        stop: f64,
    ) -> Result<(), ChompError> {
        self.dirty = true;
        self.factory.add_constraint(constraint, start, stop)
    }

    // ── Accessors ──────────────────────────────────────────

    pub fn n(&self) -> usize {
        self.trajectory.rows()
    }

    pub fn m(&self) -> usize {
        self.trajectory.cols()
    }

    pub fn size(&self) -> usize {
        self.trajectory.size()
    }

    pub fn objective_type(&self) -> ObjectiveType {
        self.objective_type
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Mutable trajectory access for the optimizers (HMC restore,
    /// bounds clamping, constrained upsampling).
    pub fn trajectory_mut(&mut self) -> &mut Trajectory {
        &mut self.trajectory
    }

    pub fn factory(&self) -> &ConstraintFactory {
        &self.factory
    }

    pub fn is_constrained(&self) -> bool {
        !self.factory.is_empty()
    }

    pub fn is_covariant(&self) -> bool {
        self.doing_covariant
    }

    pub fn is_subsampled(&self) -> bool {
        self.trajectory.is_subsampled()
    }

    pub fn is_goalset(&self) -> bool {
        self.use_goalset
    }

    /// The factored metric matching the current subsample state.
    pub fn metric(&self) -> &Metric {
        if self.is_subsampled() {
            self.sub_metric.as_ref().expect("prepare_data not run")
        } else {
            self.metric.as_ref().expect("prepare_data not run")
        }
    }

    /// The full-resolution metric regardless of subsample state.
    pub fn full_metric(&self) -> &Metric {
        self.metric.as_ref().expect("prepare_data not run")
    }

    /// Split borrow for the HMC hook, which restores the trajectory and
    /// resamples against the metric in one call.
    pub fn hmc_parts(&mut self) -> (&mut Trajectory, &Metric) {
        (
            &mut self.trajectory,
            self.metric.as_ref().expect("prepare_data not run"),
        )
    }

    // ── Cache synchronization ──────────────────────────────

    /// Bring cached A, L, b, and the constraint assembly into sync with
    /// the current N and subsample state.
    pub fn prepare_data(&mut self) -> Result<(), ChompError> {
        if !self.dirty {
            return Ok(());
        }
        let n = self.trajectory.rows();
        let m = self.trajectory.cols();
        let dt = self.trajectory.dt();

        let variant = if self.use_goalset {
            MetricVariant::Goalset
        } else {
            MetricVariant::Standard
        };
        self.metric = Some(Metric::new(n, self.objective_type, dt, variant)?);
        self.sub_metric = if self.trajectory.is_subsampled() {
            Some(Metric::new_subsampled(n, self.objective_type, dt)?)
        } else {
            None
        };
        self.smoothness.prepare(&self.trajectory, self.objective_type, self.use_goalset);
        self.factory.prepare_run(n, m);

        // covariant descent is suspended while subsampled
        self.doing_covariant = self.is_covariant && !self.trajectory.is_subsampled();
        if self.doing_covariant {
            self.covariant_state = self.trajectory.matrix().clone();
            self.metric
                .as_ref()
                .expect("metric just built")
                .multiply_lower_transpose(&mut self.covariant_state);
        }

        self.dirty = false;
        Ok(())
    }

    // ── Objective and constraints ──────────────────────────

    /// Total objective (smoothness plus collision, unless collision is
    /// flagged as a constraint).  When `gradient` is given it is filled
    /// with the full-resolution gradient; in covariant mode the gradient
    /// is transformed by L⁻¹ on the way out.
    pub fn evaluate_objective(
        &mut self,
        gradient: Option<&mut Array2<f64>>,
    ) -> Result<f64, ChompError> {
        self.prepare_data()?;
        let metric = self.metric.as_ref().expect("prepare_data ran");

        let mut value = match gradient {
            Some(g) => {
                g.fill(0.0);
                let v = self
                    .smoothness
                    .evaluate_with_gradient(&self.trajectory, metric, g);
                let v = v + match (&self.collision, self.collision_constraint) {
                    (Some(f), false) => self.collision_integrator.evaluate(
                        f.as_ref(),
                        &self.trajectory,
                        self.gamma,
                        Some(&mut *g),
                    ),
                    _ => 0.0,
                };
                if self.doing_covariant {
                    metric.multiply_lower_inverse(g);
                }
                v
            }
            None => {
                let v = self.smoothness.evaluate(&self.trajectory, metric);
                v + match (&self.collision, self.collision_constraint) {
                    (Some(f), false) => self.collision_integrator.evaluate(
                        f.as_ref(),
                        &self.trajectory,
                        self.gamma,
                        None,
                    ),
                    _ => 0.0,
                }
            }
        };
        if !value.is_finite() {
            value = f64::INFINITY;
        }
        Ok(value)
    }

    /// Assemble h (and H when `with_jacobian`); returns ‖h‖∞.  While
    /// subsampled, only even waypoints are evaluated and assembled.
    pub fn evaluate_constraint(&mut self, with_jacobian: bool) -> Result<f64, ChompError> {
        self.prepare_data()?;
        Ok(self.factory.evaluate(&self.trajectory, with_jacobian))
    }

    /// Number of assembled constraint outputs in the current mode.
    pub fn constraint_outputs(&self) -> usize {
        if self.is_subsampled() {
            self.factory.num_outputs_subsampled()
        } else {
            self.factory.num_outputs()
        }
    }

    // ── Trajectory updates ─────────────────────────────────

    /// Subtract a delta from the trajectory (whole-trajectory update of
    /// the global path).  In covariant mode the delta applies to the
    /// covariant state and the waypoints are re-derived as ξ = L⁻ᵀy.
    pub fn update_trajectory(&mut self, delta: &Array2<f64>) {
        if self.doing_covariant {
            self.covariant_state -= delta;
            let metric = self.metric.as_ref().expect("covariant update before prepare");
            let mut xi = self.covariant_state.clone();
            metric.multiply_lower_transpose_inverse(&mut xi);
            self.trajectory.assign_matrix(&xi);
        } else {
            self.trajectory.update(delta);
        }
    }

    /// Add a per-row delta (the local-smoothing path integrates its
    /// update).  Row-indexed updates are rejected in covariant mode.
    pub fn update_trajectory_row(&mut self, delta: ArrayView1<f64>, t: usize) {
        debug_assert!(!self.doing_covariant, "row updates are invalid in covariant mode");
        self.trajectory.accumulate_row(delta, t);
    }

    // ── Resolution and phase transitions ───────────────────

    pub fn upsample(&mut self) {
        self.trajectory.upsample(self.objective_type);
        self.dirty = true;
    }

    pub fn subsample(&mut self) {
        self.trajectory.subsample();
        self.dirty = true;
    }

    pub fn end_subsample(&mut self) {
        self.trajectory.end_subsample();
        self.dirty = true;
    }

    /// Enter goal-set mode: the goal becomes a free trajectory row and
    /// the goal-set constraint is pinned to the last waypoint.
    pub fn start_goalset(&mut self, goal_constraint: Box<dyn Constraint>) {
        self.trajectory.start_goalset();
        self.factory.set_goalset(goal_constraint);
        self.use_goalset = true;
        self.dirty = true;
    }

    /// Leave goal-set mode, returning the goal-set constraint to the
    /// caller; the optimized final row becomes the fixed goal.
    pub fn finish_goalset(&mut self) -> Option<Box<dyn Constraint>> {
        self.trajectory.end_goalset();
        self.use_goalset = false;
        self.dirty = true;
        self.factory.take_goalset()
    }
}
