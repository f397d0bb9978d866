use crate::trajectory::Trajectory;
use ndarray::{Array1, Array2};
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Configuration errors are raised at `solve` entry, before any state is
/// mutated.  Numerical problems encountered *inside* an iteration are
/// recovered (the offending projection is skipped and counted in
/// [`RunStats`]); the corresponding variants here exist for the strict
/// entry-point checks and for callers that use the linear algebra
/// directly.
#[derive(Debug)]
pub enum ChompError {
    /// Inconsistent or conflicting solver configuration.
    InvalidConfiguration(String),
    /// Skyline Cholesky hit a non-positive diagonal (matrix not SPD).
    NotPositiveDefinite { row: usize },
    /// A per-waypoint constraint system was singular beyond recovery.
    DegenerateConstraint { waypoint: usize },
    /// The requested algorithm is not compiled into this crate.
    UnsupportedAlgorithm(Algorithm),
    /// Dimension mismatch in input data.
    ShapeMismatch(String),
}

impl fmt::Display for ChompError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            Self::NotPositiveDefinite { row } =>
                write!(f, "smoothness metric is not positive definite at row {row}"),
            Self::DegenerateConstraint { waypoint } =>
                write!(f, "degenerate constraint system at waypoint {waypoint}"),
            Self::UnsupportedAlgorithm(a) => write!(f, "algorithm {a:?} is not supported"),
            Self::ShapeMismatch(msg) => write!(f, "shape error: {msg}"),
        }
    }
}

impl std::error::Error for ChompError {}

// ─────────────────────────────────────────────────────────────
//  Configuration enums
// ─────────────────────────────────────────────────────────────

/// Which discrete derivative the smoothness energy penalizes.
///
/// Velocity gives a tridiagonal metric (half-bandwidth 1), acceleration a
/// pentadiagonal one (half-bandwidth 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveType {
    MinimizeVelocity,
    MinimizeAcceleration,
}

impl ObjectiveType {
    /// Half-bandwidth of the smoothness metric for this objective.
    pub fn half_bandwidth(self) -> usize {
        match self {
            Self::MinimizeVelocity => 1,
            Self::MinimizeAcceleration => 2,
        }
    }
}

/// Optimization backend selector.  Only [`Algorithm::Chomp`] is
/// implemented here; the NLopt-backed variants are dispatched by external
/// wrappers and rejected by the driver in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Chomp,
    NloptMma,
    NloptSlsqp,
}

/// Events delivered to a [`ChompObserver`] at iteration boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChompEvent {
    Init,
    GlobalIter,
    LocalIter,
    Finish,
    Timeout,
}

// ─────────────────────────────────────────────────────────────
//  Observer
// ─────────────────────────────────────────────────────────────

/// Iteration-boundary callback.
///
/// The trajectory reference is a read-only snapshot of the optimizer's
/// state at the notification point; observers must not retain it.  A
/// non-zero return value requests an early stop, honored at the next
/// iteration boundary without further gradient evaluation.
pub trait ChompObserver {
    fn notify(
        &mut self,
        trajectory: &Trajectory,
        event: ChompEvent,
        iter: usize,
        cur_objective: f64,
        last_objective: f64,
        hmag: f64,
    ) -> i32;
}

// ─────────────────────────────────────────────────────────────
//  Solver settings
// ─────────────────────────────────────────────────────────────

/// Configuration for [`crate::optimizer::MotionOptimizer`].
#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// Relative objective convergence tolerance.
    pub obstol: f64,
    /// Wall-clock limit in seconds; non-positive disables.
    pub timeout_seconds: f64,
    pub max_global_iter: usize,
    pub min_global_iter: usize,
    pub max_local_iter: usize,
    pub min_local_iter: usize,
    /// Final (maximum) number of waypoints.
    pub n_max: usize,
    /// Base (minimum) number of waypoints; subsampling is active only
    /// above this resolution.
    pub n_min: usize,
    /// Gradient step size.
    pub alpha: f64,
    /// Collision-cost weight.
    pub gamma: f64,
    pub objective_type: ObjectiveType,
    pub algorithm: Algorithm,
    pub use_momentum: bool,
    pub use_covariant: bool,
    pub use_hmc: bool,
    pub hmc: HmcSettings,
    /// Treat collision as a constraint instead of an objective term
    /// (excludes it from the objective; the constraint-side handling is
    /// the caller's).
    pub collision_constraint: bool,
    /// Suppress subsampling at the final resolution level.
    pub full_global_at_final: bool,
    /// Per-DOF box bounds, enforced by clamping after each update.
    pub lower_bounds: Option<Array1<f64>>,
    pub upper_bounds: Option<Array1<f64>>,
    /// Number of iterations without any decrease of the constraint
    /// violation before a saturation warning is emitted.
    pub saturation_window: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            obstol: 1e-6,
            timeout_seconds: -1.0,
            max_global_iter: usize::MAX,
            min_global_iter: 0,
            max_local_iter: usize::MAX,
            min_local_iter: 0,
            n_max: 127,
            n_min: 0,
            alpha: 0.1,
            gamma: 0.1,
            objective_type: ObjectiveType::MinimizeAcceleration,
            algorithm: Algorithm::Chomp,
            use_momentum: false,
            use_covariant: false,
            use_hmc: false,
            hmc: HmcSettings::default(),
            collision_constraint: false,
            full_global_at_final: false,
            lower_bounds: None,
            upper_bounds: None,
            saturation_window: 10,
        }
    }
}

/// Schedule parameters for the Hamiltonian Monte Carlo kick.
///
/// Resample events occur at exponentially distributed iteration gaps with
/// rate `lambda`; the inverse temperature starts at `beta0` and is
/// multiplied by `beta_growth` at each resample.
#[derive(Debug, Clone)]
pub struct HmcSettings {
    pub seed: u64,
    pub lambda: f64,
    pub beta0: f64,
    pub beta_growth: f64,
}

impl Default for HmcSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            lambda: 0.02,
            beta0: 1.0,
            beta_growth: 1.5,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Run statistics and outcome
// ─────────────────────────────────────────────────────────────

/// Per-run counters, reported with the final outcome.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Resolution levels visited (upsamples + 1).
    pub levels: usize,
    pub global_iters: usize,
    pub local_iters: usize,
    /// Silently recovered numerical failures (skipped pivots, skipped
    /// constraint projections).
    pub numerical_recoveries: usize,
    /// Constraint-saturation warnings emitted.
    pub saturation_warnings: usize,
    pub hmc_accepts: usize,
    pub hmc_rejects: usize,
}

/// Result of a full multi-resolution solve.
///
/// The optimizer always returns a valid trajectory; quality signals
/// (timeout, saturation, recoveries) are carried here and in the event
/// stream rather than as errors.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Final waypoint matrix, N_max × M.
    pub trajectory: Array2<f64>,
    pub timed_out: bool,
    pub final_objective: f64,
    /// ℓ∞ norm of the assembled constraint violation at the final
    /// trajectory (0 when unconstrained).
    pub constraint_violation: f64,
    pub stats: RunStats,
}
