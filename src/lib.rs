//! **chomp** — Covariant Hamiltonian Optimization for Motion Planning.
//!
//! Given fixed start and goal configurations, an initial trajectory of N
//! waypoints in an M-dimensional configuration space, a smoothness
//! objective, an obstacle cost field, and optional equality constraints,
//! the optimizer deforms the trajectory toward a local optimum at
//! progressively finer temporal resolutions:
//!
//! 1. **Trajectory** (`trajectory`): waypoint storage, endpoints, border
//!    repeat, 2× upsampling, even-row subsample view.
//! 2. **Metric** (`metric`): banded SPD smoothness operator, in-place
//!    skyline Cholesky, banded triangular solves.
//! 3. **Objectives** (`smoothness`, `collision`): the endpoint-folded
//!    quadratic energy and the arc-length-weighted obstacle functional.
//! 4. **Constraints** (`constraint`): per-waypoint equality constraints
//!    with a block-diagonal CSR Jacobian assembly.
//! 5. **Optimizers** (`chomp`, `local`, `hmc`): the projected
//!    metric-preconditioned global step, per-waypoint smoothing, and the
//!    stochastic HMC kick.
//! 6. **Driver** (`optimizer`): the multi-resolution loop tying it all
//!    together behind a [`problem::ProblemDescription`].

pub mod types;
pub mod trajectory;
pub mod metric;
pub mod smoothness;
pub mod collision;
pub mod constraint;
pub mod problem;
pub mod chomp;
pub mod local;
pub mod hmc;
pub mod optimizer;
