//! The multi-resolution driver: validates the configuration, runs the
//! global and local phases at each resolution, interleaves upsampling,
//! and coordinates the goal-set phase, subsampling, momentum, HMC, and
//! the trajectory snapshot handoff.

use crate::chomp::ChompOptimizer;
use crate::constraint::Constraint;
use crate::hmc::Hmc;
use crate::local::LocalOptimizer;
use crate::metric::{dense_sym_factor, dense_sym_solve};
use crate::problem::ProblemDescription;
use crate::types::{
    Algorithm, ChompError, ChompEvent, ChompObserver, OptimizationOutcome, OptimizerSettings,
    RunStats,
};
use log::{debug, warn};
use ndarray::{Array1, Array2};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// Cap on the per-waypoint Newton projections of constrained upsampling.
const MAX_PROJECTION_ITERS: usize = 50;

/// Top-level trajectory optimizer.
///
/// Owns the problem for the duration of a solve; external readers can
/// obtain snapshots through [`MotionOptimizer::snapshot_buffer`].
pub struct MotionOptimizer {
    pub problem: ProblemDescription,
    pub settings: OptimizerSettings,
    hmc: Option<Hmc>,
    goalset: Option<Box<dyn Constraint>>,
    snapshot: Option<Arc<Mutex<Array2<f64>>>>,
}

impl MotionOptimizer {
    pub fn new(problem: ProblemDescription, settings: OptimizerSettings) -> Self {
        Self {
            problem,
            settings,
            hmc: None,
            goalset: None,
            snapshot: None,
        }
    }

    /// Use goal-set mode on the first (coarsest) resolution level: the
    /// goal becomes a free waypoint constrained to this manifold.
    pub fn set_goalset(&mut self, constraint: Box<dyn Constraint>) {
        self.goalset = Some(constraint);
    }

    /// Shared buffer the optimizer copies the trajectory into at every
    /// observer notification point; readers lock it to take a coherent
    /// snapshot between iterations.
    pub fn snapshot_buffer(&mut self) -> Arc<Mutex<Array2<f64>>> {
        let buf = Arc::new(Mutex::new(self.problem.trajectory().matrix().clone()));
        self.snapshot = Some(buf.clone());
        buf
    }

    // ── Configuration validation (no partial state mutation) ──

    fn validate(&self) -> Result<(), ChompError> {
        let s = &self.settings;
        if s.algorithm != Algorithm::Chomp {
            return Err(ChompError::UnsupportedAlgorithm(s.algorithm));
        }
        if s.n_min > s.n_max {
            return Err(ChompError::InvalidConfiguration(format!(
                "n_min ({}) exceeds n_max ({})",
                s.n_min, s.n_max
            )));
        }
        if !(s.alpha > 0.0) {
            return Err(ChompError::InvalidConfiguration(format!(
                "step size alpha must be positive, got {}",
                s.alpha
            )));
        }
        let m = self.problem.m();
        for (name, bound) in [("lower", &s.lower_bounds), ("upper", &s.upper_bounds)] {
            if let Some(b) = bound {
                if b.len() != m {
                    return Err(ChompError::InvalidConfiguration(format!(
                        "{name} bounds have length {}, expected {m}",
                        b.len()
                    )));
                }
            }
        }
        if s.use_covariant && s.max_local_iter > 0 {
            return Err(ChompError::InvalidConfiguration(
                "covariant optimization cannot use per-row local smoothing; \
                 set max_local_iter to 0"
                    .into(),
            ));
        }
        if s.use_covariant && s.use_hmc {
            return Err(ChompError::InvalidConfiguration(
                "covariant optimization and HMC are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    // ── Multi-resolution solve ─────────────────────────────

    /// Optimize at the current resolution, then upsample and repeat
    /// until N ≥ n_max.  Always returns a valid trajectory; timeout and
    /// observer stops are soft and reported through the outcome.
    pub fn solve(
        &mut self,
        mut observer: Option<&mut dyn ChompObserver>,
    ) -> Result<OptimizationOutcome, ChompError> {
        self.validate()?;

        fn reborrow<'r, 'b: 'r>(
            o: &'r mut Option<&'b mut dyn ChompObserver>,
        ) -> Option<&'r mut dyn ChompObserver> {
            match o {
                Some(x) => Some(&mut **x),
                None => None,
            }
        }

        let deadline = (self.settings.timeout_seconds > 0.0)
            .then(|| Instant::now() + Duration::from_secs_f64(self.settings.timeout_seconds));
        let use_momentum = self.settings.use_momentum || self.settings.use_hmc;
        if self.settings.use_hmc && self.hmc.is_none() {
            self.hmc = Some(Hmc::new(self.settings.hmc.clone()));
        }
        let n_min = if self.settings.n_min > 0 {
            self.settings.n_min
        } else {
            self.problem.n()
        };

        let mut stats = RunStats::default();
        let mut stopped = false;
        let mut timed_out = false;
        let mut first_level = true;
        let mut level_objective = 0.0;
        let mut level_hmag = 0.0;

        loop {
            stats.levels += 1;

            if first_level {
                if let Some(goal) = self.goalset.take() {
                    self.problem.start_goalset(goal);
                }
            }

            let n = self.problem.n();
            let subsample = n > n_min
                && !self.problem.is_goalset()
                && !(self.settings.full_global_at_final && n >= self.settings.n_max);
            if subsample {
                self.problem.subsample();
            }

            // global phase
            {
                let hmc = if subsample { None } else { self.hmc.as_mut() };
                let mut optimizer = ChompOptimizer::new(
                    &mut self.problem,
                    &self.settings,
                    reborrow(&mut observer),
                    hmc,
                    &mut stats,
                    deadline,
                    self.snapshot.clone(),
                    use_momentum,
                );
                let phase = optimizer.run()?;
                stopped |= phase.stopped;
                timed_out |= phase.timed_out;
                level_objective = phase.objective;
                level_hmag = phase.hmag;
            }

            if self.problem.is_goalset() {
                self.goalset = self.problem.finish_goalset();
            }
            if self.problem.is_subsampled() {
                self.problem.end_subsample();
            }

            // local phase, always at full resolution
            let do_local = self.settings.max_local_iter > 0
                && !stopped
                && !timed_out
                && !(self.settings.full_global_at_final
                    && self.problem.n() >= self.settings.n_max);
            if do_local {
                let mut optimizer = LocalOptimizer::new(
                    &mut self.problem,
                    &self.settings,
                    reborrow(&mut observer),
                    &mut stats,
                    deadline,
                    self.snapshot.clone(),
                );
                let phase = optimizer.run()?;
                stopped |= phase.stopped;
                timed_out |= phase.timed_out;
                level_objective = phase.objective;
                level_hmag = phase.hmag;
            }

            // the reported violation reflects the full trajectory even
            // when the global phase ran subsampled
            if self.problem.is_constrained() {
                level_hmag = self.problem.evaluate_constraint(false)?;
            }

            if let Some(o) = reborrow(&mut observer) {
                if o.notify(
                    self.problem.trajectory(),
                    ChompEvent::Finish,
                    0,
                    level_objective,
                    -1.0,
                    level_hmag,
                ) != 0
                {
                    stopped = true;
                }
            }

            first_level = false;
            if stopped || timed_out || self.problem.n() >= self.settings.n_max {
                break;
            }
            self.problem.upsample();
        }

        if stats.numerical_recoveries > 0 {
            debug!(
                "solve finished with {} recovered numerical failures",
                stats.numerical_recoveries
            );
        }

        let final_objective = self.problem.evaluate_objective(None)?;
        let constraint_violation = if self.problem.is_constrained() {
            self.problem.evaluate_constraint(false)?
        } else {
            0.0
        };

        Ok(OptimizationOutcome {
            trajectory: self.problem.trajectory().matrix().clone(),
            timed_out,
            final_objective,
            constraint_violation,
            stats,
        })
    }

    // ── Constrained upsampling ─────────────────────────────

    /// Upsample to `n_max`, Newton-projecting each newly interpolated
    /// waypoint onto its constraint until ‖h‖∞ < `htol` (least-squares
    /// row step δ = Hᵀ(H·Hᵀ)⁻¹h, scaled by `hstep`).
    pub fn constrained_upsample_to(
        &mut self,
        n_max: usize,
        htol: f64,
        hstep: f64,
    ) -> Result<(), ChompError> {
        let m = self.problem.m();
        let mut delta = Array1::zeros(m);

        while self.problem.n() < n_max {
            self.problem.upsample();
            self.problem.prepare_data()?;
            let n = self.problem.n();

            let max_k = (0..n)
                .filter_map(|t| self.problem.factory().constraint_at(t))
                .map(|c| c.num_outputs())
                .max()
                .unwrap_or(0);
            if max_k == 0 {
                continue;
            }
            let mut h = Array1::zeros(max_k);
            let mut jac = Array2::zeros((max_k, m));
            let mut p = Array2::zeros((max_k, max_k));
            let mut y = Array1::zeros(max_k);

            // new points land on even indices
            for t in (0..n).step_by(2) {
                for iter in 0.. {
                    let k = {
                        let Some(c) = self.problem.factory().constraint_at(t) else {
                            break;
                        };
                        let k = c.num_outputs();
                        if k == 0 {
                            break;
                        }
                        c.evaluate(
                            self.problem.trajectory().row(t),
                            h.slice_mut(ndarray::s![..k]),
                            jac.slice_mut(ndarray::s![..k, ..]),
                        );
                        k
                    };

                    let hn = h.slice(ndarray::s![..k]).iter().fold(0.0f64, |a, v| a.max(v.abs()));
                    if hn < htol {
                        break;
                    }
                    if iter >= MAX_PROJECTION_ITERS {
                        warn!(
                            "constrained upsample: waypoint {t} did not reach {htol:.1e} \
                             (residual {hn:.3e})"
                        );
                        break;
                    }

                    for a in 0..k {
                        for b in 0..k {
                            let mut acc = 0.0;
                            for j in 0..m {
                                acc += jac[[a, j]] * jac[[b, j]];
                            }
                            p[[a, b]] = acc;
                        }
                    }
                    dense_sym_factor(p.slice_mut(ndarray::s![..k, ..k]));
                    for a in 0..k {
                        y[a] = h[a];
                    }
                    dense_sym_solve(p.slice(ndarray::s![..k, ..k]), y.slice_mut(ndarray::s![..k]));

                    for j in 0..m {
                        let mut acc = 0.0;
                        for a in 0..k {
                            acc += jac[[a, j]] * y[a];
                        }
                        delta[j] = hstep * acc;
                    }
                    self.problem.trajectory_mut().update_row(delta.view(), t);
                }
            }
        }
        Ok(())
    }
}
