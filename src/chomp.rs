//! The global CHOMP iteration: covariant (metric-preconditioned)
//! gradient steps, optionally projected onto the constraint tangent
//! space, with momentum and the HMC kick.
//!
//! One `ChompOptimizer` drives one resolution level; the multi-
//! resolution ladder lives in [`crate::optimizer`].

use crate::hmc::Hmc;
use crate::metric::{dense_sym_factor, dense_sym_solve};
use crate::problem::ProblemDescription;
use crate::types::{ChompError, ChompEvent, ChompObserver, OptimizerSettings, RunStats};
use log::warn;
use ndarray::{Array1, Array2};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Result of one optimization phase (global or local) at one level.
#[derive(Debug, Clone, Copy)]
pub struct PhaseOutcome {
    /// The observer requested an early stop.
    pub stopped: bool,
    pub timed_out: bool,
    pub objective: f64,
    pub hmag: f64,
}

/// Relative-decrease convergence test shared by both phases.
pub(crate) fn converged(last: f64, cur: f64, obstol: f64) -> bool {
    let rel = if cur != 0.0 {
        ((last - cur) / cur).abs()
    } else {
        (last - cur).abs()
    };
    rel < obstol
}

pub struct ChompOptimizer<'p, 's, 'o, 'h, 'st> {
    problem: &'p mut ProblemDescription,
    settings: &'s OptimizerSettings,
    observer: Option<&'o mut dyn ChompObserver>,
    hmc: Option<&'h mut Hmc>,
    stats: &'st mut RunStats,
    deadline: Option<Instant>,
    snapshot: Option<Arc<Mutex<Array2<f64>>>>,
    use_momentum: bool,

    // working buffers, sized once per level
    momentum: Array2<f64>,
    g: Array2<f64>,
    g_work: Array2<f64>,
    delta: Array2<f64>,
    scratch: Array2<f64>,
    p: Array2<f64>,
    s: Array2<f64>,
    u: Array1<f64>,
    y: Array1<f64>,

    hmag: f64,
    last_objective: f64,
    cur_iter: usize,
    window_best_hmag: f64,
    window_count: usize,
}

impl<'p, 's, 'o, 'h, 'st> ChompOptimizer<'p, 's, 'o, 'h, 'st> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        problem: &'p mut ProblemDescription,
        settings: &'s OptimizerSettings,
        observer: Option<&'o mut dyn ChompObserver>,
        hmc: Option<&'h mut Hmc>,
        stats: &'st mut RunStats,
        deadline: Option<Instant>,
        snapshot: Option<Arc<Mutex<Array2<f64>>>>,
        use_momentum: bool,
    ) -> Self {
        Self {
            problem,
            settings,
            observer,
            hmc,
            stats,
            deadline,
            snapshot,
            use_momentum,
            momentum: Array2::zeros((0, 0)),
            g: Array2::zeros((0, 0)),
            g_work: Array2::zeros((0, 0)),
            delta: Array2::zeros((0, 0)),
            scratch: Array2::zeros((0, 0)),
            p: Array2::zeros((0, 0)),
            s: Array2::zeros((0, 0)),
            u: Array1::zeros(0),
            y: Array1::zeros(0),
            hmag: 0.0,
            last_objective: 0.0,
            cur_iter: 0,
            window_best_hmag: f64::INFINITY,
            window_count: 0,
        }
    }

    /// Run the global phase at the current resolution until convergence,
    /// observer stop, iteration limit, or deadline.
    pub fn run(&mut self) -> Result<PhaseOutcome, ChompError> {
        self.problem.prepare_data()?;

        let n = self.problem.n();
        let m = self.problem.m();
        let sub = self.problem.is_subsampled();
        let n_work = if sub { self.problem.trajectory().sub_rows() } else { n };
        let k = self.problem.constraint_outputs();

        self.g = Array2::zeros((n, m));
        self.g_work = Array2::zeros((n_work, m));
        self.delta = Array2::zeros((n_work, m));
        self.scratch = Array2::zeros((n_work, m));
        self.p = Array2::zeros((n_work * m, k));
        self.s = Array2::zeros((k, k));
        self.u = Array1::zeros(k);
        self.y = Array1::zeros(k);
        if self.use_momentum && !sub {
            self.momentum = Array2::zeros((n, m));
        }
        if let Some(hmc) = self.hmc.as_deref_mut() {
            hmc.setup_run();
        }

        self.cur_iter = 0;
        // seed the objective before the first HMC checkpoint sees it
        self.last_objective = self.problem.evaluate_objective(None)?;
        self.prepare_iter()?;
        self.last_objective = self.evaluate_with_gradient()?;

        let mut stopped =
            self.notify(ChompEvent::Init, 0, self.last_objective, -1.0) != 0;
        let mut timed_out = false;

        while !stopped && !timed_out {
            if !self.iterate(&mut stopped, &mut timed_out)? {
                break;
            }
        }

        Ok(PhaseOutcome {
            stopped,
            timed_out,
            objective: self.last_objective,
            hmag: self.hmag,
        })
    }

    // One global iteration.  Returns false once the phase is finished.
    fn iterate(&mut self, stopped: &mut bool, timed_out: &mut bool) -> Result<bool, ChompError> {
        self.chomp_global();
        if !self.problem.is_covariant() {
            self.problem
                .trajectory_mut()
                .clamp(self.settings.lower_bounds.as_ref(), self.settings.upper_bounds.as_ref());
        }

        self.cur_iter += 1;
        self.stats.global_iters += 1;

        self.prepare_iter()?;
        let cur = self.evaluate_with_gradient()?;
        self.check_saturation();

        let past_max = self.cur_iter >= self.settings.max_global_iter;
        let past_min = self.cur_iter > self.settings.min_global_iter;
        let mut finished = past_max
            || (past_min && converged(self.last_objective, cur, self.settings.obstol));

        if self.notify(ChompEvent::GlobalIter, self.cur_iter, cur, self.last_objective) != 0 {
            *stopped = true;
            finished = true;
        } else if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                *timed_out = true;
                finished = true;
                self.notify(ChompEvent::Timeout, self.cur_iter, cur, self.last_objective);
            }
        }

        self.last_objective = cur;
        Ok(!finished)
    }

    // HMC kick, then constraint assembly for this iteration.
    fn prepare_iter(&mut self) -> Result<(), ChompError> {
        let sub = self.problem.is_subsampled();
        if !sub {
            if let Some(hmc) = self.hmc.as_deref_mut() {
                let (trajectory, metric) = self.problem.hmc_parts();
                if let Some(restored) = hmc.iteration(
                    self.cur_iter,
                    trajectory,
                    &mut self.momentum,
                    metric,
                    self.last_objective,
                    self.stats,
                ) {
                    self.last_objective = restored;
                }
            }
        }
        if self.problem.is_constrained() {
            self.hmag = self.problem.evaluate_constraint(true)?;
        } else {
            self.hmag = 0.0;
        }
        Ok(())
    }

    fn evaluate_with_gradient(&mut self) -> Result<f64, ChompError> {
        let value = self.problem.evaluate_objective(Some(&mut self.g))?;
        if self.problem.is_subsampled() {
            for i in 0..self.g_work.nrows() {
                self.g_work.row_mut(i).assign(&self.g.row(2 * i));
            }
        } else {
            self.g_work.assign(&self.g);
        }
        Ok(value)
    }

    // ── The CHOMP update ───────────────────────────────────

    fn chomp_global(&mut self) {
        let k = self.problem.constraint_outputs();
        if k == 0 {
            self.unconstrained_step();
        } else {
            self.constrained_step(k);
        }
    }

    // Δ = α·A⁻¹g (α·g in covariant coordinates), folded into momentum
    // when enabled.
    fn unconstrained_step(&mut self) {
        let sub = self.problem.is_subsampled();
        let covariant = self.problem.is_covariant();
        let alpha = self.settings.alpha;

        self.delta.assign(&self.g_work);
        if !covariant {
            self.problem.metric().solve(&mut self.delta);
        }

        if self.use_momentum && !sub {
            self.momentum.scaled_add(alpha, &self.delta);
            self.problem.update_trajectory(&self.momentum);
        } else {
            self.delta *= alpha;
            self.problem.update_trajectory(&self.delta);
        }
    }

    // Projected update: the tangent-space step W plus the violation-
    // restoring step P·S⁻¹h, where P = A⁻¹Hᵀ and S = H·A⁻¹·Hᵀ.
    fn constrained_step(&mut self, k: usize) {
        let sub = self.problem.is_subsampled();
        let covariant = self.problem.is_covariant();
        let alpha = self.settings.alpha;
        let m = self.problem.m();

        {
            let metric = self.problem.metric();
            let jac = self
                .problem
                .factory()
                .jacobian(sub)
                .expect("constrained step without assembled jacobian");
            let indptr = jac.indptr();
            let indptr = indptr.raw_storage();
            let indices = jac.indices();
            let data = jac.data();

            let nm = self.delta.len();

            // base direction in the active coordinates: ag = A⁻¹g, or in
            // covariant coordinates the gradient itself (the metric is
            // the identity there)
            self.delta.assign(&self.g_work);
            if !covariant {
                metric.solve(&mut self.delta);
            }

            // u = H·vec(A⁻¹g); the covariant gradient is L⁻¹g, so A⁻¹g
            // is one back-substitution away
            if covariant {
                self.scratch.assign(&self.g_work);
                metric.multiply_lower_transpose_inverse(&mut self.scratch);
            } else {
                self.scratch.assign(&self.delta);
            }
            for i in 0..k {
                let mut acc = 0.0;
                for nz in indptr[i]..indptr[i + 1] {
                    let col = indices[nz];
                    acc += data[nz] * self.scratch[[col / m, col % m]];
                }
                self.u[i] = acc;
            }

            // P = A⁻¹Hᵀ (L⁻¹Hᵀ in covariant coordinates), one skyline
            // solve per constraint row
            for j in 0..k {
                self.scratch.fill(0.0);
                for nz in indptr[j]..indptr[j + 1] {
                    let col = indices[nz];
                    self.scratch[[col / m, col % m]] = data[nz];
                }
                if covariant {
                    metric.multiply_lower_inverse(&mut self.scratch);
                } else {
                    metric.solve(&mut self.scratch);
                }
                for r in 0..self.scratch.nrows() {
                    for c in 0..m {
                        self.p[[r * m + c, j]] = self.scratch[[r, c]];
                    }
                }
            }

            // S = H·A⁻¹·Hᵀ.  In covariant coordinates P carries only the
            // forward solve, so S is assembled as PᵀP; otherwise H·P.
            if covariant {
                for i in 0..k {
                    for j in 0..k {
                        let mut acc = 0.0;
                        for r in 0..nm {
                            acc += self.p[[r, i]] * self.p[[r, j]];
                        }
                        self.s[[i, j]] = acc;
                    }
                }
            } else {
                for i in 0..k {
                    for j in 0..k {
                        let mut acc = 0.0;
                        for nz in indptr[i]..indptr[i + 1] {
                            acc += data[nz] * self.p[[indices[nz], j]];
                        }
                        self.s[[i, j]] = acc;
                    }
                }
            }

            let skipped = dense_sym_factor(self.s.view_mut());
            if skipped > 0 {
                self.stats.numerical_recoveries += skipped;
                warn!(
                    "constraint system rank-deficient ({skipped}/{k} pivots dropped), \
                     using minimum-norm projection"
                );
            }

            dense_sym_solve(self.s.view(), self.u.view_mut());

            // W = α·(base − P·S⁻¹u)
            for r in 0..nm {
                let mut py = 0.0;
                for j in 0..k {
                    py += self.p[[r, j]] * self.u[j];
                }
                let v = alpha * (self.delta[[r / m, r % m]] - py);
                self.delta[[r / m, r % m]] = v;
            }

            // violation restoration: S⁻¹h
            self.y.assign(self.problem.factory().h(sub));
            dense_sym_solve(self.s.view(), self.y.view_mut());

            if self.use_momentum && !sub {
                self.momentum += &self.delta;
                self.delta.assign(&self.momentum);
            }
            for r in 0..nm {
                let mut py = 0.0;
                for j in 0..k {
                    py += self.p[[r, j]] * self.y[j];
                }
                self.delta[[r / m, r % m]] += py;
            }
        }

        self.problem.update_trajectory(&self.delta);
    }

    // ── Diagnostics ────────────────────────────────────────

    // Warn once per window when the constraint violation stalls.
    fn check_saturation(&mut self) {
        if !self.problem.is_constrained() || self.settings.saturation_window == 0 {
            return;
        }
        if self.hmag < 1e-10 {
            // satisfied, nothing to warn about
            self.window_best_hmag = self.hmag;
            self.window_count = 0;
            return;
        }
        if self.hmag < self.window_best_hmag * (1.0 - 1e-12) {
            self.window_best_hmag = self.hmag;
            self.window_count = 0;
        } else {
            self.window_count += 1;
            if self.window_count >= self.settings.saturation_window {
                warn!(
                    "constraint violation saturated at {:.3e} for {} iterations",
                    self.hmag, self.window_count
                );
                self.stats.saturation_warnings += 1;
                self.window_count = 0;
            }
        }
    }

    fn notify(&mut self, event: ChompEvent, iter: usize, cur: f64, last: f64) -> i32 {
        if let Some(buf) = &self.snapshot {
            if let Ok(mut guard) = buf.lock() {
                let xi = self.problem.trajectory().matrix();
                if guard.dim() == xi.dim() {
                    guard.assign(xi);
                } else {
                    *guard = xi.clone();
                }
            }
        }
        match self.observer.as_deref_mut() {
            Some(o) => o.notify(self.problem.trajectory(), event, iter, cur, last, self.hmag),
            None => 0,
        }
    }
}
