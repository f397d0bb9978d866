//! Per-waypoint local smoothing: each waypoint takes an independent
//! gradient step, projected onto the null space of its own constraint
//! Jacobian and pulled toward constraint satisfaction.

use crate::chomp::{converged, PhaseOutcome};
use crate::metric::{dense_sym_factor, dense_sym_solve};
use crate::problem::ProblemDescription;
use crate::types::{ChompError, ChompEvent, ChompObserver, OptimizerSettings, RunStats};
use ndarray::{Array1, Array2};
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub struct LocalOptimizer<'p, 's, 'o, 'st> {
    problem: &'p mut ProblemDescription,
    settings: &'s OptimizerSettings,
    observer: Option<&'o mut dyn ChompObserver>,
    stats: &'st mut RunStats,
    deadline: Option<Instant>,
    snapshot: Option<Arc<Mutex<Array2<f64>>>>,

    g: Array2<f64>,
    h_t: Array1<f64>,
    jac_t: Array2<f64>,
    p_t: Array2<f64>,
    u: Array1<f64>,
    y: Array1<f64>,
    delta_t: Array1<f64>,

    hmag: f64,
    last_objective: f64,
    cur_iter: usize,
}

impl<'p, 's, 'o, 'st> LocalOptimizer<'p, 's, 'o, 'st> {
    pub fn new(
        problem: &'p mut ProblemDescription,
        settings: &'s OptimizerSettings,
        observer: Option<&'o mut dyn ChompObserver>,
        stats: &'st mut RunStats,
        deadline: Option<Instant>,
        snapshot: Option<Arc<Mutex<Array2<f64>>>>,
    ) -> Self {
        Self {
            problem,
            settings,
            observer,
            stats,
            deadline,
            snapshot,
            g: Array2::zeros((0, 0)),
            h_t: Array1::zeros(0),
            jac_t: Array2::zeros((0, 0)),
            p_t: Array2::zeros((0, 0)),
            u: Array1::zeros(0),
            y: Array1::zeros(0),
            delta_t: Array1::zeros(0),
            hmag: 0.0,
            last_objective: 0.0,
            cur_iter: 0,
        }
    }

    /// Run local smoothing passes until convergence, observer stop,
    /// iteration limit, or deadline.  Runs at full resolution; the
    /// driver ends any subsample view first.
    pub fn run(&mut self) -> Result<PhaseOutcome, ChompError> {
        self.problem.prepare_data()?;

        let n = self.problem.n();
        let m = self.problem.m();
        let max_k = (0..n)
            .filter_map(|t| self.problem.factory().constraint_at(t))
            .map(|c| c.num_outputs())
            .max()
            .unwrap_or(0);

        self.g = Array2::zeros((n, m));
        self.h_t = Array1::zeros(max_k.max(1));
        self.jac_t = Array2::zeros((max_k.max(1), m));
        self.p_t = Array2::zeros((max_k.max(1), max_k.max(1)));
        self.u = Array1::zeros(max_k.max(1));
        self.y = Array1::zeros(max_k.max(1));
        self.delta_t = Array1::zeros(m);

        self.cur_iter = 0;
        self.last_objective = self.problem.evaluate_objective(Some(&mut self.g))?;

        let mut stopped = false;
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

    fn iterate(&mut self, stopped: &mut bool, timed_out: &mut bool) -> Result<bool, ChompError> {
        self.smooth_pass();
        self.problem
            .trajectory_mut()
            .clamp(self.settings.lower_bounds.as_ref(), self.settings.upper_bounds.as_ref());

        self.cur_iter += 1;
        self.stats.local_iters += 1;

        let cur = self.problem.evaluate_objective(Some(&mut self.g))?;

        let past_max = self.cur_iter >= self.settings.max_local_iter;
        let past_min = self.cur_iter > self.settings.min_local_iter;
        let mut finished = past_max
            || (past_min && converged(self.last_objective, cur, self.settings.obstol));

        if self.notify(ChompEvent::LocalIter, self.cur_iter, cur, self.last_objective) != 0 {
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

    // One pass over all waypoints, using the gradient computed at the
    // start of the iteration.
    fn smooth_pass(&mut self) {
        let n = self.problem.n();
        let m = self.problem.m();
        let alpha = self.settings.alpha;

        self.hmag = 0.0;
        for t in 0..n {
            let k = self
                .problem
                .factory()
                .constraint_at(t)
                .map_or(0, |c| c.num_outputs());

            if k == 0 {
                // δ_t = −α·g_t
                for j in 0..m {
                    self.delta_t[j] = -alpha * self.g[[t, j]];
                }
            } else {
                {
                    let c = self
                        .problem
                        .factory()
                        .constraint_at(t)
                        .expect("constraint vanished mid-pass");
                    c.evaluate(
                        self.problem.trajectory().row(t),
                        self.h_t.slice_mut(ndarray::s![..k]),
                        self.jac_t.slice_mut(ndarray::s![..k, ..]),
                    );
                }
                for r in 0..k {
                    self.hmag = self.hmag.max(self.h_t[r].abs());
                }

                // P_t = H_t·H_tᵀ
                for a in 0..k {
                    for b in 0..k {
                        let mut acc = 0.0;
                        for j in 0..m {
                            acc += self.jac_t[[a, j]] * self.jac_t[[b, j]];
                        }
                        self.p_t[[a, b]] = acc;
                    }
                }
                let skipped = dense_sym_factor(self.p_t.slice_mut(ndarray::s![..k, ..k]));
                if skipped > 0 {
                    self.stats.numerical_recoveries += skipped;
                }

                // u = Q·H_t·g_t,  y = Q·h_t
                for a in 0..k {
                    let mut acc = 0.0;
                    for j in 0..m {
                        acc += self.jac_t[[a, j]] * self.g[[t, j]];
                    }
                    self.u[a] = acc;
                }
                dense_sym_solve(
                    self.p_t.slice(ndarray::s![..k, ..k]),
                    self.u.slice_mut(ndarray::s![..k]),
                );
                for a in 0..k {
                    self.y[a] = self.h_t[a];
                }
                dense_sym_solve(
                    self.p_t.slice(ndarray::s![..k, ..k]),
                    self.y.slice_mut(ndarray::s![..k]),
                );

                // δ_t = −α·(I − H_tᵀQH_t)·g_t − H_tᵀQ·h_t
                for j in 0..m {
                    let mut ju = 0.0;
                    let mut jy = 0.0;
                    for a in 0..k {
                        ju += self.jac_t[[a, j]] * self.u[a];
                        jy += self.jac_t[[a, j]] * self.y[a];
                    }
                    self.delta_t[j] = -alpha * (self.g[[t, j]] - ju) - jy;
                }
            }

            self.problem.update_trajectory_row(self.delta_t.view(), t);
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
