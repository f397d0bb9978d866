//! Hamiltonian Monte Carlo kick: stochastic momentum resampling with a
//! Metropolis accept/reject against the last accepted state, used to
//! shake the optimizer out of shallow local minima.
//!
//! Resample events fire at exponentially distributed iteration gaps; the
//! inverse temperature grows geometrically so the chain anneals toward
//! pure descent.  Any numerical instability is treated as a reject.

use crate::metric::Metric;
use crate::trajectory::Trajectory;
use crate::types::{HmcSettings, RunStats};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

pub struct Hmc {
    settings: HmcSettings,
    rng: ChaCha8Rng,
    beta: f64,
    next_resample: usize,
    /// Hamiltonian (objective + kinetic) of the last accepted state.
    accepted_total: f64,
    /// Plain objective of the last accepted state, handed back to the
    /// optimizer when the snapshot is restored.
    accepted_objective: f64,
    snapshot: Option<Array2<f64>>,
    scratch: Array2<f64>,
}

impl Hmc {
    pub fn new(settings: HmcSettings) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        let beta = settings.beta0;
        Self {
            settings,
            rng,
            beta,
            next_resample: 0,
            accepted_total: f64::INFINITY,
            accepted_objective: f64::INFINITY,
            snapshot: None,
            scratch: Array2::zeros((0, 0)),
        }
    }

    /// Reset the schedule at the start of a resolution level.
    pub fn setup_run(&mut self) {
        self.beta = self.settings.beta0;
        self.next_resample = 0;
        self.accepted_total = f64::INFINITY;
        self.accepted_objective = f64::INFINITY;
        self.snapshot = None;
    }

    /// Called at the start of each global iteration (only at
    /// non-subsampled levels).  On a resample event, Metropolis-checks
    /// the current state against the last accepted one, restoring the
    /// snapshot on reject, then draws a fresh momentum from N(0, A⁻¹/β).
    ///
    /// Returns the objective the optimizer should treat as current when
    /// the trajectory was restored.
    pub fn iteration(
        &mut self,
        iter: usize,
        trajectory: &mut Trajectory,
        momentum: &mut Array2<f64>,
        metric: &Metric,
        cur_objective: f64,
        stats: &mut RunStats,
    ) -> Option<f64> {
        if iter < self.next_resample {
            return None;
        }

        let kinetic = self.kinetic_energy(momentum, metric);
        let total = cur_objective + kinetic;

        let mut restored = None;
        let accept = if !total.is_finite() {
            false
        } else if total <= self.accepted_total {
            true
        } else {
            let u: f64 = self.rng.gen();
            u < (-self.beta * (total - self.accepted_total)).exp()
        };

        if accept {
            stats.hmc_accepts += 1;
            self.accepted_total = total;
            self.accepted_objective = cur_objective;
            match &mut self.snapshot {
                Some(s) => s.assign(trajectory.matrix()),
                None => self.snapshot = Some(trajectory.matrix().clone()),
            }
        } else {
            stats.hmc_rejects += 1;
            if let Some(s) = &self.snapshot {
                trajectory.assign_matrix(s);
                restored = Some(self.accepted_objective);
            }
        }

        self.resample_momentum(momentum, metric);
        self.beta *= self.settings.beta_growth;

        // next event after an Exp(lambda)-distributed gap
        let u: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let gap = (-u.ln() / self.settings.lambda).ceil().max(1.0) as usize;
        self.next_resample = iter + gap;

        restored
    }

    // p = L⁻ᵀ z / √β  for standard-normal z, so Cov(p) = A⁻¹/β.
    fn resample_momentum(&mut self, momentum: &mut Array2<f64>, metric: &Metric) {
        let (n, m) = momentum.dim();
        if self.scratch.dim() != (n, m) {
            self.scratch = Array2::zeros((n, m));
        }
        let sigma = 1.0 / self.beta.sqrt();
        for v in self.scratch.iter_mut() {
            let z: f64 = self.rng.sample(StandardNormal);
            *v = z * sigma;
        }
        metric.multiply_lower_transpose_inverse(&mut self.scratch);
        momentum.assign(&self.scratch);
    }

    // ½·pᵀAp, the kinetic part of the Hamiltonian.
    fn kinetic_energy(&mut self, momentum: &Array2<f64>, metric: &Metric) -> f64 {
        let (n, m) = momentum.dim();
        if self.scratch.dim() != (n, m) {
            self.scratch = Array2::zeros((n, m));
        }
        metric.multiply_into(momentum, &mut self.scratch);
        let mut e = 0.0;
        for (p, ap) in momentum.iter().zip(self.scratch.iter()) {
            e += 0.5 * p * ap;
        }
        e
    }
}
