//! The smoothness metric: a banded SPD Gram matrix of a finite-difference
//! operator, stored in skyline form (N×(b+1) lower band, diagonal in the
//! last column), with an in-place skyline Cholesky and banded triangular
//! solves.
//!
//! Also hosts the small dense symmetric solver used for the k×k
//! constraint system H·A⁻¹·Hᵀ.

use crate::types::{ChompError, ObjectiveType};
use ndarray::{Array2, ArrayView2, ArrayViewMut1, ArrayViewMut2};

/// Which flavor of the difference operator to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricVariant {
    /// Zero Dirichlet boundaries at both ends.
    Standard,
    /// Free final waypoint (goal-set mode): the right boundary rows are
    /// replaced by a single first-difference closing row.
    Goalset,
}

// ─────────────────────────────────────────────────────────────
//  Difference-row enumeration
// ─────────────────────────────────────────────────────────────

// One row of the difference operator D, clipped to the interior columns.
// At most three entries (second-difference stencil).
struct DiffRow {
    cols: [usize; 3],
    vals: [f64; 3],
    len: usize,
}

impl DiffRow {
    fn clipped(n: usize, entries: &[(isize, f64)]) -> Self {
        let mut cols = [0usize; 3];
        let mut vals = [0.0f64; 3];
        let mut len = 0;
        for &(c, v) in entries {
            if c >= 0 && (c as usize) < n {
                cols[len] = c as usize;
                vals[len] = v;
                len += 1;
            }
        }
        Self { cols, vals, len }
    }
}

fn difference_rows(n: usize, objective: ObjectiveType, variant: MetricVariant) -> Vec<DiffRow> {
    let mut rows = Vec::new();
    match objective {
        ObjectiveType::MinimizeVelocity => {
            // First differences across every gap; in goal-set mode the
            // final gap (to the absent right boundary) does not exist.
            let last = match variant {
                MetricVariant::Standard => n,
                MetricVariant::Goalset => n - 1,
            };
            for t in 0..=last {
                let t = t as isize;
                rows.push(DiffRow::clipped(n, &[(t - 1, -1.0), (t, 1.0)]));
            }
        }
        ObjectiveType::MinimizeAcceleration => {
            // Second differences centered at each interior waypoint.  In
            // goal-set mode the row centered at the last waypoint has no
            // right neighbor; a first-difference row closes the operator.
            let last = match variant {
                MetricVariant::Standard => n,
                MetricVariant::Goalset => n - 1,
            };
            for t in 0..last {
                let t = t as isize;
                rows.push(DiffRow::clipped(n, &[(t - 1, 1.0), (t, -2.0), (t + 1, 1.0)]));
            }
            if variant == MetricVariant::Goalset {
                let t = n as isize - 1;
                rows.push(DiffRow::clipped(n, &[(t - 1, -1.0), (t, 1.0)]));
            }
        }
    }
    rows
}

// Dense (small-n) Gram entry accumulation into a band matrix.
fn gram_band(n: usize, hb: usize, weight: f64, rows: &[DiffRow]) -> Array2<f64> {
    let mut band = Array2::zeros((n, hb + 1));
    for row in rows {
        for a in 0..row.len {
            for b in 0..row.len {
                let (i, j) = (row.cols[a], row.cols[b]);
                if i >= j && i - j <= hb {
                    band[[i, hb - (i - j)]] += weight * row.vals[a] * row.vals[b];
                }
            }
        }
    }
    band
}

// ─────────────────────────────────────────────────────────────
//  Metric
// ─────────────────────────────────────────────────────────────

/// Banded SPD smoothness operator A with its skyline Cholesky factor.
///
/// Both A and L are stored as N×(b+1) lower bands with the diagonal in
/// the last column.  All solves run in place on N×M right-hand sides,
/// column-block by row, in O(N·M·b).
#[derive(Debug, Clone)]
pub struct Metric {
    band: Array2<f64>,
    chol: Array2<f64>,
    halfband: usize,
}

impl Metric {
    /// Build and factor the metric for `n` waypoints at timestep `dt`.
    ///
    /// The Δt weight is 1/Δt² for the velocity objective and 1/Δt⁴ for
    /// acceleration.
    pub fn new(
        n: usize,
        objective: ObjectiveType,
        dt: f64,
        variant: MetricVariant,
    ) -> Result<Self, ChompError> {
        let hb = objective.half_bandwidth().min(n.saturating_sub(1));
        let rows = difference_rows(n, objective, variant);
        let band = gram_band(n, hb, smoothness_weight(objective, dt), &rows);
        Self::factor(band, hb)
    }

    /// The metric of the even-row subsample view: the even-index
    /// principal submatrix of the full operator.  Velocity collapses to
    /// a diagonal, acceleration to a tridiagonal band.
    pub fn new_subsampled(
        n_full: usize,
        objective: ObjectiveType,
        dt: f64,
    ) -> Result<Self, ChompError> {
        let hb_full = objective.half_bandwidth().min(n_full.saturating_sub(1));
        let rows = difference_rows(n_full, objective, MetricVariant::Standard);
        let full = gram_band(n_full, hb_full, smoothness_weight(objective, dt), &rows);

        let n_sub = (n_full + 1) / 2;
        let hb_sub = hb_full / 2;
        let mut band = Array2::zeros((n_sub, hb_sub + 1));
        for i in 0..n_sub {
            for d in 0..=hb_sub.min(i) {
                let (fi, fj) = (2 * i, 2 * (i - d));
                // distance 2d in the full band
                if fi - fj <= hb_full {
                    band[[i, hb_sub - d]] = full[[fi, hb_full - (fi - fj)]];
                }
            }
        }
        Self::factor(band, hb_sub)
    }

    fn factor(band: Array2<f64>, hb: usize) -> Result<Self, ChompError> {
        let n = band.nrows();
        let mut chol = band.clone();
        for i in 0..n {
            let jmin = i.saturating_sub(hb);
            for j in jmin..=i {
                let kmin = jmin.max(j.saturating_sub(hb));
                let mut s = chol[[i, hb - (i - j)]];
                for k in kmin..j {
                    s -= chol[[i, hb - (i - k)]] * chol[[j, hb - (j - k)]];
                }
                if i == j {
                    if s <= 0.0 {
                        return Err(ChompError::NotPositiveDefinite { row: i });
                    }
                    chol[[i, hb]] = s.sqrt();
                } else {
                    chol[[i, hb - (i - j)]] = s / chol[[j, hb]];
                }
            }
        }
        Ok(Self { band, chol, halfband: hb })
    }

    pub fn n(&self) -> usize {
        self.band.nrows()
    }

    pub fn half_bandwidth(&self) -> usize {
        self.halfband
    }

    /// A(i, j), zero outside the band.
    pub fn entry(&self, i: usize, j: usize) -> f64 {
        let (lo, hi) = if i >= j { (j, i) } else { (i, j) };
        if hi - lo > self.halfband {
            0.0
        } else {
            self.band[[hi, self.halfband - (hi - lo)]]
        }
    }

    #[inline]
    fn l(&self, i: usize, j: usize) -> f64 {
        self.chol[[i, self.halfband - (i - j)]]
    }

    // ── Banded products ────────────────────────────────────

    /// out = A·x, row-block banded matvec.
    pub fn multiply_into(&self, x: &Array2<f64>, out: &mut Array2<f64>) {
        let n = self.n();
        let m = x.ncols();
        let hb = self.halfband;
        for i in 0..n {
            let jmin = i.saturating_sub(hb);
            let jmax = (i + hb).min(n - 1);
            for c in 0..m {
                let mut s = 0.0;
                for j in jmin..=jmax {
                    s += self.entry(i, j) * x[[j, c]];
                }
                out[[i, c]] = s;
            }
        }
    }

    /// x ← L·x (in place; rows are processed bottom-up so each reads
    /// only rows not yet rewritten).
    pub fn multiply_lower(&self, x: &mut Array2<f64>) {
        let n = self.n();
        let m = x.ncols();
        let hb = self.halfband;
        for i in (0..n).rev() {
            let jmin = i.saturating_sub(hb);
            for c in 0..m {
                let mut s = self.l(i, i) * x[[i, c]];
                for j in jmin..i {
                    s += self.l(i, j) * x[[j, c]];
                }
                x[[i, c]] = s;
            }
        }
    }

    /// x ← Lᵀ·x (in place, top-down).
    pub fn multiply_lower_transpose(&self, x: &mut Array2<f64>) {
        let n = self.n();
        let m = x.ncols();
        let hb = self.halfband;
        for i in 0..n {
            let jmax = (i + hb).min(n - 1);
            for c in 0..m {
                let mut s = self.l(i, i) * x[[i, c]];
                for j in (i + 1)..=jmax {
                    s += self.l(j, i) * x[[j, c]];
                }
                x[[i, c]] = s;
            }
        }
    }

    // ── Triangular solves ──────────────────────────────────

    /// x ← L⁻¹·x (forward substitution only; transforms a gradient into
    /// covariant coordinates).
    pub fn multiply_lower_inverse(&self, x: &mut Array2<f64>) {
        let n = self.n();
        let m = x.ncols();
        let hb = self.halfband;
        for i in 0..n {
            let jmin = i.saturating_sub(hb);
            for c in 0..m {
                let mut s = x[[i, c]];
                for j in jmin..i {
                    s -= self.l(i, j) * x[[j, c]];
                }
                x[[i, c]] = s / self.l(i, i);
            }
        }
    }

    /// x ← L⁻ᵀ·x (back substitution only; maps covariant coordinates
    /// back to waypoints).
    pub fn multiply_lower_transpose_inverse(&self, x: &mut Array2<f64>) {
        let n = self.n();
        let m = x.ncols();
        let hb = self.halfband;
        for i in (0..n).rev() {
            let jmax = (i + hb).min(n - 1);
            for c in 0..m {
                let mut s = x[[i, c]];
                for j in (i + 1)..=jmax {
                    s -= self.l(j, i) * x[[j, c]];
                }
                x[[i, c]] = s / self.l(i, i);
            }
        }
    }

    /// x ← A⁻¹·x: forward then back substitution, in place.
    pub fn solve(&self, x: &mut Array2<f64>) {
        self.multiply_lower_inverse(x);
        self.multiply_lower_transpose_inverse(x);
    }
}

fn smoothness_weight(objective: ObjectiveType, dt: f64) -> f64 {
    let inv_dt = 1.0 / dt;
    match objective {
        ObjectiveType::MinimizeVelocity => inv_dt * inv_dt,
        ObjectiveType::MinimizeAcceleration => inv_dt * inv_dt * inv_dt * inv_dt,
    }
}

// ─────────────────────────────────────────────────────────────
//  Small dense symmetric solver  (for H·A⁻¹·Hᵀ and H·Hᵀ)
// ─────────────────────────────────────────────────────────────

/// In-place LDLᵀ factorization of a small dense symmetric matrix.
///
/// Only the lower triangle is read.  After the call, the strict lower
/// triangle holds L (unit diagonal implied) and the diagonal holds D.
/// Near-zero pivots are zeroed out and skipped, which drops the
/// corresponding solution component (a minimum-norm fallback for rank-
/// deficient constraint systems).  Returns the number of skipped pivots.
pub fn dense_sym_factor(mut a: ArrayViewMut2<f64>) -> usize {
    let k = a.nrows();
    let mut scale = 0.0f64;
    for i in 0..k {
        scale = scale.max(a[[i, i]].abs());
    }
    let tol = scale * 1e-12 + f64::MIN_POSITIVE;

    let mut skipped = 0;
    for j in 0..k {
        let mut d = a[[j, j]];
        for r in 0..j {
            d -= a[[j, r]] * a[[j, r]] * a[[r, r]];
        }
        if d.abs() <= tol {
            a[[j, j]] = 0.0;
            skipped += 1;
        } else {
            a[[j, j]] = d;
        }
        for i in (j + 1)..k {
            let mut v = a[[i, j]];
            for r in 0..j {
                v -= a[[i, r]] * a[[j, r]] * a[[r, r]];
            }
            a[[i, j]] = if a[[j, j]] != 0.0 { v / a[[j, j]] } else { 0.0 };
        }
    }
    skipped
}

/// Solve (L·D·Lᵀ)·x = b in place, using a factorization produced by
/// [`dense_sym_factor`].  Zeroed pivots contribute nothing.
pub fn dense_sym_solve(a: ArrayView2<f64>, mut x: ArrayViewMut1<f64>) {
    let k = a.nrows();
    for i in 0..k {
        let mut s = x[i];
        for j in 0..i {
            s -= a[[i, j]] * x[j];
        }
        x[i] = s;
    }
    for i in 0..k {
        x[i] = if a[[i, i]] != 0.0 { x[i] / a[[i, i]] } else { 0.0 };
    }
    for i in (0..k).rev() {
        let mut s = x[i];
        for j in (i + 1)..k {
            s -= a[[j, i]] * x[j];
        }
        x[i] = s;
    }
}
