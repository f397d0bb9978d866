//! Properties of the banded smoothness operator and its skyline
//! Cholesky: solve/multiply round trips, boundary-vector consistency,
//! goal-set and subsampled variants, and the small dense LDLᵀ helper.

use chomp::metric::{dense_sym_factor, dense_sym_solve, Metric, MetricVariant};
use chomp::smoothness::SmoothnessFunction;
use chomp::trajectory::Trajectory;
use chomp::types::ObjectiveType;
use ndarray::{Array1, Array2};

fn endpoints_1d(a: f64, b: f64) -> (Array2<f64>, Array2<f64>) {
    (
        Array2::from_shape_vec((1, 1), vec![a]).unwrap(),
        Array2::from_shape_vec((1, 1), vec![b]).unwrap(),
    )
}

// deterministic pseudo-random fill, no RNG state needed
fn wiggle(n: usize, m: usize) -> Array2<f64> {
    let mut x = Array2::zeros((n, m));
    for i in 0..n {
        for j in 0..m {
            x[[i, j]] = ((i * 31 + j * 17 + 7) % 13) as f64 / 13.0 - 0.5;
        }
    }
    x
}

// ─────────────────────────────────────────────────────────────
//  Solve / multiply round trips
// ─────────────────────────────────────────────────────────────

/// multiply(solve(x)) == x for both objectives at several sizes.
#[test]
fn solve_is_inverse_of_multiply() {
    for &objective in &[ObjectiveType::MinimizeVelocity, ObjectiveType::MinimizeAcceleration] {
        for &n in &[1usize, 2, 3, 5, 17, 64] {
            let metric = Metric::new(n, objective, 0.1, MetricVariant::Standard).unwrap();
            let x = wiggle(n, 3);
            let mut y = x.clone();
            metric.solve(&mut y);
            let mut z = Array2::zeros((n, 3));
            metric.multiply_into(&y, &mut z);
            for (a, b) in x.iter().zip(z.iter()) {
                assert!(
                    (a - b).abs() < 1e-8 * (1.0 + a.abs()),
                    "{objective:?} n={n}: {a} vs {b}"
                );
            }
        }
    }
}

/// The two triangular solves compose to the full solve, and the lower
/// products invert the lower solves.
#[test]
fn triangular_solves_compose() {
    let n = 11;
    let metric = Metric::new(n, ObjectiveType::MinimizeAcceleration, 0.25, MetricVariant::Standard)
        .unwrap();
    let x = wiggle(n, 2);

    let mut full = x.clone();
    metric.solve(&mut full);

    let mut staged = x.clone();
    metric.multiply_lower_inverse(&mut staged);
    metric.multiply_lower_transpose_inverse(&mut staged);
    for (a, b) in full.iter().zip(staged.iter()) {
        assert!((a - b).abs() < 1e-12);
    }

    let mut roundtrip = x.clone();
    metric.multiply_lower_inverse(&mut roundtrip);
    metric.multiply_lower(&mut roundtrip);
    for (a, b) in x.iter().zip(roundtrip.iter()) {
        assert!((a - b).abs() < 1e-10, "L·L⁻¹ should be identity: {a} vs {b}");
    }

    let mut roundtrip_t = x.clone();
    metric.multiply_lower_transpose(&mut roundtrip_t);
    metric.multiply_lower_transpose_inverse(&mut roundtrip_t);
    for (a, b) in x.iter().zip(roundtrip_t.iter()) {
        assert!((a - b).abs() < 1e-10);
    }
}

/// L·Lᵀ reproduces A.
#[test]
fn cholesky_reconstructs_operator() {
    let n = 9;
    let metric =
        Metric::new(n, ObjectiveType::MinimizeAcceleration, 0.5, MetricVariant::Standard).unwrap();
    let x = wiggle(n, 1);
    let mut ax = Array2::zeros((n, 1));
    metric.multiply_into(&x, &mut ax);

    let mut llt = x.clone();
    metric.multiply_lower_transpose(&mut llt);
    metric.multiply_lower(&mut llt);
    for (a, b) in ax.iter().zip(llt.iter()) {
        assert!((a - b).abs() < 1e-10 * (1.0 + a.abs()));
    }
}

// ─────────────────────────────────────────────────────────────
//  Band structure
// ─────────────────────────────────────────────────────────────

/// Velocity metric is tridiag(−1, 2, −1)·w with w = 1/Δt².
#[test]
fn velocity_band_values() {
    let n = 6;
    let dt = 0.5;
    let w = 1.0 / (dt * dt);
    let metric = Metric::new(n, ObjectiveType::MinimizeVelocity, dt, MetricVariant::Standard)
        .unwrap();
    for i in 0..n {
        assert!((metric.entry(i, i) - 2.0 * w).abs() < 1e-12);
        if i > 0 {
            assert!((metric.entry(i, i - 1) + w).abs() < 1e-12);
        }
        if i > 1 {
            assert_eq!(metric.entry(i, i - 2), 0.0);
        }
    }
}

/// Acceleration metric is the Dirichlet biharmonic band: diagonal
/// (5, 6, …, 6, 5), first off-diagonal −4, second off-diagonal 1.
#[test]
fn acceleration_band_values() {
    let n = 7;
    let metric =
        Metric::new(n, ObjectiveType::MinimizeAcceleration, 1.0, MetricVariant::Standard).unwrap();
    for i in 0..n {
        let expected_diag = if i == 0 || i == n - 1 { 5.0 } else { 6.0 };
        assert!((metric.entry(i, i) - expected_diag).abs() < 1e-12, "diag {i}");
        if i > 0 {
            assert!((metric.entry(i, i - 1) + 4.0).abs() < 1e-12, "off1 {i}");
        }
        if i > 1 {
            assert!((metric.entry(i, i - 2) - 1.0).abs() < 1e-12, "off2 {i}");
        }
    }
}

/// Goal-set variants free the last waypoint: the velocity diagonal drops
/// to 1·w there, and acceleration ends in the block [[6, −3], [−3, 2]].
#[test]
fn goalset_band_values() {
    let n = 6;
    let vel = Metric::new(n, ObjectiveType::MinimizeVelocity, 1.0, MetricVariant::Goalset).unwrap();
    assert!((vel.entry(n - 1, n - 1) - 1.0).abs() < 1e-12);
    assert!((vel.entry(n - 2, n - 2) - 2.0).abs() < 1e-12);
    assert!((vel.entry(n - 1, n - 2) + 1.0).abs() < 1e-12);

    let acc =
        Metric::new(n, ObjectiveType::MinimizeAcceleration, 1.0, MetricVariant::Goalset).unwrap();
    assert!((acc.entry(n - 2, n - 2) - 6.0).abs() < 1e-12);
    assert!((acc.entry(n - 1, n - 1) - 2.0).abs() < 1e-12);
    assert!((acc.entry(n - 1, n - 2) + 3.0).abs() < 1e-12);
}

/// The subsampled metric is the even-index principal submatrix of the
/// full operator.
#[test]
fn subsampled_is_principal_submatrix() {
    for &objective in &[ObjectiveType::MinimizeVelocity, ObjectiveType::MinimizeAcceleration] {
        let n = 11;
        let dt = 0.2;
        let full = Metric::new(n, objective, dt, MetricVariant::Standard).unwrap();
        let sub = Metric::new_subsampled(n, objective, dt).unwrap();
        let n_sub = (n + 1) / 2;
        assert_eq!(sub.n(), n_sub);
        for i in 0..n_sub {
            for j in 0..n_sub {
                assert!(
                    (sub.entry(i, j) - full.entry(2 * i, 2 * j)).abs() < 1e-12,
                    "{objective:?} ({i},{j})"
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Boundary vector
// ─────────────────────────────────────────────────────────────

/// For the acceleration objective, A applied to the straight line
/// between the endpoints equals −b exactly: linear interpolation is the
/// unconstrained minimum.
#[test]
fn linear_trajectory_is_acceleration_minimum() {
    let n = 6;
    let (q0, q1) = endpoints_1d(2.0, -1.0);
    let trajectory = Trajectory::initialize(q0, q1, n, 1.0).unwrap();
    let metric = Metric::new(
        n,
        ObjectiveType::MinimizeAcceleration,
        trajectory.dt(),
        MetricVariant::Standard,
    )
    .unwrap();
    let mut smoothness = SmoothnessFunction::new();
    smoothness.prepare(&trajectory, ObjectiveType::MinimizeAcceleration, false);

    let mut ax = Array2::zeros((n, 1));
    metric.multiply_into(trajectory.matrix(), &mut ax);
    let b = smoothness.boundary_vector();
    for i in 0..n {
        assert!(
            (ax[[i, 0]] + b[[i, 0]]).abs() < 1e-6 * (1.0 + ax[[i, 0]].abs()),
            "row {i}: Aξ = {}, b = {}",
            ax[[i, 0]],
            b[[i, 0]]
        );
    }
}

/// Same property for the velocity objective.
#[test]
fn linear_trajectory_is_velocity_minimum() {
    let n = 9;
    let (q0, q1) = endpoints_1d(-0.5, 3.5);
    let trajectory = Trajectory::initialize(q0, q1, n, 2.0).unwrap();
    let metric = Metric::new(
        n,
        ObjectiveType::MinimizeVelocity,
        trajectory.dt(),
        MetricVariant::Standard,
    )
    .unwrap();
    let mut smoothness = SmoothnessFunction::new();
    smoothness.prepare(&trajectory, ObjectiveType::MinimizeVelocity, false);

    let mut ax = Array2::zeros((n, 1));
    metric.multiply_into(trajectory.matrix(), &mut ax);
    let b = smoothness.boundary_vector();
    for i in 0..n {
        assert!((ax[[i, 0]] + b[[i, 0]]).abs() < 1e-6 * (1.0 + ax[[i, 0]].abs()));
    }
}

// ─────────────────────────────────────────────────────────────
//  Dense symmetric solver
// ─────────────────────────────────────────────────────────────

#[test]
fn dense_ldlt_solves_spd_system() {
    // S = Mᵀ·M + I for a fixed 3×3 M
    let m = Array2::from_shape_vec((3, 3), vec![2.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0])
        .unwrap();
    let mut s = Array2::zeros((3, 3));
    for i in 0..3 {
        for j in 0..3 {
            let mut acc = if i == j { 1.0 } else { 0.0 };
            for k in 0..3 {
                acc += m[[k, i]] * m[[k, j]];
            }
            s[[i, j]] = acc;
        }
    }
    let x_true = Array1::from_vec(vec![1.0, -2.0, 0.5]);
    let mut rhs = Array1::zeros(3);
    for i in 0..3 {
        for j in 0..3 {
            rhs[i] += s[[i, j]] * x_true[j];
        }
    }

    let skipped = dense_sym_factor(s.view_mut());
    assert_eq!(skipped, 0);
    dense_sym_solve(s.view(), rhs.view_mut());
    for i in 0..3 {
        assert!((rhs[i] - x_true[i]).abs() < 1e-10);
    }
}

/// A rank-deficient system drops pivots instead of failing, and the
/// surviving components still solve their subsystem.
#[test]
fn dense_ldlt_skips_singular_pivots() {
    // rank-1 outer product: only one meaningful pivot
    let v = [1.0, 2.0, -1.0];
    let mut s = Array2::zeros((3, 3));
    for i in 0..3 {
        for j in 0..3 {
            s[[i, j]] = v[i] * v[j];
        }
    }
    let mut rhs = Array1::from_vec(vec![v[0] * 3.0, v[1] * 3.0, v[2] * 3.0]);

    let skipped = dense_sym_factor(s.view_mut());
    assert_eq!(skipped, 2, "two of three pivots should be dropped");
    dense_sym_solve(s.view(), rhs.view_mut());
    for x in rhs.iter() {
        assert!(x.is_finite());
    }
}
