//! Finite-difference checks of the analytic gradients: smoothness,
//! collision, the combined objective, and the constraint Jacobians.
//! Every component of each analytic gradient is compared against a
//! central-difference estimate
//!
//!     dE/dξᵢ  ≈  [ E(ξ + h·eᵢ) − E(ξ − h·eᵢ) ] / 2h

use chomp::collision::{CollisionFunction, CollisionIntegrator};
use chomp::constraint::Constraint;
use chomp::metric::{Metric, MetricVariant};
use chomp::problem::ProblemDescription;
use chomp::smoothness::SmoothnessFunction;
use chomp::trajectory::Trajectory;
use chomp::types::ObjectiveType;
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, ArrayViewMut2};

const FD_H: f64 = 1e-6;

// ─────────────────────────────────────────────────────────────
//  Test collaborators
// ─────────────────────────────────────────────────────────────

/// Workspace = configuration space; cost is a Gaussian bump.
struct GaussianBump {
    center: [f64; 2],
}

impl CollisionFunction for GaussianBump {
    fn workspace_dim(&self) -> usize {
        2
    }

    fn num_bodies(&self) -> usize {
        1
    }

    fn workspace_position(&self, q: ArrayView1<f64>, _body: usize, x: &mut Array1<f64>) {
        x[0] = q[0];
        x[1] = q[1];
    }

    fn evaluate(
        &self,
        q: ArrayView1<f64>,
        _body: usize,
        x: &mut Array1<f64>,
        jacobian: &mut Array2<f64>,
        gradient: &mut Array1<f64>,
    ) -> f64 {
        x[0] = q[0];
        x[1] = q[1];
        jacobian.fill(0.0);
        jacobian[[0, 0]] = 1.0;
        jacobian[[1, 1]] = 1.0;
        let dx = x[0] - self.center[0];
        let dy = x[1] - self.center[1];
        let cost = (-(dx * dx + dy * dy)).exp();
        gradient[0] = -2.0 * dx * cost;
        gradient[1] = -2.0 * dy * cost;
        cost
    }
}

/// Pin a waypoint to a target point (k = target dimension).
struct PinPoint {
    target: Vec<f64>,
}

impl Constraint for PinPoint {
    fn num_outputs(&self) -> usize {
        self.target.len()
    }

    fn evaluate(&self, q: ArrayView1<f64>, mut h: ArrayViewMut1<f64>, mut jac: ArrayViewMut2<f64>) {
        jac.fill(0.0);
        for (i, &t) in self.target.iter().enumerate() {
            h[i] = q[i] - t;
            jac[[i, i]] = 1.0;
        }
    }
}

fn bent_trajectory(n: usize, m: usize) -> Array2<f64> {
    let mut xi = Array2::zeros((n, m));
    for t in 0..n {
        let s = (t + 1) as f64 / (n + 1) as f64;
        for j in 0..m {
            xi[[t, j]] = s + 0.3 * (s * std::f64::consts::PI * (j + 1) as f64).sin();
        }
    }
    xi
}

fn endpoints(m: usize, a: f64, b: f64) -> (Array2<f64>, Array2<f64>) {
    (
        Array2::from_elem((1, m), a),
        Array2::from_elem((1, m), b),
    )
}

// ─────────────────────────────────────────────────────────────
//  Smoothness gradient
// ─────────────────────────────────────────────────────────────

fn smoothness_value(
    xi: &Array2<f64>,
    q0: &Array2<f64>,
    q1: &Array2<f64>,
    objective: ObjectiveType,
) -> f64 {
    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let metric =
        Metric::new(xi.nrows(), objective, trajectory.dt(), MetricVariant::Standard).unwrap();
    let mut smoothness = SmoothnessFunction::new();
    smoothness.prepare(&trajectory, objective, false);
    smoothness.evaluate(&trajectory, &metric)
}

#[test]
fn smoothness_gradient_matches_finite_differences() {
    for &objective in &[ObjectiveType::MinimizeVelocity, ObjectiveType::MinimizeAcceleration] {
        let (n, m) = (6, 2);
        let (q0, q1) = endpoints(m, 0.0, 1.0);
        let xi = bent_trajectory(n, m);

        let trajectory =
            Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
        let metric = Metric::new(n, objective, trajectory.dt(), MetricVariant::Standard).unwrap();
        let mut smoothness = SmoothnessFunction::new();
        smoothness.prepare(&trajectory, objective, false);
        let mut g = Array2::zeros((n, m));
        smoothness.evaluate_with_gradient(&trajectory, &metric, &mut g);

        for t in 0..n {
            for j in 0..m {
                let mut plus = xi.clone();
                let mut minus = xi.clone();
                plus[[t, j]] += FD_H;
                minus[[t, j]] -= FD_H;
                let fd = (smoothness_value(&plus, &q0, &q1, objective)
                    - smoothness_value(&minus, &q0, &q1, objective))
                    / (2.0 * FD_H);
                assert!(
                    (g[[t, j]] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                    "{objective:?} ({t},{j}): analytic {} vs fd {}",
                    g[[t, j]],
                    fd
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Collision gradient
// ─────────────────────────────────────────────────────────────

// The CHOMP obstacle functional differentiates only the cost term; the
// arc-length weight γ‖ẋ‖Δt is held at its current value.  The finite-
// difference reference therefore evaluates Σ_t w_t·c(ξ_t) with the
// weights w_t frozen at the unperturbed trajectory.
fn frozen_weights(xi: &Array2<f64>, q0: &Array2<f64>, q1: &Array2<f64>, gamma: f64) -> Vec<f64> {
    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let n = xi.nrows() as isize;
    let dt = trajectory.dt();
    let mut weights = Vec::new();
    for t in 0..n {
        let prev = trajectory.tick_border_repeat(t - 1);
        let next = trajectory.tick_border_repeat(t + 1);
        let mut speed_sq = 0.0;
        for d in 0..2 {
            let v = (next[d] - prev[d]) * 0.5 / dt;
            speed_sq += v * v;
        }
        weights.push(gamma * speed_sq.sqrt() * dt);
    }
    weights
}

fn frozen_collision_value(xi: &Array2<f64>, weights: &[f64], center: [f64; 2]) -> f64 {
    let mut total = 0.0;
    for (t, &w) in weights.iter().enumerate() {
        let dx = xi[[t, 0]] - center[0];
        let dy = xi[[t, 1]] - center[1];
        total += w * (-(dx * dx + dy * dy)).exp();
    }
    total
}

#[test]
fn collision_gradient_matches_finite_differences() {
    let (n, m) = (7, 2);
    let gamma = 0.5;
    let center = [0.4, 0.6];
    let (q0, q1) = endpoints(m, 0.0, 1.0);
    let xi = bent_trajectory(n, m);

    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let bump = GaussianBump { center };
    let mut integrator = CollisionIntegrator::new();
    let mut g = Array2::zeros((n, m));
    let value = integrator.evaluate(&bump, &trajectory, gamma, Some(&mut g));

    let weights = frozen_weights(&xi, &q0, &q1, gamma);
    assert!(
        (value - frozen_collision_value(&xi, &weights, center)).abs() < 1e-12,
        "integrated cost disagrees with the reference sum"
    );

    for t in 0..n {
        for j in 0..m {
            let mut plus = xi.clone();
            let mut minus = xi.clone();
            plus[[t, j]] += FD_H;
            minus[[t, j]] -= FD_H;
            let fd = (frozen_collision_value(&plus, &weights, center)
                - frozen_collision_value(&minus, &weights, center))
                / (2.0 * FD_H);
            assert!(
                (g[[t, j]] - fd).abs() < 1e-5 * (1.0 + fd.abs()),
                "({t},{j}): analytic {} vs fd {}",
                g[[t, j]],
                fd
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Combined objective through ProblemDescription
// ─────────────────────────────────────────────────────────────

fn smooth_problem_value(xi: &Array2<f64>, q0: &Array2<f64>, q1: &Array2<f64>) -> f64 {
    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let mut problem = ProblemDescription::new(trajectory, ObjectiveType::MinimizeVelocity);
    problem.evaluate_objective(None).unwrap()
}

/// Without collision the problem-level gradient is exactly Aξ + b.
#[test]
fn problem_gradient_matches_finite_differences() {
    let (n, m) = (5, 2);
    let (q0, q1) = endpoints(m, 0.0, 1.0);
    let xi = bent_trajectory(n, m);

    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let mut problem = ProblemDescription::new(trajectory, ObjectiveType::MinimizeVelocity);
    let mut g = Array2::zeros((n, m));
    problem.evaluate_objective(Some(&mut g)).unwrap();

    for t in 0..n {
        for j in 0..m {
            let mut plus = xi.clone();
            let mut minus = xi.clone();
            plus[[t, j]] += FD_H;
            minus[[t, j]] -= FD_H;
            let fd = (smooth_problem_value(&plus, &q0, &q1)
                - smooth_problem_value(&minus, &q0, &q1))
                / (2.0 * FD_H);
            assert!(
                (g[[t, j]] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
                "({t},{j}): analytic {} vs fd {}",
                g[[t, j]],
                fd
            );
        }
    }
}

/// With a collision function attached, the objective and gradient both
/// pick up the obstacle term.
#[test]
fn collision_term_contributes_to_problem_gradient() {
    let (n, m) = (5, 2);
    let (q0, q1) = endpoints(m, 0.0, 1.0);
    let xi = bent_trajectory(n, m);

    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let mut smooth_only = ProblemDescription::new(trajectory, ObjectiveType::MinimizeVelocity);
    let mut g_smooth = Array2::zeros((n, m));
    let e_smooth = smooth_only.evaluate_objective(Some(&mut g_smooth)).unwrap();

    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let mut with_bump = ProblemDescription::new(trajectory, ObjectiveType::MinimizeVelocity);
    with_bump.set_collision_function(Box::new(GaussianBump { center: [0.4, 0.6] }), 0.5);
    let mut g_bump = Array2::zeros((n, m));
    let e_bump = with_bump.evaluate_objective(Some(&mut g_bump)).unwrap();

    assert!(e_bump > e_smooth, "obstacle cost must add to the objective");
    let diff: f64 = g_bump
        .iter()
        .zip(g_smooth.iter())
        .map(|(a, b)| (a - b).abs())
        .sum();
    assert!(diff > 1e-6, "obstacle gradient must alter the total gradient");

    // the collision-as-constraint flag removes the term again
    let trajectory = Trajectory::from_matrix(xi.clone(), q0.clone(), q1.clone(), 1.0).unwrap();
    let mut constrained = ProblemDescription::new(trajectory, ObjectiveType::MinimizeVelocity);
    constrained.set_collision_function(Box::new(GaussianBump { center: [0.4, 0.6] }), 0.5);
    constrained.set_collision_constraint(true);
    let e_flagged = constrained.evaluate_objective(None).unwrap();
    assert!((e_flagged - e_smooth).abs() < 1e-12);
}

// ─────────────────────────────────────────────────────────────
//  Constraint Jacobian
// ─────────────────────────────────────────────────────────────

#[test]
fn constraint_jacobian_matches_finite_differences() {
    let pin = PinPoint { target: vec![0.5, -0.25] };
    let q = Array1::from_vec(vec![0.3, 0.4]);

    let k = pin.num_outputs();
    let mut h = Array1::zeros(k);
    let mut jac = Array2::zeros((k, 2));
    pin.evaluate(q.view(), h.view_mut(), jac.view_mut());

    for j in 0..2 {
        let mut qp = q.clone();
        let mut qm = q.clone();
        qp[j] += FD_H;
        qm[j] -= FD_H;
        let mut hp = Array1::zeros(k);
        let mut hm = Array1::zeros(k);
        let mut scratch = Array2::zeros((k, 2));
        pin.evaluate(qp.view(), hp.view_mut(), scratch.view_mut());
        pin.evaluate(qm.view(), hm.view_mut(), scratch.view_mut());
        for r in 0..k {
            let fd = (hp[r] - hm[r]) / (2.0 * FD_H);
            assert!((jac[[r, j]] - fd).abs() < 1e-6);
        }
    }
}
