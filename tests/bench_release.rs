//! Release-mode benchmarks for the trajectory optimizer.
//!
//! Run with:   cargo test --release --test bench_release -- --nocapture
//!
//! These are not criterion benchmarks (to avoid an extra dependency);
//! they time key operations with `std::time::Instant` and print the
//! results.

use chomp::metric::{Metric, MetricVariant};
use chomp::problem::ProblemDescription;
use chomp::optimizer::MotionOptimizer;
use chomp::trajectory::Trajectory;
use chomp::types::{ObjectiveType, OptimizerSettings};
use ndarray::Array2;
use std::time::Instant;

fn endpoints(m: usize) -> (Array2<f64>, Array2<f64>) {
    (Array2::from_elem((1, m), 0.0), Array2::from_elem((1, m), 1.0))
}

/// Factor + solve at a large N: the O(N·b) skyline path.
#[test]
fn bench_skyline_solve() {
    let n = 4095;
    let m = 7;

    let started = Instant::now();
    let metric =
        Metric::new(n, ObjectiveType::MinimizeAcceleration, 1e-3, MetricVariant::Standard)
            .unwrap();
    let factor_time = started.elapsed();

    let mut x = Array2::from_elem((n, m), 1.0);
    let started = Instant::now();
    let reps = 50;
    for _ in 0..reps {
        metric.solve(&mut x);
    }
    let solve_time = started.elapsed();

    eprintln!(
        "skyline N={n} M={m}: factor {:?}, solve {:?}/call",
        factor_time,
        solve_time / reps
    );
    for v in x.iter().take(8) {
        assert!(v.is_finite());
    }
}

/// Full multi-resolution ladder from N=15 to N=255.
#[test]
fn bench_resolution_ladder() {
    let m = 3;
    let (q0, q1) = endpoints(m);
    let trajectory = Trajectory::initialize(q0, q1, 15, 1.0).unwrap();
    let problem = ProblemDescription::new(trajectory, ObjectiveType::MinimizeAcceleration);

    let settings = OptimizerSettings {
        objective_type: ObjectiveType::MinimizeAcceleration,
        alpha: 0.2,
        obstol: 0.0,
        max_global_iter: 20,
        max_local_iter: 0,
        n_min: 15,
        n_max: 255,
        ..OptimizerSettings::default()
    };

    let started = Instant::now();
    let mut optimizer = MotionOptimizer::new(problem, settings);
    let outcome = optimizer.solve(None).unwrap();
    let elapsed = started.elapsed();

    eprintln!(
        "ladder 15→255 (levels {}, global iters {}): {:?}",
        outcome.stats.levels, outcome.stats.global_iters, elapsed
    );
    assert_eq!(outcome.trajectory.nrows(), 255);
    assert!(outcome.final_objective.is_finite());
}
