/// Finite-difference and adjoint-identity checks through the verification
/// helpers. Needs the `internal` feature.
///
/// Run: cargo test --features internal --test test_verification

use approx::assert_relative_eq;

use bandgrad_core::banded::BandedOperator;
use bandgrad_core::gradient::{
    check_adjoint_identity, check_adjoint_maps, check_gradient, finite_diff_gradient, AdjointMismatch,
};
use bandgrad_core::objective::Objective;
use bandgrad_core::recurrence::{worked_example_input, RecurrenceEngine};
use bandgrad_core::tensor::{Matrix, SimpleRng};

fn random_input(n: usize, horizon: usize, seed: u64) -> Matrix<f64> {
    let mut rng = SimpleRng::new(seed);
    Matrix::from_fn(n, horizon, |_, _| rng.uniform(1.0))
}

#[test]
fn test_fd_gradient_small_shapes() {
    for (n, horizon, m) in [(3, 2, 1), (4, 4, 2), (6, 3, 4), (5, 5, 7)] {
        let engine = RecurrenceEngine::from_operator(BandedOperator::new(m, n).unwrap());
        let x = random_input(n, horizon, 77);
        let analytical = Objective::from_engine(engine).gradient(&x).unwrap();
        let numerical = finite_diff_gradient(&engine, &x, 1e-5).unwrap();
        for (a, b) in analytical.as_slice().iter().zip(numerical.as_slice()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6, max_relative = 1e-5);
        }
    }
}

#[test]
fn test_sampled_gradient_check_worked_example() {
    let engine = RecurrenceEngine::from_operator(BandedOperator::new(2, 9).unwrap());
    let x: Matrix<f64> = worked_example_input(9, 11);
    let analytical = Objective::from_engine(engine).gradient(&x).unwrap();
    let (checked, passed, max_err) = check_gradient(&engine, &x, &analytical, 20, 1e-3, 1e-4).unwrap();
    assert_eq!(checked, 20);
    assert_eq!(passed, checked, "max_rel_err={max_err}");
}

#[test]
fn test_adjoint_identity_helper_over_range() {
    let mut rng = SimpleRng::new(2024);
    for n in 1..=16 {
        for m in 1..=n + 2 {
            let op = BandedOperator::new(m, n).unwrap();
            let mut u = vec![0.0; n];
            let mut v = vec![0.0; n];
            rng.fill_uniform(&mut u, 1.0);
            rng.fill_uniform(&mut v, 1.0);
            check_adjoint_identity(&op, &u, &v, 1e-10).unwrap();
        }
    }
}

#[test]
fn test_adjoint_mismatch_display() {
    let err = AdjointMismatch { m: 3, n: 5, lhs: 1.0, rhs: 2.0 };
    let msg = err.to_string();
    assert!(msg.contains("m=3"));
    assert!(msg.contains("n=5"));
}

#[test]
fn test_wrong_transpose_detected() {
    // Adjoint taken from a wider band: every shape with n >= 2 must be caught.
    let mut rng = SimpleRng::new(77);
    for n in 2..=12 {
        for m in 1..=n {
            let op = BandedOperator::new(m, n).unwrap();
            let wider = BandedOperator::new(m + 1, n).unwrap();
            let mut u = vec![0.0; n];
            let mut v = vec![0.0; n];
            rng.fill_uniform(&mut u, 1.0);
            rng.fill_uniform(&mut v, 1.0);
            let err = check_adjoint_maps(m, n, |x| op.apply(x), |x| wider.apply_transpose(x), &u, &v, 1e-10)
                .unwrap_err();
            assert_eq!((err.m, err.n), (m, n));
            assert!((err.lhs - err.rhs).abs() > 1e-10);
        }
    }
}
