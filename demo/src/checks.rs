// Each check prints one [PASS]/[FAIL] line per comparison and returns
// (passed, failed).

use anyhow::Result;
use tracing::info;

use bandgrad_core::banded::BandedOperator;
use bandgrad_core::dense::{dense_evaluate, dense_trajectory};
use bandgrad_core::gradient::{check_adjoint_identity, check_gradient};
use bandgrad_core::objective::Objective;
use bandgrad_core::recurrence::{evaluate, recurrence_backward, trajectory, worked_example_input};
use bandgrad_core::tensor::{Matrix, SimpleRng};
use bandgrad_core::RecurrenceEngine;

const WORKED_EXAMPLE: i64 = 355053;

fn report(pass: bool, line: String) -> bool {
    println!("  [{}] {line}", if pass { "PASS" } else { "FAIL" });
    pass
}

fn tally(results: &[bool]) -> (usize, usize) {
    let passed = results.iter().filter(|&&ok| ok).count();
    (passed, results.len() - passed)
}

/// n=9, T=11, m=2 on the banded and dense paths, in i64 and f64.
pub fn worked_example() -> Result<(usize, usize)> {
    let xi: Matrix<i64> = worked_example_input(9, 11);
    let xf: Matrix<f64> = worked_example_input(9, 11);
    let banded = evaluate(&xi, 2)?;
    let banded_f = evaluate(&xf, 2)?;
    let dense = dense_evaluate(&xi, 2)?;
    Ok(tally(&[
        report(banded == WORKED_EXAMPLE, format!("banded i64: {banded} (expected {WORKED_EXAMPLE})")),
        report(banded_f == WORKED_EXAMPLE as f64, format!("banded f64: {banded_f}")),
        report(dense == WORKED_EXAMPLE, format!("dense i64: {dense}")),
    ]))
}

/// Full trajectories of the banded and dense evaluators agree exactly.
pub fn dense_agreement(n: usize, horizon: usize, m: usize) -> Result<(usize, usize)> {
    // f64: wide bands overflow i64 within a few dozen steps.
    let x: Matrix<f64> = worked_example_input(n, horizon);
    let mut results = Vec::new();
    for band in [1, m, n, n + 2] {
        let same = trajectory(&x, band)? == dense_trajectory(&x, band)?;
        results.push(report(same, format!("trajectory n={n} T={horizon} m={band}")));
    }
    Ok(tally(&results))
}

/// <Aᵀu, v> == <u, Av> for every band width up to n + 2.
pub fn adjoint_identity(n: usize, seed: u64) -> Result<(usize, usize)> {
    let mut rng = SimpleRng::new(seed);
    let mut results = Vec::new();
    for m in 1..=n + 2 {
        let op = BandedOperator::new(m, n)?;
        let mut u = vec![0.0; n];
        let mut v = vec![0.0; n];
        rng.fill_uniform(&mut u, 1.0);
        rng.fill_uniform(&mut v, 1.0);
        let line = match check_adjoint_identity(&op, &u, &v, 1e-10) {
            Ok(()) => report(true, format!("adjoint n={n} m={m}")),
            Err(e) => report(false, e.to_string()),
        };
        results.push(line);
    }
    Ok(tally(&results))
}

/// Tape gradient against the direct reverse sweep and finite differences.
pub fn gradient(engine: &RecurrenceEngine, horizon: usize, seed: u64) -> Result<(usize, usize)> {
    let n = engine.operator().dim();
    let mut rng = SimpleRng::new(seed);
    let x = Matrix::from_fn(n, horizon, |_, _| rng.uniform(1.0));

    let (value, grad) = Objective::from_engine(*engine).value_and_gradient(&x)?;
    info!(value, "objective");

    let mut seed_vec = vec![0.0; n];
    seed_vec[engine.readout()] = 1.0;
    let direct = recurrence_backward(engine.operator(), horizon, &seed_vec);

    let (checked, passed, max_rel_err) = check_gradient(engine, &x, &grad, 32, 1e-3, 1e-4)?;
    Ok(tally(&[
        report(grad == direct, format!("tape vs direct sweep ({n}x{horizon})")),
        report(
            checked > 0 && passed == checked,
            format!("finite differences: {passed}/{checked}, max_rel_err={max_rel_err:.2e}"),
        ),
    ]))
}
