/// Gradient verification.
///
/// Provides:
/// - `finite_diff_gradient`: central finite differences of the objective
/// - `check_gradient`: sampled analytical-vs-numerical comparison
/// - `check_adjoint_identity`: <Aᵀu, v> == <u, Av> within tolerance
/// - `check_adjoint_maps`: the same check for any claimed (A, Aᵀ) pair
///
/// None of this is on any production path.

use crate::banded::BandedOperator;
use crate::error::Result;
use crate::recurrence::RecurrenceEngine;
use crate::tensor::{dot, Matrix};

/// Raised by the adjoint check when the two inner products disagree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("adjoint mismatch for m={m}, n={n}: <A^T u, v> = {lhs}, <u, A v> = {rhs}")]
pub struct AdjointMismatch {
    pub m: usize,
    pub n: usize,
    pub lhs: f64,
    pub rhs: f64,
}

/// Central difference for one input entry: (f(x+eps) - f(x-eps)) / (2*eps).
#[allow(dead_code)]
fn fd_single(
    engine: &RecurrenceEngine,
    input: &Matrix<f64>,
    row: usize,
    col: usize,
    eps: f64,
) -> Result<f64> {
    let orig = input.get(row, col);

    let mut x_plus = input.clone();
    x_plus.set(row, col, orig + eps);
    let f_plus = engine.evaluate(&x_plus)?;

    let mut x_minus = input.clone();
    x_minus.set(row, col, orig - eps);
    let f_minus = engine.evaluate(&x_minus)?;

    Ok((f_plus - f_minus) / (2.0 * eps))
}

/// Full finite-difference gradient, same shape as `input`. O(n·T) evaluations.
#[allow(dead_code)]
pub fn finite_diff_gradient(
    engine: &RecurrenceEngine,
    input: &Matrix<f64>,
    eps: f64,
) -> Result<Matrix<f64>> {
    engine.check(input)?;
    let mut grad = Matrix::zeros(input.rows(), input.cols());
    for row in 0..input.rows() {
        for col in 0..input.cols() {
            grad.set(row, col, fd_single(engine, input, row, col, eps)?);
        }
    }
    Ok(grad)
}

/// Compare `analytical` against finite differences on up to `num_samples`
/// evenly strided entries. Returns (num_checked, num_passed, max_relative_error).
///
/// Relative error uses denominator max(|a|, |b|); entries where both are
/// below `abs_threshold` are auto-passed (below FD resolution).
#[allow(dead_code)]
pub fn check_gradient(
    engine: &RecurrenceEngine,
    input: &Matrix<f64>,
    analytical: &Matrix<f64>,
    num_samples: usize,
    eps: f64,
    tol: f64,
) -> Result<(usize, usize, f64)> {
    engine.check(input)?;
    let abs_threshold = 1e-8;
    let total = input.numel();
    let step = if total > num_samples { total / num_samples } else { 1 };
    let cols = input.cols();

    let mut checked = 0;
    let mut passed = 0;
    let mut max_rel_err = 0.0f64;

    for idx in (0..total).step_by(step).take(num_samples) {
        let (row, col) = (idx / cols, idx % cols);
        let a = analytical.get(row, col);
        let numerical = fd_single(engine, input, row, col, eps)?;

        let abs_diff = (a - numerical).abs();
        let denom = a.abs().max(numerical.abs());

        checked += 1;

        if denom < abs_threshold {
            passed += 1;
            continue;
        }

        let rel_err = abs_diff / denom;
        if rel_err > max_rel_err {
            max_rel_err = rel_err;
        }

        if rel_err < tol {
            passed += 1;
        } else {
            tracing::warn!(row, col, analytical = a, numerical, rel_err, "gradient check failed");
        }
    }

    Ok((checked, passed, max_rel_err))
}

/// Check <Aᵀu, v> against <u, Av>. Passes when the difference is within
/// `tol` relative to the larger magnitude (absolute below 1.0).
#[allow(dead_code)]
pub fn check_adjoint_identity(
    op: &BandedOperator,
    u: &[f64],
    v: &[f64],
    tol: f64,
) -> std::result::Result<(), AdjointMismatch> {
    check_adjoint_maps(
        op.band_width(),
        op.dim(),
        |x| op.apply(x),
        |x| op.apply_transpose(x),
        u,
        v,
        tol,
    )
}

/// Adjoint check for an arbitrary pair of maps claimed to be A and Aᵀ.
/// `m` and `n` only label the mismatch.
#[allow(dead_code)]
pub fn check_adjoint_maps(
    m: usize,
    n: usize,
    forward: impl Fn(&[f64]) -> Vec<f64>,
    adjoint: impl Fn(&[f64]) -> Vec<f64>,
    u: &[f64],
    v: &[f64],
    tol: f64,
) -> std::result::Result<(), AdjointMismatch> {
    let lhs = dot(&adjoint(u), v);
    let rhs = dot(u, &forward(v));
    let scale = lhs.abs().max(rhs.abs()).max(1.0);
    if (lhs - rhs).abs() <= tol * scale {
        Ok(())
    } else {
        Err(AdjointMismatch { m, n, lhs, rhs })
    }
}
