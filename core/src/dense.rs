/// Dense reference path: materialize the n×n operator and run the recurrence
/// with plain mat-vec products. O(n²) per step.
///
/// Used only to cross-check the banded evaluator. Never traced through an
/// opaque rule; when traced, it goes through the tape's generic `Matmul` op.
/// Arithmetic is unchecked, so integer callers must stay within range.

use crate::banded::BandedOperator;
use crate::error::Result;
use crate::recurrence::validate_input;
use crate::tensor::{add_assign, matvec, Element, Matrix};

/// All states of the dense recurrence, column t holding state_t.
pub fn dense_trajectory<T: Element>(input: &Matrix<T>, m: usize) -> Result<Matrix<T>> {
    let op = validate_input(input, m)?;
    let n = op.dim();
    let horizon = input.cols();
    let a: Vec<T> = op.to_dense();

    let mut states = Matrix::zeros(n, horizon);
    let mut state = input.column(0);
    states.set_column(0, &state);
    for t in 1..horizon {
        let mut next = vec![T::zero(); n];
        matvec(&a, &state, &mut next, n, n);
        add_assign(&mut next, &input.column(t));
        states.set_column(t, &next);
        state = next;
    }
    Ok(states)
}

/// First coordinate of the final dense state.
pub fn dense_evaluate<T: Element>(input: &Matrix<T>, m: usize) -> Result<T> {
    let states = dense_trajectory(input, m)?;
    Ok(states.get(0, states.cols() - 1))
}

/// Dense `Aᵀ · v`, for checking the banded transpose.
pub fn dense_apply_transpose<T: Element>(op: &BandedOperator, v: &[T]) -> Vec<T> {
    let n = op.dim();
    let a: Vec<T> = op.to_dense();
    let mut out = vec![T::zero(); n];
    for i in 0..n {
        for j in 0..n {
            out[j] += a[i * n + j] * v[i];
        }
    }
    out
}
