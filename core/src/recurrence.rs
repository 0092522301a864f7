/// Banded linear recurrence: forward evaluation and its hand-written reverse sweep.
///
///   state_0 = x[:, 0]
///   state_t = A · state_{t-1} + x[:, t]      for t = 1..T-1
///   objective = state_{T-1}[readout]
///
/// The forward pass keeps two state buffers and swaps them each step, so
/// memory is O(n) regardless of T. Every step writes into the buffer that is
/// not being read; no value is observed half-updated.
///
/// Integer elements are exact or fail: any step whose update leaves the range
/// of the element type returns `BandError::Overflow` instead of wrapping.
///
/// The reverse sweep walks the steps backwards: the gradient w.r.t. x[:, t]
/// is the gradient w.r.t. state_t, and the gradient w.r.t. state_{t-1} is
/// Aᵀ times it. O(n·m) per step, O(n·T) total.

use tracing::trace;

use crate::banded::BandedOperator;
use crate::config::RecurrenceConfig;
use crate::error::{BandError, Result};
use crate::tensor::{checked_add_assign, Element, Matrix};

/// Check an input sequence against a band width and build the operator.
/// All shape errors surface here, before any arithmetic.
pub fn validate_input<T: Element>(input: &Matrix<T>, m: usize) -> Result<BandedOperator> {
    if m < 1 {
        return Err(BandError::InvalidBandWidth { m });
    }
    if input.cols() < 1 {
        return Err(BandError::EmptyHorizon);
    }
    BandedOperator::new(m, input.rows())
}

/// Forward driver bound to one operator and one readout coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecurrenceEngine {
    op: BandedOperator,
    readout: usize,
}

impl RecurrenceEngine {
    /// Engine for states of dimension `n` under `config`.
    pub fn new(config: &RecurrenceConfig, n: usize) -> Result<Self> {
        let op = config.operator(n)?;
        Ok(RecurrenceEngine { op, readout: config.readout })
    }

    /// Engine reading out coordinate 0.
    pub fn from_operator(op: BandedOperator) -> Self {
        RecurrenceEngine { op, readout: 0 }
    }

    pub fn operator(&self) -> &BandedOperator {
        &self.op
    }

    pub fn readout(&self) -> usize {
        self.readout
    }

    pub(crate) fn check(&self, input: &Matrix<impl Element>) -> Result<()> {
        if input.cols() < 1 {
            return Err(BandError::EmptyHorizon);
        }
        if input.rows() != self.op.dim() {
            return Err(BandError::StateLengthMismatch { len: input.rows(), n: self.op.dim() });
        }
        Ok(())
    }

    /// `next = A · state + x_t`, reporting overflow as step `t`.
    fn step<T: Element>(&self, state: &[T], x_t: &[T], next: &mut [T], t: usize) -> Result<()> {
        self.op.checked_apply_into(state, next).ok_or(BandError::Overflow { step: t })?;
        checked_add_assign(next, x_t).ok_or(BandError::Overflow { step: t })
    }

    /// Final state after all T steps.
    pub fn final_state<T: Element>(&self, input: &Matrix<T>) -> Result<Vec<T>> {
        self.check(input)?;
        let n = self.op.dim();
        let horizon = input.cols();

        let mut state = input.column(0);
        let mut next = vec![T::zero(); n];
        let mut x_t = vec![T::zero(); n];
        for t in 1..horizon {
            input.column_into(t, &mut x_t);
            self.step(&state, &x_t, &mut next, t)?;
            std::mem::swap(&mut state, &mut next);
            trace!(t, "recurrence step");
        }
        Ok(state)
    }

    /// Scalar objective: the readout coordinate of the final state.
    pub fn evaluate<T: Element>(&self, input: &Matrix<T>) -> Result<T> {
        let state = self.final_state(input)?;
        Ok(state[self.readout])
    }

    /// Every state, column t holding state_t. Inspection only; O(n·T) memory.
    pub fn trajectory<T: Element>(&self, input: &Matrix<T>) -> Result<Matrix<T>> {
        self.check(input)?;
        let n = self.op.dim();
        let horizon = input.cols();

        let mut states = Matrix::zeros(n, horizon);
        let mut state = input.column(0);
        states.set_column(0, &state);
        let mut next = vec![T::zero(); n];
        let mut x_t = vec![T::zero(); n];
        for t in 1..horizon {
            input.column_into(t, &mut x_t);
            self.step(&state, &x_t, &mut next, t)?;
            states.set_column(t, &next);
            std::mem::swap(&mut state, &mut next);
        }
        Ok(states)
    }

    /// Gradient of the readout objective w.r.t. every input entry, by the
    /// direct reverse sweep. Depends only on the shape, not on input values.
    pub fn readout_gradient<T: Element>(&self, horizon: usize) -> Result<Matrix<T>> {
        if horizon < 1 {
            return Err(BandError::EmptyHorizon);
        }
        let mut d_final = vec![T::zero(); self.op.dim()];
        d_final[self.readout] = T::one();
        try_recurrence_backward(&self.op, horizon, &d_final)
    }
}

/// Scalar objective `state_{T-1}[0]` for an n×T input and band width `m`.
#[tracing::instrument(skip_all, fields(n = input.rows(), horizon = input.cols(), m = m))]
pub fn evaluate<T: Element>(input: &Matrix<T>, m: usize) -> Result<T> {
    let op = validate_input(input, m)?;
    RecurrenceEngine::from_operator(op).evaluate(input)
}

/// Final state for an n×T input and band width `m`.
pub fn final_state<T: Element>(input: &Matrix<T>, m: usize) -> Result<Vec<T>> {
    let op = validate_input(input, m)?;
    RecurrenceEngine::from_operator(op).final_state(input)
}

/// Full trajectory for inspection. Not part of any differentiated path.
pub fn trajectory<T: Element>(input: &Matrix<T>, m: usize) -> Result<Matrix<T>> {
    let op = validate_input(input, m)?;
    RecurrenceEngine::from_operator(op).trajectory(input)
}

/// Reverse sweep: given the upstream gradient w.r.t. the final state, return
/// the n×T gradient w.r.t. the input sequence.
///
/// One gradient accumulator lives at a time; each step's pullback consumes
/// the accumulator produced by the step after it.
pub fn recurrence_backward<T: Element>(op: &BandedOperator, horizon: usize, d_final: &[T]) -> Matrix<T> {
    let n = op.dim();
    debug_assert_eq!(d_final.len(), n);
    let mut d_input = Matrix::zeros(n, horizon);
    let mut d_state = d_final.to_vec();
    let mut d_prev = vec![T::zero(); n];
    for t in (0..horizon).rev() {
        // x[:, t] enters state_t additively.
        d_input.set_column(t, &d_state);
        if t > 0 {
            op.apply_transpose_into(&d_state, &mut d_prev);
            std::mem::swap(&mut d_state, &mut d_prev);
        }
    }
    d_input
}

/// `recurrence_backward` with overflow detection: fails with the step t
/// whose pullback Aᵀ · d_state_t left the range of `T`.
pub fn try_recurrence_backward<T: Element>(
    op: &BandedOperator,
    horizon: usize,
    d_final: &[T],
) -> Result<Matrix<T>> {
    op.check_len(d_final.len())?;
    let n = op.dim();
    let mut d_input = Matrix::zeros(n, horizon);
    let mut d_state = d_final.to_vec();
    let mut d_prev = vec![T::zero(); n];
    for t in (0..horizon).rev() {
        d_input.set_column(t, &d_state);
        if t > 0 {
            op.checked_apply_transpose_into(&d_state, &mut d_prev)
                .ok_or(BandError::Overflow { step: t })?;
            std::mem::swap(&mut d_state, &mut d_prev);
        }
    }
    Ok(d_input)
}

/// Input matrix of the worked example: entry (i, t) is the 1-based
/// column-major index of (i, t), reduced mod `horizon`.
pub fn worked_example_input<T: Element>(n: usize, horizon: usize) -> Matrix<T> {
    Matrix::from_fn(n, horizon, |i, t| T::weight((i + t * n + 1) % horizon))
}
