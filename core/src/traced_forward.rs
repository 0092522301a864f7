/// Traced forward wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from the tape arena
///   2. Calls the real tensor / banded function
///   3. Allocates the output in the tape arena
///   4. Records the TapeOp
///   5. Returns the output BufId
///
/// `traced_recurrence()` mirrors `RecurrenceEngine::final_state()` step by
/// step, producing a bitwise-identical final state while building a
/// gradient-ready tape. The banded update is recorded as one opaque block per
/// step; the tape never sees its inner loop.

use crate::banded::BandedOperator;
use crate::tape::{BufId, OpaqueVjp, Tape, TapeOp};
use crate::tensor;

// ── Standard op wrappers ─────────────────────────────────────────────

/// Column extraction: out = input[:, col], input: [rows, cols].
pub fn traced_column(tape: &mut Tape, input: BufId, col: usize) -> BufId {
    let (rows, cols) = match tape.buf_shape(input) {
        &[r, c] => (r, c),
        s => panic!("traced_column: expected 2-D input, got shape {s:?}"),
    };
    assert!(col < cols, "traced_column: col {col} >= cols {cols}");
    let data = tape.buf_data(input);
    let out: Vec<f64> = (0..rows).map(|i| data[i * cols + col]).collect();
    tape.record_with_output(out, vec![rows], |out_id| {
        TapeOp::Column { input, out: out_id, rows, cols, col }
    })
}

/// Element-wise add: out = a + b.
pub fn traced_add(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a);
    let b_data = tape.buf_data(b);
    assert_eq!(a_data.len(), b_data.len(), "traced_add: length mismatch");
    let out: Vec<f64> = a_data.iter().zip(b_data.iter()).map(|(x, y)| x + y).collect();
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Add { a, b, out: out_id })
}

/// Contiguous slice: out = input[offset..offset+len].
pub fn traced_slice(tape: &mut Tape, input: BufId, offset: usize, len: usize) -> BufId {
    let input_len = tape.buf_numel(input);
    assert!(offset + len <= input_len,
            "traced_slice: {offset}+{len} exceeds buffer of {input_len}");
    let out = tape.buf_data(input)[offset..offset + len].to_vec();
    tape.record_with_output(out, vec![len], |out_id| {
        TapeOp::Slice { input, out: out_id, offset, len, input_len }
    })
}

/// Matrix multiply: out = A @ B, A: [m, k], B: [k, n].
pub fn traced_matmul(tape: &mut Tape, a: BufId, b: BufId, m: usize, k: usize, n: usize) -> BufId {
    let mut out = vec![0.0f64; m * n];
    tensor::matmul(tape.buf_data(a), tape.buf_data(b), &mut out, m, k, n);
    let shape = if n == 1 { vec![m] } else { vec![m, n] };
    tape.record_with_output(out, shape, |out_id| TapeOp::Matmul { a, b, out: out_id, m, k, n })
}

// ── Recurrence ───────────────────────────────────────────────────────

fn recurrence_shape(tape: &Tape, input: BufId, op: &BandedOperator) -> (usize, usize) {
    let shape = tape.buf_shape(input);
    assert_eq!(shape.len(), 2, "recurrence input must be [n, horizon], got {shape:?}");
    assert_eq!(shape[0], op.dim(), "recurrence input has {} rows, operator n={}", shape[0], op.dim());
    assert!(shape[1] >= 1, "recurrence input has no time steps");
    (shape[0], shape[1])
}

/// Traced banded recurrence over the [n, horizon] buffer `input`.
/// Returns the BufId of the final state.
pub fn traced_recurrence(tape: &mut Tape, input: BufId, op: &BandedOperator) -> BufId {
    let (_, horizon) = recurrence_shape(tape, input, op);
    let mut state = traced_column(tape, input, 0);
    for t in 1..horizon {
        let advanced = op.record_on_tape(tape, state);
        let x_t = traced_column(tape, input, t);
        state = traced_add(tape, advanced, x_t);
    }
    state
}

/// Traced dense recurrence: the same map through the generic `Matmul` op.
/// The dense matrix depends only on (m, n), so it is built outside the
/// traced computation and registered as a plain input, never a parameter.
pub fn traced_dense_recurrence(tape: &mut Tape, input: BufId, op: &BandedOperator) -> BufId {
    let (n, horizon) = recurrence_shape(tape, input, op);
    let dense: Vec<f64> = op.to_dense();
    let a = tape.register_input(&dense, vec![n, n]);
    let mut state = traced_column(tape, input, 0);
    for t in 1..horizon {
        let advanced = traced_matmul(tape, a, state, n, n, 1);
        let x_t = traced_column(tape, input, t);
        state = traced_add(tape, advanced, x_t);
    }
    state
}

/// Scalar readout of one state coordinate.
pub fn traced_readout(tape: &mut Tape, state: BufId, index: usize) -> BufId {
    traced_slice(tape, state, index, 1)
}
