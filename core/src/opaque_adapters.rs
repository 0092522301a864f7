// Opaque VJP adapters: bridge between the tape's flat-buffer interface
// and the banded operator's typed apply / apply_transpose.
//
// Each adapter follows the same pattern:
//   1. Rebuild the operator from the structural metadata in saved[0]
//   2. Apply the hand-derived adjoint to the upstream gradient
//   3. Write the result into d_inputs[0]
//
// Saved buffer layout (written by record_on_tape):
//   saved[0] = metadata: [m, n]
// inputs[0] is the only differentiable input. m and n never become tape
// buffers, so no gradient can flow to them.

use std::collections::HashMap;

use crate::banded::BandedOperator;
use crate::tape::{BufId, OpaqueBackwardFn, OpaqueKey, OpaqueVjp, Tape};

// ── Metadata encoding ─────────────────────────────────────────────────

fn write_meta(tape: &mut Tape, op: &BandedOperator) -> BufId {
    tape.alloc(vec![op.band_width() as f64, op.dim() as f64], vec![2])
}

fn read_meta(saved: &[f64]) -> BandedOperator {
    BandedOperator::from_validated(saved[0] as usize, saved[1] as usize)
}

// ── Forward recording ─────────────────────────────────────────────────

impl OpaqueVjp for BandedOperator {
    fn opaque_key(&self) -> OpaqueKey {
        OpaqueKey::BandedApply
    }

    fn record_on_tape(&self, tape: &mut Tape, input: BufId) -> BufId {
        let state = tape.buf_data(input);
        assert_eq!(state.len(), self.dim(),
                   "banded apply: state length {} != n {}", state.len(), self.dim());
        // The output is a fresh arena buffer; the input buffer is only read.
        let out = self.apply(state);
        let meta = write_meta(tape, self);
        let out_id = tape.alloc(out, vec![self.dim()]);
        tape.record_opaque(self.opaque_key(), vec![input], vec![out_id], vec![meta]);
        out_id
    }
}

/// Transposed action of a banded operator as its own opaque primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransposedBand(pub BandedOperator);

impl OpaqueVjp for TransposedBand {
    fn opaque_key(&self) -> OpaqueKey {
        OpaqueKey::BandedApplyTranspose
    }

    fn record_on_tape(&self, tape: &mut Tape, input: BufId) -> BufId {
        let op = &self.0;
        let v = tape.buf_data(input);
        assert_eq!(v.len(), op.dim(),
                   "banded transpose: vector length {} != n {}", v.len(), op.dim());
        let out = op.apply_transpose(v);
        let meta = write_meta(tape, op);
        let out_id = tape.alloc(out, vec![op.dim()]);
        tape.record_opaque(self.opaque_key(), vec![input], vec![out_id], vec![meta]);
        out_id
    }
}

// ── Backward adapters ─────────────────────────────────────────────────

/// Banded apply: new = A · state, so d_state = Aᵀ · d_new.
pub fn banded_apply_opaque_backward(
    d_outputs: &[&[f64]],
    saved: &[&[f64]],
    d_inputs: &mut [Vec<f64>],
) {
    let op = read_meta(saved[0]);
    op.apply_transpose_into(d_outputs[0], &mut d_inputs[0]);
}

/// Banded transpose: out = Aᵀ · v, so d_v = A · d_out.
pub fn banded_apply_transpose_opaque_backward(
    d_outputs: &[&[f64]],
    saved: &[&[f64]],
    d_inputs: &mut [Vec<f64>],
) {
    let op = read_meta(saved[0]);
    op.apply_into(d_outputs[0], &mut d_inputs[0]);
}

// ── Registry ──────────────────────────────────────────────────────────

/// Build the opaque VJP registry mapping every OpaqueKey to its backward adapter.
pub fn register_opaque_vjps() -> HashMap<OpaqueKey, OpaqueBackwardFn> {
    let mut registry = HashMap::new();
    registry.insert(OpaqueKey::BandedApply, banded_apply_opaque_backward as OpaqueBackwardFn);
    registry.insert(OpaqueKey::BandedApplyTranspose,
                    banded_apply_transpose_opaque_backward as OpaqueBackwardFn);
    registry
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::SimpleRng;

    #[test]
    fn test_registry_complete() {
        let registry = register_opaque_vjps();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains_key(&OpaqueKey::BandedApply));
        assert!(registry.contains_key(&OpaqueKey::BandedApplyTranspose));
    }

    #[test]
    fn test_record_allocates_fresh_output() {
        let op = BandedOperator::new(2, 4).unwrap();
        let mut tape = Tape::new(register_opaque_vjps());
        let x = tape.register_param(&[1.0, 2.0, 3.0, 4.0], vec![4]);
        let y = op.record_on_tape(&mut tape, x);
        assert_ne!(x, y);
        assert_eq!(tape.buf_data(x), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(tape.buf_data(y), &[4.0, 7.0, 10.0, 8.0]);
        assert_eq!(tape.num_ops(), 1);
    }

    #[test]
    fn test_apply_backward_is_transpose() {
        let op = BandedOperator::new(3, 5).unwrap();
        let mut tape = Tape::new(register_opaque_vjps());
        let x = tape.register_param(&[1.0, -1.0, 2.0, 0.5, 3.0], vec![5]);
        let y = op.record_on_tape(&mut tape, x);
        let seed = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        tape.seed_grad(y, seed.clone());
        tape.backward(y);
        assert_eq!(tape.get_param_grad(x), op.apply_transpose(&seed));
    }

    #[test]
    fn test_transpose_backward_is_apply() {
        let op = BandedOperator::new(2, 4).unwrap();
        let mut tape = Tape::new(register_opaque_vjps());
        let v = tape.register_param(&[1.0, 2.0, 3.0, 4.0], vec![4]);
        let w = TransposedBand(op).record_on_tape(&mut tape, v);
        assert_eq!(tape.buf_data(w), op.apply_transpose(&[1.0, 2.0, 3.0, 4.0]).as_slice());
        let seed = vec![0.5, -1.0, 2.0, 1.0];
        tape.seed_grad(w, seed.clone());
        tape.backward(w);
        assert_eq!(tape.get_param_grad(v), op.apply(&seed));
    }

    #[test]
    fn test_adapter_called_directly_is_repeatable() {
        // Same saved metadata, two different upstream gradients: no shared state.
        let op = BandedOperator::new(3, 6).unwrap();
        let meta = [3.0, 6.0];
        let mut rng = SimpleRng::new(5);
        let mut g1 = vec![0.0; 6];
        let mut g2 = vec![0.0; 6];
        rng.fill_uniform(&mut g1, 1.0);
        rng.fill_uniform(&mut g2, 1.0);

        let mut d1 = vec![vec![0.0; 6]];
        banded_apply_opaque_backward(&[g1.as_slice()], &[&meta[..]], &mut d1);
        let mut d2 = vec![vec![0.0; 6]];
        banded_apply_opaque_backward(&[g2.as_slice()], &[&meta[..]], &mut d2);
        let mut d1_again = vec![vec![0.0; 6]];
        banded_apply_opaque_backward(&[g1.as_slice()], &[&meta[..]], &mut d1_again);

        assert_eq!(d1[0], op.apply_transpose(&g1));
        assert_eq!(d2[0], op.apply_transpose(&g2));
        assert_eq!(d1[0], d1_again[0]);
    }
}
