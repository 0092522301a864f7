// Reverse-mode tape for the recurrence objective.
//
// The forward pass appends ops to a flat list while the values they produce
// live in an arena of f64 buffers. `backward` walks the list from the end,
// pushing each output gradient onto the op's inputs. Fan-out is handled by
// summing into per-buffer accumulators.
//
// The banded update never appears as arithmetic on the tape: it is an
// `Opaque` op whose pullback is looked up by key in a registry supplied at
// construction. Recording an opaque op with no registered pullback panics.
//
// Nothing is traced outside `with_tape()`. Parameters are copied into the
// arena when registered, so the caller's buffer may change afterwards.

use std::cell::Cell;
use std::collections::HashMap;

use tracing::debug;

use crate::tensor;

// ── Arena ────────────────────────────────────────────────────────────

/// Index of a buffer in the tape arena.
pub type BufId = usize;

/// One arena slot: row-major values plus shape.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    /// Differentiation target; `get_param_grad` only accepts these.
    pub is_param: bool,
}

impl TapeBuf {
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Opaque rules ─────────────────────────────────────────────────────

/// Registry key of a primitive with a hand-written pullback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpaqueKey {
    /// new_state = A · state for the banded operator A.
    BandedApply,
    /// out = Aᵀ · v; its pullback is A itself.
    BandedApplyTranspose,
}

/// Pullback of an opaque op.
///
/// `d_outputs[k]` is the upstream gradient of output k, `saved` holds the
/// buffers the forward pass stashed (structural metadata first), and
/// `d_inputs[k]` is a zeroed buffer sized like input k that the rule fills.
pub type OpaqueBackwardFn = fn(
    d_outputs: &[&[f64]],
    saved: &[&[f64]],
    d_inputs: &mut [Vec<f64>],
);

/// A primitive that records itself as a single opaque op.
///
/// `record_on_tape` reads `input` without modifying it, writes its result to
/// a freshly allocated buffer, saves whatever the pullback needs to rebuild
/// the primitive, and pushes `TapeOp::Opaque` under `opaque_key()`.
pub trait OpaqueVjp {
    fn opaque_key(&self) -> OpaqueKey;

    fn record_on_tape(&self, tape: &mut Tape, input: BufId) -> BufId;
}

// ── Ops ──────────────────────────────────────────────────────────────

/// A recorded operation. Every variant names its output buffer.
#[derive(Debug, Clone)]
pub enum TapeOp {
    /// out[m, n] = a[m, k] @ b[k, n]. Dense reference path only.
    Matmul { a: BufId, b: BufId, out: BufId, m: usize, k: usize, n: usize },
    /// out = a + b, same length.
    Add { a: BufId, b: BufId, out: BufId },
    /// out = input[offset..offset + len] of a flat buffer of `input_len`.
    Slice { input: BufId, out: BufId, offset: usize, len: usize, input_len: usize },
    /// out = input[:, col] of a row-major [rows, cols] buffer.
    Column { input: BufId, out: BufId, rows: usize, cols: usize, col: usize },
    /// Hand-written pullback from the registry.
    Opaque {
        key: OpaqueKey,
        inputs: Vec<BufId>,
        outputs: Vec<BufId>,
        saved: Vec<BufId>,
    },
}

// ── Tape ─────────────────────────────────────────────────────────────

pub struct Tape {
    ops: Vec<TapeOp>,
    arena: Vec<TapeBuf>,
    /// Gradient per arena slot; `None` until something flows into it.
    grads: Vec<Option<Vec<f64>>>,
    /// Cleared by `backward`; a replayed tape accepts no new ops.
    recording: bool,
    registry: HashMap<OpaqueKey, OpaqueBackwardFn>,
}

impl Tape {
    pub fn new(registry: HashMap<OpaqueKey, OpaqueBackwardFn>) -> Self {
        Tape {
            ops: Vec::new(),
            arena: Vec::new(),
            grads: Vec::new(),
            recording: true,
            registry,
        }
    }

    /// Tape with no opaque rules. Standard ops only.
    pub fn new_empty() -> Self {
        Tape::new(HashMap::new())
    }

    pub fn has_opaque(&self, key: OpaqueKey) -> bool {
        self.registry.contains_key(&key)
    }

    fn push_buf(&mut self, data: Vec<f64>, shape: Vec<usize>, is_param: bool) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>(),
                         "buffer length {} disagrees with shape {shape:?}", data.len());
        self.arena.push(TapeBuf { data, shape, is_param });
        self.grads.push(None);
        self.arena.len() - 1
    }

    /// New intermediate buffer.
    pub fn alloc(&mut self, data: Vec<f64>, shape: Vec<usize>) -> BufId {
        self.push_buf(data, shape, false)
    }

    /// Copy `data` in as a differentiation target.
    pub fn register_param(&mut self, data: &[f64], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), shape, true)
    }

    /// Copy `data` in as a constant.
    pub fn register_input(&mut self, data: &[f64], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), shape, false)
    }

    pub fn buf_data(&self, id: BufId) -> &[f64] {
        &self.arena[id].data
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.arena[id].shape
    }

    pub fn buf_numel(&self, id: BufId) -> usize {
        self.arena[id].numel()
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.arena[id].is_param
    }

    pub fn num_bufs(&self) -> usize {
        self.arena.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Total f64 values held across the arena.
    pub fn arena_numel(&self) -> usize {
        self.arena.iter().map(TapeBuf::numel).sum()
    }

    pub fn ops(&self) -> &[TapeOp] {
        &self.ops
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Append an op whose buffers are already in the arena.
    pub fn record(&mut self, op: TapeOp) {
        assert!(self.recording, "cannot record on a tape that has been replayed");
        self.ops.push(op);
    }

    /// Allocate the output, build the op around its id, append it.
    pub fn record_with_output(
        &mut self,
        data: Vec<f64>,
        shape: Vec<usize>,
        make_op: impl FnOnce(BufId) -> TapeOp,
    ) -> BufId {
        let out = self.alloc(data, shape);
        self.record(make_op(out));
        out
    }

    pub fn record_opaque(
        &mut self,
        key: OpaqueKey,
        inputs: Vec<BufId>,
        outputs: Vec<BufId>,
        saved: Vec<BufId>,
    ) {
        assert!(self.registry.contains_key(&key), "no pullback registered for {key:?}");
        self.record(TapeOp::Opaque { key, inputs, outputs, saved });
    }

    // ── Gradients ────────────────────────────────────────────────

    /// Set the upstream gradient of `id` before `backward`.
    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f64>) {
        assert_eq!(grad.len(), self.arena[id].numel(),
                   "seed of length {} for buffer {id} of length {}",
                   grad.len(), self.arena[id].numel());
        self.grads[id] = Some(grad);
    }

    /// Gradient of `id`, or `None` if nothing reached it.
    pub fn get_grad(&self, id: BufId) -> Option<&[f64]> {
        self.grads[id].as_deref()
    }

    /// Gradient of a parameter, zeros if nothing reached it.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f64> {
        assert!(self.arena[id].is_param, "buffer {id} is not a parameter");
        self.grads[id].clone().unwrap_or_else(|| vec![0.0; self.arena[id].numel()])
    }

    /// Gradient slot of `id`, created zeroed on first use.
    fn grad_slot(&mut self, id: BufId) -> &mut Vec<f64> {
        let numel = self.arena[id].numel();
        self.grads[id].get_or_insert_with(|| vec![0.0; numel])
    }

    fn accumulate(&mut self, id: BufId, grad: &[f64]) {
        assert_eq!(grad.len(), self.arena[id].numel(),
                   "gradient of length {} for buffer {id} of length {}",
                   grad.len(), self.arena[id].numel());
        if let Some(acc) = &mut self.grads[id] {
            tensor::add_assign(acc, grad);
        } else {
            self.grads[id] = Some(grad.to_vec());
        }
    }

    /// Replay the ops newest-first. A scalar `loss` with no seed gets 1.0.
    pub fn backward(&mut self, loss: BufId) {
        self.recording = false;
        if self.grads[loss].is_none() {
            assert_eq!(self.arena[loss].numel(), 1,
                       "only a scalar loss can be seeded implicitly, buffer {loss} has {} values",
                       self.arena[loss].numel());
            self.grads[loss] = Some(vec![1.0]);
        }

        debug!(ops = self.ops.len(), bufs = self.arena.len(), "tape backward");

        let ops = std::mem::take(&mut self.ops);
        for op in ops.iter().rev() {
            self.pull_back(op);
        }
        self.ops = ops;
    }

    fn pull_back(&mut self, op: &TapeOp) {
        match *op {
            TapeOp::Matmul { a, b, out, m, k, n } => {
                let Some(d_out) = self.grads[out].clone() else { return };
                // d_a = d_out @ bᵀ
                let mut b_t = vec![0.0; n * k];
                tensor::transpose(&self.arena[b].data, &mut b_t, k, n);
                let mut d_a = vec![0.0; m * k];
                tensor::matmul(&d_out, &b_t, &mut d_a, m, n, k);
                // d_b = aᵀ @ d_out
                let mut a_t = vec![0.0; k * m];
                tensor::transpose(&self.arena[a].data, &mut a_t, m, k);
                let mut d_b = vec![0.0; k * n];
                tensor::matmul(&a_t, &d_out, &mut d_b, k, m, n);
                self.accumulate(a, &d_a);
                self.accumulate(b, &d_b);
            }

            TapeOp::Add { a, b, out } => {
                let Some(d_out) = self.grads[out].clone() else { return };
                self.accumulate(a, &d_out);
                self.accumulate(b, &d_out);
            }

            TapeOp::Slice { input, out, offset, len, input_len } => {
                let Some(d_out) = self.grads[out].clone() else { return };
                debug_assert_eq!(self.arena[input].numel(), input_len);
                let acc = self.grad_slot(input);
                tensor::add_assign(&mut acc[offset..offset + len], &d_out);
            }

            TapeOp::Column { input, out, rows, cols, col } => {
                let Some(d_out) = self.grads[out].clone() else { return };
                assert_eq!(self.arena[input].numel(), rows * cols, "Column input shape changed");
                // Strided scatter into the existing slot; no [rows, cols] temporary.
                let acc = self.grad_slot(input);
                for (i, g) in d_out.iter().enumerate() {
                    acc[i * cols + col] += g;
                }
            }

            TapeOp::Opaque { key, ref inputs, ref outputs, ref saved } => {
                if outputs.iter().all(|&o| self.grads[o].is_none()) {
                    return;
                }
                let d_outputs: Vec<Vec<f64>> = outputs
                    .iter()
                    .map(|&o| self.grads[o].clone().unwrap_or_else(|| vec![0.0; self.arena[o].numel()]))
                    .collect();
                let d_out_refs: Vec<&[f64]> = d_outputs.iter().map(Vec::as_slice).collect();
                let saved_refs: Vec<&[f64]> = saved.iter().map(|&s| self.arena[s].data.as_slice()).collect();
                let mut d_inputs: Vec<Vec<f64>> =
                    inputs.iter().map(|&i| vec![0.0; self.arena[i].numel()]).collect();

                let rule = self.registry[&key];
                rule(&d_out_refs, &saved_refs, &mut d_inputs);

                for (&id, d_in) in inputs.iter().zip(&d_inputs) {
                    self.accumulate(id, d_in);
                }
            }
        }
    }
}

// ── Activation scope ─────────────────────────────────────────────────

thread_local! {
    static TAPE_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Clears the active flag on scope exit, unwinding included.
struct TapeGuard;

impl Drop for TapeGuard {
    fn drop(&mut self) {
        TAPE_ACTIVE.with(|flag| flag.set(false));
    }
}

/// Run `f` with a fresh tape and mark this thread as tracing until it
/// returns. Tapes do not nest.
pub fn with_tape<F, R>(registry: HashMap<OpaqueKey, OpaqueBackwardFn>, f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    TAPE_ACTIVE.with(|flag| {
        debug_assert!(!flag.get(), "with_tape() is already active on this thread");
        flag.set(true);
    });
    let _guard = TapeGuard;
    let mut tape = Tape::new(registry);
    f(&mut tape)
}

/// `with_tape` with no opaque rules.
pub fn with_tape_empty<F, R>(f: F) -> R
where
    F: FnOnce(&mut Tape) -> R,
{
    with_tape(HashMap::new(), f)
}

/// True only inside a `with_tape()` closure on this thread.
pub fn is_tape_active() -> bool {
    TAPE_ACTIVE.with(|flag| flag.get())
}
