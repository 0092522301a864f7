/// Caller-facing objective: value and gradient of the readout w.r.t. the
/// whole input sequence.
///
/// Inputs may hold any `Element`; the value is computed exactly in that type
/// and the gradient runs through the tape in f64.
///
/// The gradient runs through the tape with the banded update registered as an
/// opaque primitive, so each recorded step costs O(n·m) forward and backward.
/// Only the input sequence is differentiable; asking for a gradient w.r.t. a
/// structural parameter returns `UnsupportedDifferentiation`.

use num_traits::AsPrimitive;
use tracing::debug;

use crate::config::RecurrenceConfig;
use crate::error::{BandError, Result, StructuralParam};
use crate::opaque_adapters::register_opaque_vjps;
use crate::recurrence::{validate_input, RecurrenceEngine};
use crate::tape::with_tape;
use crate::tensor::{Element, Matrix};
use crate::traced_forward::{traced_readout, traced_recurrence};

/// What the caller wants the gradient with respect to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffTarget {
    /// The n×T input sequence. The only differentiable argument.
    Input,
    /// m, n or T.
    Structural(StructuralParam),
}

/// Recurrence objective bound to a validated engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Objective {
    engine: RecurrenceEngine,
}

impl Objective {
    pub fn new(config: &RecurrenceConfig, n: usize) -> Result<Self> {
        Ok(Objective { engine: RecurrenceEngine::new(config, n)? })
    }

    pub fn from_engine(engine: RecurrenceEngine) -> Self {
        Objective { engine }
    }

    pub fn engine(&self) -> &RecurrenceEngine {
        &self.engine
    }

    /// Forward value only. No tape; exact for integer elements.
    pub fn value<T: Element>(&self, input: &Matrix<T>) -> Result<T> {
        self.engine.evaluate(input)
    }

    /// Value and n×T gradient. The value comes from the exact forward in
    /// `T`, so integer overflow surfaces here; the gradient is traced in f64.
    pub fn value_and_gradient<T>(&self, input: &Matrix<T>) -> Result<(T, Matrix<f64>)>
    where
        T: Element + AsPrimitive<f64>,
    {
        let value = self.engine.evaluate(input)?;
        let as_f64: Matrix<f64> = input.map(|v| v.as_());
        let grad = self.traced_gradient(&as_f64)?;
        Ok((value, grad))
    }

    fn traced_gradient(&self, input: &Matrix<f64>) -> Result<Matrix<f64>> {
        // Shape errors surface before anything is recorded.
        self.engine.check(input)?;

        let (n, horizon) = (input.rows(), input.cols());
        let op = *self.engine.operator();
        let readout = self.engine.readout();

        let grad = with_tape(register_opaque_vjps(), |tape| {
            let x = tape.register_param(input.as_slice(), vec![n, horizon]);
            let state = traced_recurrence(tape, x, &op);
            let loss = traced_readout(tape, state, readout);
            tape.backward(loss);
            debug!(ops = tape.num_ops(), arena = tape.arena_numel(), "objective gradient");
            tape.get_param_grad(x)
        });

        Matrix::from_vec(grad, n, horizon)
    }

    /// Gradient only.
    pub fn gradient<T: Element + AsPrimitive<f64>>(&self, input: &Matrix<T>) -> Result<Matrix<f64>> {
        self.value_and_gradient(input).map(|(_, grad)| grad)
    }

    /// Gradient w.r.t. `target`. Structural targets are rejected before any
    /// computation.
    pub fn gradient_wrt<T: Element + AsPrimitive<f64>>(
        &self,
        input: &Matrix<T>,
        target: DiffTarget,
    ) -> Result<Matrix<f64>> {
        match target {
            DiffTarget::Input => self.gradient(input),
            DiffTarget::Structural(param) => Err(BandError::UnsupportedDifferentiation { param }),
        }
    }
}

/// Objective value and gradient w.r.t. `input` for band width `m`,
/// reading out coordinate 0.
#[tracing::instrument(skip_all, fields(n = input.rows(), horizon = input.cols(), m = m))]
pub fn value_and_gradient<T>(input: &Matrix<T>, m: usize) -> Result<(T, Matrix<f64>)>
where
    T: Element + AsPrimitive<f64>,
{
    let op = validate_input(input, m)?;
    Objective::from_engine(RecurrenceEngine::from_operator(op)).value_and_gradient(input)
}

/// Gradient of the objective w.r.t. `input`, same shape as `input`.
pub fn gradient<T: Element + AsPrimitive<f64>>(input: &Matrix<T>, m: usize) -> Result<Matrix<f64>> {
    value_and_gradient(input, m).map(|(_, grad)| grad)
}

/// Gradient w.r.t. an arbitrary target. Only `DiffTarget::Input` succeeds.
pub fn gradient_wrt<T: Element + AsPrimitive<f64>>(
    input: &Matrix<T>,
    m: usize,
    target: DiffTarget,
) -> Result<Matrix<f64>> {
    match target {
        DiffTarget::Input => gradient(input, m),
        DiffTarget::Structural(param) => Err(BandError::UnsupportedDifferentiation { param }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::{self, recurrence_backward};
    use crate::tensor::SimpleRng;

    fn random_input(n: usize, horizon: usize, seed: u64) -> Matrix<f64> {
        let mut rng = SimpleRng::new(seed);
        Matrix::from_fn(n, horizon, |_, _| rng.uniform(1.0))
    }

    #[test]
    fn test_value_matches_evaluate_bitwise() {
        let x = random_input(8, 7, 3);
        let (value, _) = value_and_gradient(&x, 3).unwrap();
        let expected = recurrence::evaluate(&x, 3).unwrap();
        assert_eq!(value.to_bits(), expected.to_bits());
    }

    #[test]
    fn test_gradient_matches_direct_sweep() {
        let x = random_input(6, 9, 17);
        let grad = gradient(&x, 2).unwrap();
        let op = validate_input(&x, 2).unwrap();
        let mut seed = vec![0.0; 6];
        seed[0] = 1.0;
        let expected = recurrence_backward(&op, 9, &seed);
        assert_eq!(grad, expected);
    }

    #[test]
    fn test_gradient_last_column_is_unit_readout() {
        let x = random_input(5, 4, 1);
        let grad = gradient(&x, 2).unwrap();
        assert_eq!(grad.column(3), vec![1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_gradient_shape_and_single_step() {
        let x = random_input(4, 1, 9);
        let grad = gradient(&x, 3).unwrap();
        assert_eq!((grad.rows(), grad.cols()), (4, 1));
        assert_eq!(grad.column(0), vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_structural_targets_rejected() {
        let x = random_input(4, 3, 2);
        for param in [StructuralParam::BandWidth, StructuralParam::StateDim, StructuralParam::Horizon] {
            assert_eq!(
                gradient_wrt(&x, 2, DiffTarget::Structural(param)),
                Err(BandError::UnsupportedDifferentiation { param })
            );
        }
        assert!(gradient_wrt(&x, 2, DiffTarget::Input).is_ok());
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        let x = random_input(4, 3, 2);
        assert_eq!(gradient(&x, 0), Err(BandError::InvalidBandWidth { m: 0 }));
        let empty = Matrix::<f64>::zeros(4, 0);
        assert_eq!(gradient(&empty, 2), Err(BandError::EmptyHorizon));
        let no_rows = Matrix::<f64>::zeros(0, 3);
        assert_eq!(gradient(&no_rows, 2), Err(BandError::InvalidStateDim { n: 0 }));
    }

    #[test]
    fn test_objective_with_readout() {
        let config = RecurrenceConfig::new(2).with_readout(2);
        let objective = Objective::new(&config, 4).unwrap();
        let x = random_input(4, 3, 12);
        let (value, grad) = objective.value_and_gradient(&x).unwrap();
        assert_eq!(value.to_bits(), objective.value(&x).unwrap().to_bits());
        assert_eq!(grad.column(2), vec![0.0, 0.0, 1.0, 0.0]);
        let expected: Matrix<f64> = objective.engine().readout_gradient(3).unwrap();
        assert_eq!(grad, expected);
    }

    #[test]
    fn test_integer_input_gives_exact_value() {
        let x: Matrix<i64> = recurrence::worked_example_input(9, 11);
        let (value, grad) = value_and_gradient(&x, 2).unwrap();
        assert_eq!(value, 355053);
        let xf: Matrix<f64> = recurrence::worked_example_input(9, 11);
        assert_eq!(grad, gradient(&xf, 2).unwrap());
        assert_eq!(gradient_wrt(&x, 2, DiffTarget::Input).unwrap(), grad);
    }

    #[test]
    fn test_integer_overflow_surfaces_before_tape() {
        let x = Matrix::from_fn(4, 60, |_, _| 1i64);
        assert_eq!(value_and_gradient(&x, 2), Err(BandError::Overflow { step: 51 }));
        // The f64 gradient of the same shape is still available.
        assert!(gradient(&x.map(|v| v as f64), 2).is_ok());
    }

    #[test]
    fn test_objective_rejects_wrong_dim() {
        let objective = Objective::new(&RecurrenceConfig::default(), 4).unwrap();
        let x = random_input(5, 3, 1);
        assert_eq!(
            objective.gradient(&x),
            Err(BandError::StateLengthMismatch { len: 5, n: 4 })
        );
        assert_eq!(
            objective.gradient_wrt(&x, DiffTarget::Structural(StructuralParam::Horizon)),
            Err(BandError::UnsupportedDifferentiation { param: StructuralParam::Horizon })
        );
    }
}
