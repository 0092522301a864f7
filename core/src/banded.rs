/// Banded upper-triangular operator used by every recurrence step.
///
/// Row i holds the weights m, m-1, ..., 1 starting on the diagonal:
/// `A[i, i+d] = m - d` for `0 <= d < m` and `i + d < n`. Neither the operator
/// nor its transpose is ever formed densely on the hot path; both act in
/// O(n·m) directly on the state.
///
/// The operator depends only on the structural pair (m, n), so it is built
/// once outside any traced region and never appears as a tape buffer.

use crate::error::{BandError, Result};
use crate::tensor::Element;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BandedOperator {
    m: usize,
    n: usize,
}

impl BandedOperator {
    /// Validate the band half-width `m` and dimension `n`. Both must be >= 1;
    /// `m` may exceed `n`, in which case the out-of-range band entries are absent.
    pub fn new(m: usize, n: usize) -> Result<Self> {
        if m < 1 {
            return Err(BandError::InvalidBandWidth { m });
        }
        if n < 1 {
            return Err(BandError::InvalidStateDim { n });
        }
        Ok(BandedOperator { m, n })
    }

    /// Rebuild from metadata that was produced by a validated operator.
    pub(crate) fn from_validated(m: usize, n: usize) -> Self {
        debug_assert!(m >= 1 && n >= 1, "operator metadata corrupted: m={m} n={n}");
        BandedOperator { m, n }
    }

    pub fn band_width(&self) -> usize {
        self.m
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// Coefficient at (row, col), 0-indexed. Zero outside the n×n matrix.
    pub fn entry<T: Element>(&self, row: usize, col: usize) -> T {
        if row < self.n && col < self.n && col >= row && col - row < self.m {
            T::weight(self.m - (col - row))
        } else {
            T::zero()
        }
    }

    /// Multiply-adds performed by one `apply` (and one `apply_transpose`):
    /// sum over rows of min(m, n - i). Linear in n for fixed m.
    pub fn multiply_adds(&self) -> usize {
        (0..self.n).map(|i| self.m.min(self.n - i)).sum()
    }

    /// `out = A · state`. `out` must not alias `state`; the borrow checker
    /// enforces that, so no partially written value is ever read back.
    pub fn apply_into<T: Element>(&self, state: &[T], out: &mut [T]) {
        debug_assert_eq!(state.len(), self.n);
        debug_assert_eq!(out.len(), self.n);
        let (m, n) = (self.m, self.n);
        for i in 0..n {
            let reach = m.min(n - i);
            let mut acc = T::zero();
            for d in 0..reach {
                acc += T::weight(m - d) * state[i + d];
            }
            out[i] = acc;
        }
    }

    /// `A · state` as a fresh vector.
    pub fn apply<T: Element>(&self, state: &[T]) -> Vec<T> {
        let mut out = vec![T::zero(); self.n];
        self.apply_into(state, &mut out);
        out
    }

    /// `out = Aᵀ · v`. Swaps the row and column offsets of `apply_into`:
    /// `out[j] = sum_{d < m, d <= j} (m - d) * v[j - d]`.
    pub fn apply_transpose_into<T: Element>(&self, v: &[T], out: &mut [T]) {
        debug_assert_eq!(v.len(), self.n);
        debug_assert_eq!(out.len(), self.n);
        let m = self.m;
        for j in 0..self.n {
            let reach = m.min(j + 1);
            let mut acc = T::zero();
            for d in 0..reach {
                acc += T::weight(m - d) * v[j - d];
            }
            out[j] = acc;
        }
    }

    /// `Aᵀ · v` as a fresh vector.
    pub fn apply_transpose<T: Element>(&self, v: &[T]) -> Vec<T> {
        let mut out = vec![T::zero(); self.n];
        self.apply_transpose_into(v, &mut out);
        out
    }

    /// `apply_into` that returns `None` at the first weight, product or
    /// partial sum outside the range of `T`. `out` is then partially written.
    pub fn checked_apply_into<T: Element>(&self, state: &[T], out: &mut [T]) -> Option<()> {
        debug_assert_eq!(state.len(), self.n);
        debug_assert_eq!(out.len(), self.n);
        let (m, n) = (self.m, self.n);
        for i in 0..n {
            let reach = m.min(n - i);
            let mut acc = T::zero();
            for d in 0..reach {
                let w: T = num_traits::cast(m - d)?;
                acc = acc.checked_sum(w.checked_product(state[i + d])?)?;
            }
            out[i] = acc;
        }
        Some(())
    }

    /// Overflow-checked `apply_transpose_into`.
    pub fn checked_apply_transpose_into<T: Element>(&self, v: &[T], out: &mut [T]) -> Option<()> {
        debug_assert_eq!(v.len(), self.n);
        debug_assert_eq!(out.len(), self.n);
        let m = self.m;
        for j in 0..self.n {
            let reach = m.min(j + 1);
            let mut acc = T::zero();
            for d in 0..reach {
                let w: T = num_traits::cast(m - d)?;
                acc = acc.checked_sum(w.checked_product(v[j - d])?)?;
            }
            out[j] = acc;
        }
        Some(())
    }

    /// Checked variant of `apply` for caller-supplied states: length and
    /// overflow are both reported as errors.
    pub fn try_apply<T: Element>(&self, state: &[T]) -> Result<Vec<T>> {
        self.check_len(state.len())?;
        let mut out = vec![T::zero(); self.n];
        self.checked_apply_into(state, &mut out).ok_or(BandError::Overflow { step: 1 })?;
        Ok(out)
    }

    /// Checked variant of `apply_transpose`.
    pub fn try_apply_transpose<T: Element>(&self, v: &[T]) -> Result<Vec<T>> {
        self.check_len(v.len())?;
        let mut out = vec![T::zero(); self.n];
        self.checked_apply_transpose_into(v, &mut out).ok_or(BandError::Overflow { step: 1 })?;
        Ok(out)
    }

    /// Forward value paired with its pullback. The pullback maps an upstream
    /// gradient w.r.t. the result to the gradient w.r.t. `state`.
    pub fn apply_with_pullback<T: Element>(&self, state: &[T]) -> (Vec<T>, BandedPullback<'_>) {
        (self.apply(state), BandedPullback { op: self })
    }

    /// Dense n×n row-major matrix. Reference path only.
    pub fn to_dense<T: Element>(&self) -> Vec<T> {
        let n = self.n;
        let mut a = vec![T::zero(); n * n];
        for i in 0..n {
            for d in 0..self.m.min(n - i) {
                a[i * n + i + d] = T::weight(self.m - d);
            }
        }
        a
    }

    pub(crate) fn check_len(&self, len: usize) -> Result<()> {
        if len != self.n {
            return Err(BandError::StateLengthMismatch { len, n: self.n });
        }
        Ok(())
    }
}

/// Reverse-mode rule for one `apply`. Since `new = A · state`,
/// `d_state = Aᵀ · d_new`. Carries no gradient for `m` or `n`.
///
/// Holds only a shared borrow of the immutable operator, so it can be
/// invoked any number of times with different upstream gradients.
#[derive(Clone, Copy, Debug)]
pub struct BandedPullback<'a> {
    op: &'a BandedOperator,
}

impl BandedPullback<'_> {
    pub fn pullback<T: Element>(&self, d_new: &[T]) -> Vec<T> {
        self.op.apply_transpose(d_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{self, SimpleRng};

    #[test]
    fn test_dense_n4_m2() {
        let op = BandedOperator::new(2, 4).unwrap();
        let a: Vec<i64> = op.to_dense();
        assert_eq!(a, vec![
            2, 1, 0, 0,
            0, 2, 1, 0,
            0, 0, 2, 1,
            0, 0, 0, 2,
        ]);
    }

    #[test]
    fn test_dense_n4_m3() {
        let op = BandedOperator::new(3, 4).unwrap();
        let a: Vec<i64> = op.to_dense();
        assert_eq!(a, vec![
            3, 2, 1, 0,
            0, 3, 2, 1,
            0, 0, 3, 2,
            0, 0, 0, 3,
        ]);
    }

    #[test]
    fn test_entry_matches_dense() {
        let op = BandedOperator::new(3, 5).unwrap();
        let a: Vec<i64> = op.to_dense();
        for i in 0..5 {
            for j in 0..5 {
                assert_eq!(op.entry::<i64>(i, j), a[i * 5 + j], "entry({i},{j})");
            }
        }
    }

    #[test]
    fn test_entry_outside_matrix_is_zero() {
        // m > n: the band would reach past the last column.
        let op = BandedOperator::new(5, 3).unwrap();
        assert_eq!(op.entry::<i64>(0, 2), 3);
        assert_eq!(op.entry::<i64>(0, 3), 0);
        assert_eq!(op.entry::<i64>(0, 4), 0);
        assert_eq!(op.entry::<i64>(3, 3), 0);
    }

    #[test]
    fn test_rejects_zero_band_and_dim() {
        assert_eq!(BandedOperator::new(0, 4), Err(BandError::InvalidBandWidth { m: 0 }));
        assert_eq!(BandedOperator::new(2, 0), Err(BandError::InvalidStateDim { n: 0 }));
    }

    #[test]
    fn test_band_wider_than_dim() {
        // m=5 > n=3: row 0 gets 5,4,3; row 2 gets only 5.
        let op = BandedOperator::new(5, 3).unwrap();
        let a: Vec<i64> = op.to_dense();
        assert_eq!(a, vec![5, 4, 3, 0, 5, 4, 0, 0, 5]);
        assert_eq!(op.apply(&[1i64, 1, 1]), vec![12, 9, 5]);
    }

    #[test]
    fn test_apply_matches_dense_matvec() {
        let mut rng = SimpleRng::new(7);
        for m in 1..=6 {
            let op = BandedOperator::new(m, 6).unwrap();
            let mut x = vec![0.0f64; 6];
            rng.fill_uniform(&mut x, 1.0);
            let dense: Vec<f64> = op.to_dense();
            let mut expected = vec![0.0f64; 6];
            tensor::matvec(&dense, &x, &mut expected, 6, 6);
            let got = op.apply(&x);
            for i in 0..6 {
                assert!((got[i] - expected[i]).abs() < 1e-12, "m={m} i={i}");
            }
        }
    }

    #[test]
    fn test_transpose_matches_dense_transpose() {
        let op = BandedOperator::new(3, 5).unwrap();
        let dense: Vec<i64> = op.to_dense();
        let mut dense_t = vec![0i64; 25];
        tensor::transpose(&dense, &mut dense_t, 5, 5);
        let v = [1i64, -2, 3, 5, 7];
        let mut expected = vec![0i64; 5];
        tensor::matvec(&dense_t, &v, &mut expected, 5, 5);
        assert_eq!(op.apply_transpose(&v), expected);
    }

    #[test]
    fn test_adjoint_identity_integer() {
        // <Aᵀu, v> == <u, Av>, exact in integers.
        let mut rng = SimpleRng::new(11);
        for n in 1..=8 {
            for m in 1..=n + 2 {
                let op = BandedOperator::new(m, n).unwrap();
                let u: Vec<i64> = (0..n).map(|_| rng.range(0, 20) as i64 - 10).collect();
                let v: Vec<i64> = (0..n).map(|_| rng.range(0, 20) as i64 - 10).collect();
                let lhs = tensor::dot(&op.apply_transpose(&u), &v);
                let rhs = tensor::dot(&u, &op.apply(&v));
                assert_eq!(lhs, rhs, "n={n} m={m}");
            }
        }
    }

    #[test]
    fn test_pullback_is_repeatable() {
        let op = BandedOperator::new(2, 4).unwrap();
        let (out, pb) = op.apply_with_pullback(&[1.0f64, 2.0, 3.0, 4.0]);
        assert_eq!(out, vec![4.0, 7.0, 10.0, 8.0]);
        let g1 = pb.pullback(&[1.0f64, 0.0, 0.0, 0.0]);
        let g2 = pb.pullback(&[0.0f64, 0.0, 0.0, 1.0]);
        // First row of A, then last column of Aᵀ.
        assert_eq!(g1, vec![2.0, 1.0, 0.0, 0.0]);
        assert_eq!(g2, vec![0.0, 0.0, 0.0, 2.0]);
        assert_eq!(pb.pullback(&[1.0f64, 0.0, 0.0, 0.0]), g1);
    }

    #[test]
    fn test_multiply_adds_linear_in_n() {
        let m = 3;
        let small = BandedOperator::new(m, 1000).unwrap().multiply_adds();
        let large = BandedOperator::new(m, 2000).unwrap().multiply_adds();
        // n*m - m*(m-1)/2 exactly.
        assert_eq!(small, 1000 * 3 - 3);
        assert_eq!(large, 2000 * 3 - 3);
        assert_eq!(large - small, 1000 * m);
    }

    #[test]
    fn test_try_apply_length_check() {
        let op = BandedOperator::new(2, 3).unwrap();
        assert_eq!(op.try_apply(&[1i64, 2]), Err(BandError::StateLengthMismatch { len: 2, n: 3 }));
        assert!(op.try_apply_transpose(&[1i64, 2, 3]).is_ok());
    }

    #[test]
    fn test_try_apply_reports_overflow() {
        let op = BandedOperator::new(2, 3).unwrap();
        assert_eq!(op.try_apply(&[i64::MAX, 0, 0]), Err(BandError::Overflow { step: 1 }));
        assert_eq!(op.try_apply(&[0i64, 0, i64::MAX / 2]), Ok(vec![0, i64::MAX / 2, i64::MAX - 1]));
        assert_eq!(op.try_apply_transpose(&[0i64, 0, i64::MAX]), Err(BandError::Overflow { step: 1 }));
        // A weight that does not fit the element type.
        let wide = BandedOperator::new(200, 2).unwrap();
        assert_eq!(wide.try_apply(&[1i8, 0]), Err(BandError::Overflow { step: 1 }));
    }

    #[test]
    fn test_checked_apply_matches_apply() {
        let mut rng = SimpleRng::new(5);
        for n in 1..=7 {
            for m in 1..=n + 2 {
                let op = BandedOperator::new(m, n).unwrap();
                let x: Vec<i64> = (0..n).map(|_| rng.range(0, 40) as i64 - 20).collect();
                let mut out = vec![0i64; n];
                assert_eq!(op.checked_apply_into(&x, &mut out), Some(()));
                assert_eq!(out, op.apply(&x), "n={n} m={m}");
                assert_eq!(op.checked_apply_transpose_into(&x, &mut out), Some(()));
                assert_eq!(out, op.apply_transpose(&x), "n={n} m={m}");
            }
        }
    }
}
