/// Minimal matrix utilities for the recurrence kernels.
///
/// Free functions on flat slices with explicit dimensions, plus a small
/// row-major `Matrix` that carries its shape. Row-major layout throughout:
/// element (i, t) of an n×T input sequence lives at `data[i * T + t]`.

use num_traits::{NumAssign, NumCast};

use crate::error::{BandError, Result};

/// Numeric element a state vector may hold. Integer types give exact
/// arithmetic; floating types follow ordinary IEEE evaluation order.
pub trait Element: Copy + std::fmt::Debug + PartialEq + NumAssign + NumCast + Send + Sync + 'static {
    /// Band coefficient `w` converted into this element type.
    fn weight(w: usize) -> Self;

    /// `self + rhs`, or `None` when the sum leaves the range of the type.
    /// Floats always succeed and follow IEEE overflow to infinity.
    fn checked_sum(self, rhs: Self) -> Option<Self>;

    /// `self * rhs`, or `None` when the product leaves the range of the type.
    fn checked_product(self, rhs: Self) -> Option<Self>;
}

macro_rules! int_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            #[inline]
            fn weight(w: usize) -> Self {
                w as $t
            }

            #[inline]
            fn checked_sum(self, rhs: Self) -> Option<Self> {
                self.checked_add(rhs)
            }

            #[inline]
            fn checked_product(self, rhs: Self) -> Option<Self> {
                self.checked_mul(rhs)
            }
        }
    )*};
}

macro_rules! float_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            #[inline]
            fn weight(w: usize) -> Self {
                w as $t
            }

            #[inline]
            fn checked_sum(self, rhs: Self) -> Option<Self> {
                Some(self + rhs)
            }

            #[inline]
            fn checked_product(self, rhs: Self) -> Option<Self> {
                Some(self * rhs)
            }
        }
    )*};
}

int_element!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
float_element!(f32, f64);

/// Flat row-major matrix with shape metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}

impl<T: Element> Matrix<T> {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Matrix { data: vec![T::zero(); rows * cols], rows, cols }
    }

    /// Wrap an existing row-major buffer. Fails if the length disagrees with the shape.
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(BandError::ShapeMismatch { len: data.len(), rows, cols });
        }
        Ok(Matrix { data, rows, cols })
    }

    /// Build from `f(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(f(i, j));
            }
        }
        Matrix { data, rows, cols }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> T {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        self.data[row * self.cols + col] = value;
    }

    /// Copy column `col` into `out` (length `rows`).
    pub fn column_into(&self, col: usize, out: &mut [T]) {
        debug_assert!(col < self.cols);
        debug_assert_eq!(out.len(), self.rows);
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.data[i * self.cols + col];
        }
    }

    pub fn column(&self, col: usize) -> Vec<T> {
        let mut out = vec![T::zero(); self.rows];
        self.column_into(col, &mut out);
        out
    }

    /// Overwrite column `col` with `values`.
    pub fn set_column(&mut self, col: usize, values: &[T]) {
        debug_assert!(col < self.cols);
        debug_assert_eq!(values.len(), self.rows);
        for (i, &v) in values.iter().enumerate() {
            self.data[i * self.cols + col] = v;
        }
    }

    /// Element-wise conversion, e.g. integer inputs to `f64` for the tape.
    pub fn map<U: Element>(&self, f: impl Fn(T) -> U) -> Matrix<U> {
        Matrix { data: self.data.iter().map(|&v| f(v)).collect(), rows: self.rows, cols: self.cols }
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul<T: Element>(a: &[T], b: &[T], out: &mut [T], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        for j in 0..n {
            let mut sum = T::zero();
            for p in 0..k {
                sum += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = sum;
        }
    }
}

/// Dense matrix-vector product: out[M] = A[M,K] @ x[K].
pub fn matvec<T: Element>(a: &[T], x: &[T], out: &mut [T], m: usize, k: usize) {
    matmul(a, x, out, m, k, 1);
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose<T: Element>(a: &[T], out: &mut [T], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// In-place accumulate: acc[i] += x[i].
pub fn add_assign<T: Element>(acc: &mut [T], x: &[T]) {
    debug_assert_eq!(acc.len(), x.len());
    for (a, &v) in acc.iter_mut().zip(x.iter()) {
        *a += v;
    }
}

/// `add_assign` that stops at the first sum outside the range of `T`.
/// On `None`, `acc` is partially updated.
pub fn checked_add_assign<T: Element>(acc: &mut [T], x: &[T]) -> Option<()> {
    debug_assert_eq!(acc.len(), x.len());
    for (a, &v) in acc.iter_mut().zip(x.iter()) {
        *a = a.checked_sum(v)?;
    }
    Some(())
}

/// Inner product sum_i a[i] * b[i].
pub fn dot<T: Element>(a: &[T], b: &[T]) -> T {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = T::zero();
    for (&x, &y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

/// Simple xorshift64 PRNG for deterministic test data. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f64) -> f64 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u - 1.0) * scale
    }

    /// Uniform integer in [lo, hi] inclusive.
    pub fn range(&mut self, lo: usize, hi: usize) -> usize {
        debug_assert!(lo <= hi);
        lo + (self.next_u64() % (hi - lo + 1) as u64) as usize
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f64], scale: f64) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }
}
