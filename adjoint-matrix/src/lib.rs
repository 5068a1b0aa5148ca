//!
//! # adjoint-matrix
//!
//! Companion dense-matrix type: element-wise arithmetic, matrix
//! products, and Gauss-Jordan inversion over the same generic scalar
//! the autodiff engine uses. Deliberately independent of the engine;
//! a larger program may feed scalar gradients into matrices, but
//! nothing here records graph nodes
//!

use std::fmt;
use std::ops::{Add, Index, IndexMut, Mul, Sub};

use num_traits::Float;

use thiserror::Error;

/// Entries whose magnitude falls below this count as zero during
/// pivoting
const PIVOT_TOLERANCE: f64 = 1.0e-6;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MatrixError {
  #[error("matrix is {rows}x{cols}, inversion needs a square matrix")]
  NotSquare { rows: usize, cols: usize },
  #[error("matrix is rank deficient, no inverse exists")]
  RankDeficient,
}

/// Row-major dense matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix<T = f64> {
  rows: usize,
  cols: usize,
  data: Vec<T>,
}

impl<T: Float> Matrix<T> {
  /// Zero-filled `rows x cols` matrix
  pub fn zeros(rows: usize, cols: usize) -> Self {
    Self {
      rows,
      cols,
      data: vec![T::zero(); rows * cols],
    }
  }

  /// Build from row slices; every row must have the same length
  pub fn from_rows<R>(rows: &[R]) -> Self
  where
    R: AsRef<[T]>,
  {
    let cols = rows.first().map_or(0, |row| row.as_ref().len());
    let mut data = Vec::with_capacity(rows.len() * cols);
    for row in rows {
      let row = row.as_ref();
      assert_eq!(row.len(), cols, "all rows must have the same length");
      data.extend_from_slice(row);
    }
    Self {
      rows: rows.len(),
      cols,
      data,
    }
  }

  /// `n x n` matrix with `value` on the diagonal, zero elsewhere
  pub fn diagonal(n: usize, value: T) -> Self {
    let mut out = Self::zeros(n, n);
    for i in 0..n {
      out[(i, i)] = value;
    }
    out
  }

  pub fn identity(n: usize) -> Self {
    Self::diagonal(n, T::one())
  }

  #[inline]
  pub fn rows(&self) -> usize {
    self.rows
  }

  #[inline]
  pub fn cols(&self) -> usize {
    self.cols
  }

  fn swap_rows(&mut self, a: usize, b: usize) {
    for j in 0..self.cols {
      self.data.swap(a * self.cols + j, b * self.cols + j);
    }
  }

  /// Invert via Gauss-Jordan elimination on the `[A | I]` augmented
  /// matrix, with row swaps when a diagonal entry is unusable
  pub fn inv(&self) -> Result<Self, MatrixError> {
    if self.rows != self.cols {
      return Err(MatrixError::NotSquare {
        rows: self.rows,
        cols: self.cols,
      });
    }

    let n = self.rows;
    let tolerance = T::from(PIVOT_TOLERANCE).unwrap_or_else(T::epsilon);

    let mut aug = Matrix::zeros(n, 2 * n);
    for i in 0..n {
      for j in 0..n {
        aug[(i, j)] = self[(i, j)];
      }
      aug[(i, i + n)] = T::one();
    }

    for col in 0..n {
      // first row at or below the diagonal with a usable pivot
      let pivot = (col..n)
        .find(|&row| aug[(row, col)].abs() > tolerance)
        .ok_or(MatrixError::RankDeficient)?;
      if pivot != col {
        aug.swap_rows(pivot, col);
      }

      let lead = aug[(col, col)];
      for j in 0..2 * n {
        aug[(col, j)] = aug[(col, j)] / lead;
      }

      for row in 0..n {
        if row == col {
          continue;
        }
        let factor = aug[(row, col)];
        for j in 0..2 * n {
          aug[(row, j)] = aug[(row, j)] - factor * aug[(col, j)];
        }
      }
    }

    let mut out = Matrix::zeros(n, n);
    for i in 0..n {
      for j in 0..n {
        out[(i, j)] = aug[(i, j + n)];
      }
    }
    Ok(out)
  }
}

impl<T> Index<(usize, usize)> for Matrix<T> {
  type Output = T;

  #[inline]
  fn index(&self, (row, col): (usize, usize)) -> &T {
    assert!(row < self.rows && col < self.cols, "index out of bounds");
    &self.data[row * self.cols + col]
  }
}

impl<T> IndexMut<(usize, usize)> for Matrix<T> {
  #[inline]
  fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut T {
    assert!(row < self.rows && col < self.cols, "index out of bounds");
    &mut self.data[row * self.cols + col]
  }
}

impl<T: Float> Add for &Matrix<T> {
  type Output = Matrix<T>;

  fn add(self, other: Self) -> Self::Output {
    assert!(
      self.rows == other.rows && self.cols == other.cols,
      "matrix addition needs matching dimensions"
    );
    let mut out = Matrix::zeros(self.rows, self.cols);
    for (slot, value) in out.data.iter_mut().enumerate() {
      *value = self.data[slot] + other.data[slot];
    }
    out
  }
}

impl<T: Float> Sub for &Matrix<T> {
  type Output = Matrix<T>;

  fn sub(self, other: Self) -> Self::Output {
    assert!(
      self.rows == other.rows && self.cols == other.cols,
      "matrix subtraction needs matching dimensions"
    );
    let mut out = Matrix::zeros(self.rows, self.cols);
    for (slot, value) in out.data.iter_mut().enumerate() {
      *value = self.data[slot] - other.data[slot];
    }
    out
  }
}

impl<T: Float> Mul for &Matrix<T> {
  type Output = Matrix<T>;

  fn mul(self, other: Self) -> Self::Output {
    assert_eq!(
      self.cols, other.rows,
      "matrix product needs inner dimensions to agree"
    );
    let mut out = Matrix::zeros(self.rows, other.cols);
    for i in 0..self.rows {
      for j in 0..other.cols {
        let mut acc = T::zero();
        for k in 0..self.cols {
          acc = acc + self[(i, k)] * other[(k, j)];
        }
        out[(i, j)] = acc;
      }
    }
    out
  }
}

impl<T: Float> Mul<T> for &Matrix<T> {
  type Output = Matrix<T>;

  fn mul(self, scalar: T) -> Self::Output {
    let mut out = self.clone();
    for value in &mut out.data {
      *value = *value * scalar;
    }
    out
  }
}

macro_rules! forward_binary {
  ($op:ident, $method:ident) => {
    impl<T: Float> $op<Matrix<T>> for &Matrix<T> {
      type Output = Matrix<T>;

      #[inline(always)]
      fn $method(self, other: Matrix<T>) -> Self::Output {
        self.$method(&other)
      }
    }

    impl<T: Float> $op for Matrix<T> {
      type Output = Matrix<T>;

      #[inline(always)]
      fn $method(self, other: Self) -> Self::Output {
        (&self).$method(&other)
      }
    }

    impl<T: Float> $op<&Matrix<T>> for Matrix<T> {
      type Output = Matrix<T>;

      #[inline(always)]
      fn $method(self, other: &Matrix<T>) -> Self::Output {
        (&self).$method(other)
      }
    }
  };
}

forward_binary!(Add, add);
forward_binary!(Sub, sub);
forward_binary!(Mul, mul);

impl<T: Float> Mul<T> for Matrix<T> {
  type Output = Matrix<T>;

  #[inline(always)]
  fn mul(self, scalar: T) -> Self::Output {
    (&self).mul(scalar)
  }
}

impl<T: Float + fmt::Display> fmt::Display for Matrix<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for i in 0..self.rows {
      for j in 0..self.cols {
        if j > 0 {
          f.write_str(" ")?;
        }
        write!(f, "{}", self[(i, j)])?;
      }
      writeln!(f)?;
    }
    Ok(())
  }
}
