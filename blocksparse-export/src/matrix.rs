//! Dense row-major weight matrices.
//!
//! [`WeightMatrix`] is the working representation for every pruning,
//! calibration and encoding routine in this crate. Conversions to and from
//! `candle_core::Tensor` let trainers hand over their live parameters.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// A 2-D `f32` matrix stored row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl WeightMatrix {
    /// Create a matrix from row-major data.
    ///
    /// # Errors
    ///
    /// Returns error if `data.len() != rows * cols`.
    pub fn from_vec(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(ExportError::shape(
                rows,
                cols,
                format!("expected {} elements, got {}", rows * cols, data.len()),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    /// Create a zero-filled matrix.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Create a matrix from nested rows.
    ///
    /// # Errors
    ///
    /// Returns error if the rows are ragged.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(ExportError::shape(
                    rows.len(),
                    cols,
                    format!("ragged row of length {}", row.len()),
                ));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }

    /// Copy a 2-D tensor into a matrix, converting to `f32`.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor is not 2-D.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dims = tensor.dims();
        if dims.len() != 2 {
            return Err(ExportError::InvalidConfig(format!(
                "expected a 2-D tensor, got shape {dims:?}"
            )));
        }
        let (rows, cols) = (dims[0], dims[1]);
        let data = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::from_vec(data, rows, cols)
    }

    /// Copy the matrix into a `(rows, cols)` tensor.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.data.clone(),
            (self.rows, self.cols),
            device,
        )?)
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Whether the matrix is square.
    #[must_use]
    pub const fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Row-major data.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable row-major data.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the matrix, returning its row-major data.
    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Element at `(row, col)`.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        assert!(row < self.rows && col < self.cols, "index out of bounds");
        self.data[row * self.cols + col]
    }

    /// Set the element at `(row, col)`.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        assert!(row < self.rows && col < self.cols, "index out of bounds");
        self.data[row * self.cols + col] = value;
    }

    /// One row as a slice.
    #[must_use]
    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Transposed copy.
    #[must_use]
    pub fn transpose(&self) -> Self {
        let mut data = vec![0.0; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Copy of rows `start..end`.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the matrix.
    pub fn row_band(&self, start: usize, end: usize) -> Result<Self> {
        if start > end || end > self.rows {
            return Err(ExportError::shape(
                self.rows,
                self.cols,
                format!("row band {start}..{end} out of range"),
            ));
        }
        Ok(Self {
            rows: end - start,
            cols: self.cols,
            data: self.data[start * self.cols..end * self.cols].to_vec(),
        })
    }

    /// Overwrite rows starting at `start` with `band`.
    ///
    /// # Errors
    ///
    /// Returns error if the band does not fit.
    pub fn set_row_band(&mut self, start: usize, band: &Self) -> Result<()> {
        if band.cols != self.cols || start + band.rows > self.rows {
            return Err(ExportError::shape(
                self.rows,
                self.cols,
                format!(
                    "band {}x{} does not fit at row {start}",
                    band.rows, band.cols
                ),
            ));
        }
        self.data[start * self.cols..(start + band.rows) * self.cols].copy_from_slice(&band.data);
        Ok(())
    }

    /// Swap two equally sized row bands in place.
    ///
    /// # Errors
    ///
    /// Returns error if either band exceeds the matrix or they overlap.
    pub fn swap_row_bands(&mut self, a: usize, b: usize, len: usize) -> Result<()> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if hi + len > self.rows || lo + len > hi {
            return Err(ExportError::shape(
                self.rows,
                self.cols,
                format!("cannot swap row bands at {a} and {b} of length {len}"),
            ));
        }
        let (head, tail) = self.data.split_at_mut(hi * self.cols);
        head[lo * self.cols..(lo + len) * self.cols].swap_with_slice(&mut tail[..len * self.cols]);
        Ok(())
    }

    /// Sum of squares over the whole matrix.
    #[must_use]
    pub fn energy(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum()
    }

    /// Fraction of exactly-zero elements.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sparsity(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let zeros = self.data.iter().filter(|x| **x == 0.0).count();
        zeros as f32 / self.data.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(WeightMatrix::from_vec(vec![0.0; 6], 2, 3).is_ok());
        assert!(WeightMatrix::from_vec(vec![0.0; 5], 2, 3).is_err());
    }

    #[test]
    fn test_tensor_roundtrip() {
        let device = Device::Cpu;
        let tensor = Tensor::randn(0.0f32, 1.0, (6, 4), &device).unwrap();
        let matrix = WeightMatrix::from_tensor(&tensor).unwrap();
        assert_eq!(matrix.shape(), (6, 4));

        let back = matrix.to_tensor(&device).unwrap();
        let diff = (back - &tensor)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_from_tensor_rejects_3d() {
        let tensor = Tensor::zeros(&[2, 3, 4], DType::F32, &Device::Cpu).unwrap();
        assert!(WeightMatrix::from_tensor(&tensor).is_err());
    }

    #[test]
    fn test_transpose() {
        let m = WeightMatrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        let t = m.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_row_band_roundtrip() {
        let mut m = WeightMatrix::from_vec((0..12).map(|x| x as f32).collect(), 6, 2).unwrap();
        let mut band = m.row_band(2, 4).unwrap();
        assert_eq!(band.as_slice(), &[4.0, 5.0, 6.0, 7.0]);

        band.as_mut_slice().fill(-1.0);
        m.set_row_band(2, &band).unwrap();
        assert_eq!(m.row(2), &[-1.0, -1.0]);
        assert_eq!(m.row(4), &[8.0, 9.0]);
        assert!(m.row_band(5, 7).is_err());
    }

    #[test]
    fn test_swap_row_bands() {
        let mut m = WeightMatrix::from_vec((0..6).map(|x| x as f32).collect(), 6, 1).unwrap();
        m.swap_row_bands(0, 2, 2).unwrap();
        assert_eq!(m.as_slice(), &[2.0, 3.0, 0.0, 1.0, 4.0, 5.0]);
        assert!(m.swap_row_bands(0, 1, 2).is_err());
    }

    #[test]
    fn test_sparsity() {
        let m = WeightMatrix::from_vec(vec![0.0, 1.0, 0.0, 2.0], 2, 2).unwrap();
        assert!((m.sparsity() - 0.5).abs() < f32::EPSILON);
    }
}
