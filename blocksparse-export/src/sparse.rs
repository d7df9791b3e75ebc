//! Block-sparse weight encoding.
//!
//! This module provides [`SparseRepresentation`], the storage format consumed
//! by the sparse matrix-vector kernels. A `[inputs, outputs]` weight is split
//! into 4x8 blocks (4 input rows by 8 output columns); only blocks with a
//! non-negligible absolute sum are stored.
//!
//! # Index Format
//!
//! The index is self-delimiting. For each 8-wide output block, in order:
//!
//! ```text
//! count, row_0, row_1, ..., row_{count-1}
//! ```
//!
//! where each `row_k` is the first input row of a stored block. Values follow
//! the same order, 32 per stored block.

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::matrix::WeightMatrix;
use crate::quantization::{INPUT_ALIGN, OUTPUT_ALIGN};

/// Blocks whose absolute sum does not exceed this are treated as zero.
pub const BLOCK_EPSILON: f32 = 1e-10;

const BLOCK_LEN: usize = INPUT_ALIGN * OUTPUT_ALIGN;

/// A weight stored as optional diagonal plus non-zero 4x8 blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseRepresentation {
    /// Concatenated main diagonals of the `k` square sub-blocks, if extracted.
    pub diagonal: Option<Vec<f32>>,

    /// Float block values, each block input-major (4 rows of 8 outputs).
    pub values_float: Vec<f32>,

    /// Int8 block values, each block output-major (8 columns of 4 inputs).
    pub values_int8: Option<Vec<i8>>,

    /// Self-delimiting block index.
    pub index: Vec<i32>,

    /// `(inputs, outputs)` of the encoded weight.
    pub shape: (usize, usize),
}

impl SparseRepresentation {
    /// Number of stored blocks.
    #[must_use]
    pub fn stored_blocks(&self) -> usize {
        self.values_float.len() / BLOCK_LEN
    }

    /// Fraction of 4x8 blocks that are stored.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn block_density(&self) -> f64 {
        let total = (self.shape.0 / INPUT_ALIGN) * (self.shape.1 / OUTPUT_ALIGN);
        if total == 0 {
            return 0.0;
        }
        self.stored_blocks() as f64 / total as f64
    }

    /// Attach an extracted diagonal.
    #[must_use]
    pub fn with_diagonal(mut self, diagonal: Vec<f32>) -> Self {
        self.diagonal = Some(diagonal);
        self
    }

    /// Rebuild the dense float weight from the diagonal, float values and index.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the index is malformed or does not agree with
    /// the stored values or the recorded shape.
    pub fn to_dense(&self) -> Result<WeightMatrix> {
        let (n_in, n_out) = self.shape;
        let malformed = |reason: &str| ExportError::shape(n_in, n_out, reason);
        let mut dense = WeightMatrix::zeros(n_in, n_out);

        let mut cursor = 0;
        let mut block = 0;
        for ob in 0..n_out / OUTPUT_ALIGN {
            let count = *self
                .index
                .get(cursor)
                .ok_or_else(|| malformed("index ends before all output blocks"))?;
            cursor += 1;
            let count =
                usize::try_from(count).map_err(|_| malformed("negative block count"))?;

            for _ in 0..count {
                let row = *self
                    .index
                    .get(cursor)
                    .ok_or_else(|| malformed("index ends inside a block run"))?;
                cursor += 1;
                let row = usize::try_from(row)
                    .ok()
                    .filter(|r| r % INPUT_ALIGN == 0 && r + INPUT_ALIGN <= n_in)
                    .ok_or_else(|| malformed("block row offset out of range"))?;

                let values = self
                    .values_float
                    .get(block * BLOCK_LEN..(block + 1) * BLOCK_LEN)
                    .ok_or_else(|| malformed("index refers to more blocks than stored"))?;
                for (i, chunk) in values.chunks(OUTPUT_ALIGN).enumerate() {
                    for (o, v) in chunk.iter().enumerate() {
                        dense.set(row + i, ob * OUTPUT_ALIGN + o, *v);
                    }
                }
                block += 1;
            }
        }

        if cursor != self.index.len() || block != self.stored_blocks() {
            return Err(malformed("trailing index entries or values"));
        }

        if let Some(diagonal) = &self.diagonal {
            add_diagonal(&mut dense, diagonal)?;
        }
        Ok(dense)
    }
}

/// Split a horizontal concatenation of `k` square `N x N` blocks into its
/// diagonals and the residual with those diagonals zeroed.
///
/// The returned vector holds the `k` diagonals back to back.
///
/// # Errors
///
/// Returns a shape error unless `cols` is a multiple of `rows`.
pub fn extract_diagonal(weight: &WeightMatrix) -> Result<(Vec<f32>, WeightMatrix)> {
    let (n, m) = weight.shape();
    if n == 0 || m % n != 0 {
        return Err(ExportError::shape(
            n,
            m,
            "diagonal extraction needs a concatenation of square blocks",
        ));
    }

    let mut residual = weight.clone();
    let mut diagonal = Vec::with_capacity(m);
    for l in 0..m / n {
        for i in 0..n {
            diagonal.push(residual.get(i, l * n + i));
            residual.set(i, l * n + i, 0.0);
        }
    }
    Ok((diagonal, residual))
}

/// Add concatenated diagonals back onto a residual.
///
/// # Errors
///
/// Returns a shape error if the diagonal length does not match the matrix.
pub fn add_diagonal(residual: &mut WeightMatrix, diagonal: &[f32]) -> Result<()> {
    let (n, m) = residual.shape();
    if n == 0 || m % n != 0 || diagonal.len() != m {
        return Err(ExportError::shape(
            n,
            m,
            format!("diagonal of length {} does not fit", diagonal.len()),
        ));
    }
    for (l, segment) in diagonal.chunks(n).enumerate() {
        for (i, d) in segment.iter().enumerate() {
            let v = residual.get(i, l * n + i);
            residual.set(i, l * n + i, v + d);
        }
    }
    Ok(())
}

/// Encode the non-zero 4x8 blocks of a `[inputs, outputs]` weight.
///
/// Block selection looks at the float values. When `quantized` holds the
/// int8 image of `weight` (same row-major layout), the selected blocks are
/// also stored in int8.
///
/// # Errors
///
/// Returns a shape error if inputs are not a multiple of 4, outputs not a
/// multiple of 8, or `quantized` has the wrong length.
pub fn encode_blocks(weight: &WeightMatrix, quantized: Option<&[i8]>) -> Result<SparseRepresentation> {
    let (n_in, n_out) = weight.shape();
    crate::quantization::check_kernel_alignment(weight)?;
    if let Some(q) = quantized {
        if q.len() != n_in * n_out {
            return Err(ExportError::shape(
                n_in,
                n_out,
                format!("quantized image has {} values", q.len()),
            ));
        }
    }

    let mut index = Vec::new();
    let mut values_float = Vec::new();
    let mut values_int8 = quantized.map(|_| Vec::new());

    for ob in 0..n_out / OUTPUT_ALIGN {
        let count_pos = index.len();
        index.push(0);
        let mut count = 0;

        for ib in 0..n_in / INPUT_ALIGN {
            let rows = ib * INPUT_ALIGN..(ib + 1) * INPUT_ALIGN;
            let cols = ob * OUTPUT_ALIGN..(ob + 1) * OUTPUT_ALIGN;

            let abs_sum: f32 = rows
                .clone()
                .flat_map(|r| weight.row(r)[cols.clone()].iter())
                .map(|v| v.abs())
                .sum();
            if abs_sum <= BLOCK_EPSILON {
                continue;
            }

            count += 1;
            index.push(block_offset(ib * INPUT_ALIGN)?);
            for r in rows.clone() {
                values_float.extend_from_slice(&weight.row(r)[cols.clone()]);
            }
            if let (Some(q), Some(out)) = (quantized, values_int8.as_mut()) {
                for c in cols {
                    out.extend(rows.clone().map(|r| q[r * n_out + c]));
                }
            }
        }
        index[count_pos] = block_offset(count)?;
    }

    Ok(SparseRepresentation {
        diagonal: None,
        values_float,
        values_int8,
        index,
        shape: (n_in, n_out),
    })
}

fn block_offset(value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| ExportError::shape(value, 0, "block index does not fit in int32"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(rows: usize, cols: usize) -> WeightMatrix {
        let data = (0..rows * cols).map(|i| ((i as f32) * 0.29).sin()).collect();
        WeightMatrix::from_vec(data, rows, cols).unwrap()
    }

    #[test]
    fn test_extract_diagonal_roundtrip() {
        let w = patterned(8, 24);
        let (diag, mut residual) = extract_diagonal(&w).unwrap();
        assert_eq!(diag.len(), 24);
        assert_eq!(diag[8 + 3], w.get(3, 8 + 3));
        assert_eq!(residual.get(5, 16 + 5), 0.0);

        add_diagonal(&mut residual, &diag).unwrap();
        assert_eq!(residual, w);
    }

    #[test]
    fn test_extract_diagonal_rejects_non_square_blocks() {
        assert!(matches!(
            extract_diagonal(&WeightMatrix::zeros(8, 12)),
            Err(ExportError::Shape { .. })
        ));
    }

    #[test]
    fn test_index_format() {
        let mut w = WeightMatrix::zeros(8, 16);
        // Output block 0: only rows 4..8 non-zero.
        w.set(5, 2, 1.0);
        // Output block 1: both row blocks non-zero.
        w.set(0, 9, -1.0);
        w.set(7, 15, 0.5);

        let sparse = encode_blocks(&w, None).unwrap();
        assert_eq!(sparse.index, vec![1, 4, 2, 0, 4]);
        assert_eq!(sparse.stored_blocks(), 3);
        assert_eq!(sparse.values_float.len(), 3 * 32);
        // Float blocks are input-major: row 5 is the second row of the block.
        assert_eq!(sparse.values_float[8 + 2], 1.0);
        assert!(sparse.values_int8.is_none());
    }

    #[test]
    fn test_int8_blocks_are_output_major() {
        let mut w = WeightMatrix::zeros(4, 8);
        let mut q = vec![0i8; 32];
        for r in 0..4 {
            for c in 0..8 {
                w.set(r, c, 1.0);
                q[r * 8 + c] = i8::try_from(r * 10 + c).unwrap();
            }
        }
        let sparse = encode_blocks(&w, Some(&q)).unwrap();
        let values = sparse.values_int8.unwrap();
        assert_eq!(&values[..4], &[0, 10, 20, 30]);
        assert_eq!(&values[4..8], &[1, 11, 21, 31]);
    }

    #[test]
    fn test_all_zero_weight() {
        let sparse = encode_blocks(&WeightMatrix::zeros(8, 16), None).unwrap();
        assert_eq!(sparse.index, vec![0, 0]);
        assert!(sparse.values_float.is_empty());
        assert_eq!(sparse.block_density(), 0.0);
    }

    #[test]
    fn test_to_dense_roundtrip_with_diagonal() {
        let mut w = patterned(8, 24);
        // Zero a block so the encoding is actually sparse.
        for r in 4..8 {
            for c in 8..16 {
                w.set(r, c, 0.0);
            }
        }
        let (diag, residual) = extract_diagonal(&w).unwrap();
        let sparse = encode_blocks(&residual, None).unwrap().with_diagonal(diag);
        assert!(sparse.block_density() < 1.0);
        assert_eq!(sparse.to_dense().unwrap(), w);
    }

    #[test]
    fn test_to_dense_rejects_truncated_index() {
        let mut sparse = encode_blocks(&patterned(4, 16), None).unwrap();
        sparse.index.pop();
        assert!(sparse.to_dense().is_err());
    }

    #[test]
    fn test_alignment_required() {
        assert!(encode_blocks(&WeightMatrix::zeros(6, 8), None).is_err());
        assert!(encode_blocks(&WeightMatrix::zeros(4, 8), Some(&[0; 4])).is_err());
    }
}
