//! Magnitude-based block pruning.
//!
//! A matrix is partitioned into `block_shape` tiles; tiles are ranked by their
//! sum-of-squares energy and every tile whose energy falls below the energy of
//! the `survivors`-th strongest tile is zeroed.

use serde::{Deserialize, Serialize};

use crate::config::GateConfig;
use crate::error::{ExportError, Result};
use crate::matrix::WeightMatrix;

/// Keep/drop decision per block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMask {
    block_rows: usize,
    block_cols: usize,
    keep: Vec<bool>,
}

impl BlockMask {
    /// Number of block rows (`matrix rows / block rows`).
    #[must_use]
    pub const fn block_rows(&self) -> usize {
        self.block_rows
    }

    /// Number of block columns (`matrix cols / block cols`).
    #[must_use]
    pub const fn block_cols(&self) -> usize {
        self.block_cols
    }

    /// Whether block `(br, bc)` survives.
    #[must_use]
    pub fn is_kept(&self, br: usize, bc: usize) -> bool {
        self.keep[br * self.block_cols + bc]
    }

    /// Number of surviving blocks.
    #[must_use]
    pub fn kept(&self) -> usize {
        self.keep.iter().filter(|k| **k).count()
    }

    /// Total number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keep.len()
    }

    /// Whether the mask has no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keep.is_empty()
    }

    /// Fraction of surviving blocks.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn density(&self) -> f64 {
        if self.keep.is_empty() {
            return 1.0;
        }
        self.kept() as f64 / self.keep.len() as f64
    }
}

fn check_block_shape(m: usize, n: usize, (m1, n1): (usize, usize)) -> Result<()> {
    if m1 == 0 || n1 == 0 || m % m1 != 0 || n % n1 != 0 {
        return Err(ExportError::shape(
            m,
            n,
            format!("block size ({m1}, {n1}) does not divide matrix"),
        ));
    }
    Ok(())
}

/// Sum-of-squares energy of every block, row-major over the block grid.
///
/// # Errors
///
/// Returns a shape error if `block_shape` does not divide the matrix.
pub fn block_energies(matrix: &WeightMatrix, block_shape: (usize, usize)) -> Result<Vec<f32>> {
    let (m, n) = matrix.shape();
    let (m1, n1) = block_shape;
    check_block_shape(m, n, block_shape)?;

    let grid_cols = n / n1;
    let mut energies = vec![0.0f32; (m / m1) * grid_cols];
    for r in 0..m {
        let row = matrix.row(r);
        let br = r / m1;
        for (c, v) in row.iter().enumerate() {
            energies[br * grid_cols + c / n1] += v * v;
        }
    }
    Ok(energies)
}

/// Number of blocks kept at `density`, rounding half to even.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn survivor_count(num_blocks: usize, density: f64) -> usize {
    let exact = num_blocks as f64 * density.clamp(0.0, 1.0);
    (exact.round_ties_even() as usize).min(num_blocks)
}

/// Prune `matrix` in place to `density` and return the resulting block mask.
///
/// The survival threshold is the energy of the `survivors`-th strongest block;
/// blocks at or above it are kept, so ties at the threshold can keep more blocks
/// than the nominal count. The decision depends on energy values only, never on
/// block order. With zero survivors every block is dropped.
///
/// When `config.keep_diagonal` is set the main diagonal is taken out before
/// ranking and restored afterwards, so it never counts toward block energy and
/// is never zeroed.
///
/// # Errors
///
/// Returns a shape error if the block shape does not divide the matrix or if
/// the diagonal is requested on a non-square matrix.
pub fn sparsify_matrix(
    matrix: &mut WeightMatrix,
    density: f64,
    config: &GateConfig,
) -> Result<BlockMask> {
    let (m, n) = matrix.shape();
    let (m1, n1) = config.block_shape;

    check_block_shape(m, n, config.block_shape)?;

    let diagonal = if config.keep_diagonal {
        if !matrix.is_square() {
            return Err(ExportError::shape(
                m,
                n,
                "keep_diagonal requires a square matrix",
            ));
        }
        let diag: Vec<f32> = (0..m).map(|i| matrix.get(i, i)).collect();
        for i in 0..m {
            matrix.set(i, i, 0.0);
        }
        Some(diag)
    } else {
        None
    };

    let energies = block_energies(matrix, config.block_shape)?;
    let survivors = survivor_count(energies.len(), density);
    let keep: Vec<bool> = if survivors == 0 {
        vec![false; energies.len()]
    } else {
        let mut sorted = energies.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let threshold = sorted[survivors - 1];
        energies.iter().map(|e| *e >= threshold).collect()
    };

    let grid_cols = n / n1;
    for r in 0..m {
        let br = r / m1;
        for c in 0..n {
            if !keep[br * grid_cols + c / n1] {
                matrix.set(r, c, 0.0);
            }
        }
    }

    if let Some(diag) = diagonal {
        for (i, d) in diag.into_iter().enumerate() {
            matrix.set(i, i, d);
        }
    }

    Ok(BlockMask {
        block_rows: m / m1,
        block_cols: grid_cols,
        keep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, cols: usize) -> WeightMatrix {
        let data = (0..rows * cols).map(|i| (i as f32 * 0.37).sin() + 0.1).collect();
        WeightMatrix::from_vec(data, rows, cols).unwrap()
    }

    /// 8x8 matrix whose four 4x4 blocks hold constants 1, 2, 3, 4.
    fn quadrants() -> WeightMatrix {
        let mut m = WeightMatrix::zeros(8, 8);
        for r in 0..8 {
            for c in 0..8 {
                let v = match (r / 4, c / 4) {
                    (0, 0) => 1.0,
                    (0, 1) => 3.0,
                    (1, 0) => 4.0,
                    _ => 2.0,
                };
                m.set(r, c, v);
            }
        }
        m
    }

    #[test]
    fn test_block_energies() {
        let energies = block_energies(&quadrants(), (4, 4)).unwrap();
        // 16 elements per block.
        assert_eq!(energies, vec![16.0, 144.0, 256.0, 64.0]);
    }

    #[test]
    fn test_density_half_keeps_two_strongest_blocks() {
        let mut m = quadrants();
        let mask = sparsify_matrix(&mut m, 0.5, &GateConfig::new(0.5, (4, 4), false)).unwrap();

        assert_eq!(mask.kept(), 2);
        assert!(!mask.is_kept(0, 0));
        assert!(mask.is_kept(0, 1));
        assert!(mask.is_kept(1, 0));
        assert!(!mask.is_kept(1, 1));

        assert_eq!(m.get(0, 0), 0.0);
        assert_eq!(m.get(0, 4), 3.0);
        assert_eq!(m.get(4, 0), 4.0);
        assert_eq!(m.get(7, 7), 0.0);
    }

    #[test]
    fn test_full_density_is_identity() {
        let original = ramp(8, 12);
        let mut m = original.clone();
        let mask = sparsify_matrix(&mut m, 1.0, &GateConfig::new(1.0, (2, 4), false)).unwrap();
        assert_eq!(m, original);
        assert_eq!(mask.kept(), mask.len());
    }

    #[test]
    fn test_zero_density_zeroes_matrix() {
        let mut m = ramp(8, 8);
        let mask = sparsify_matrix(&mut m, 0.0, &GateConfig::new(0.0, (4, 2), false)).unwrap();
        assert_eq!(mask.kept(), 0);
        assert!(m.as_slice().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_zero_density_keeps_diagonal() {
        let original = ramp(8, 8);
        let mut m = original.clone();
        sparsify_matrix(&mut m, 0.0, &GateConfig::new(0.0, (4, 4), true)).unwrap();
        for r in 0..8 {
            for c in 0..8 {
                let expected = if r == c { original.get(r, c) } else { 0.0 };
                assert_eq!(m.get(r, c), expected);
            }
        }
    }

    #[test]
    fn test_ties_at_threshold_are_all_kept() {
        // Four identical blocks, half density: every block ties at the threshold.
        let mut m = WeightMatrix::from_vec(vec![1.0; 64], 8, 8).unwrap();
        let mask = sparsify_matrix(&mut m, 0.5, &GateConfig::new(0.5, (4, 4), false)).unwrap();
        assert_eq!(mask.kept(), 4);
        assert!(m.as_slice().iter().all(|x| *x == 1.0));
    }

    #[test]
    fn test_tie_resolution_is_order_independent() {
        // Blocks with energies 1, 4, 4, 9: keeping two admits both ties.
        let mut m = WeightMatrix::zeros(2, 8);
        for c in 0..8 {
            let v = [0.5, 1.0, 1.0, 1.5][c / 2];
            m.set(0, c, v);
            m.set(1, c, v);
        }
        let mut flipped = m.clone();
        for c in 0..8 {
            flipped.set(0, c, m.get(0, 7 - c));
            flipped.set(1, c, m.get(1, 7 - c));
        }

        let config = GateConfig::new(0.5, (2, 2), false);
        let a = sparsify_matrix(&mut m, 0.5, &config).unwrap();
        let b = sparsify_matrix(&mut flipped, 0.5, &config).unwrap();
        assert_eq!(a.kept(), 3);
        assert_eq!(b.kept(), 3);
        assert!(!a.is_kept(0, 0));
        assert!(!b.is_kept(0, 3));
    }

    #[test]
    fn test_survivor_rounding_half_even() {
        assert_eq!(survivor_count(4, 0.5), 2);
        assert_eq!(survivor_count(5, 0.5), 2);
        assert_eq!(survivor_count(7, 0.5), 4);
        assert_eq!(survivor_count(10, 0.0), 0);
        assert_eq!(survivor_count(10, 1.0), 10);
    }

    #[test]
    fn test_indivisible_block_shape_fails() {
        let mut m = ramp(10, 8);
        let err = sparsify_matrix(&mut m, 0.5, &GateConfig::new(0.5, (4, 4), false));
        assert!(matches!(err, Err(ExportError::Shape { .. })));
    }

    #[test]
    fn test_keep_diagonal_requires_square() {
        let mut m = ramp(8, 16);
        let err = sparsify_matrix(&mut m, 0.5, &GateConfig::new(0.5, (4, 4), true));
        assert!(matches!(err, Err(ExportError::Shape { .. })));
    }

    #[test]
    fn test_diagonal_does_not_count_toward_energy() {
        // Only the diagonal is large; off-diagonal energy lives in block (0, 1).
        let mut m = WeightMatrix::zeros(8, 8);
        for i in 0..8 {
            m.set(i, i, 100.0);
        }
        m.set(0, 5, 0.5);
        let mask = sparsify_matrix(&mut m, 0.25, &GateConfig::new(0.25, (4, 4), true)).unwrap();
        assert!(mask.is_kept(0, 1));
        assert_eq!(mask.kept(), 1);
        assert_eq!(m.get(0, 5), 0.5);
        assert_eq!(m.get(3, 3), 100.0);
        assert_eq!(m.get(6, 6), 100.0);
    }
}
