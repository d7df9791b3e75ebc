//! Per-channel scale calibration.

use crate::error::{ExportError, Result};
use crate::matrix::WeightMatrix;

/// Input rows per kernel block.
pub const INPUT_ALIGN: usize = 4;

/// Output channels per kernel block.
pub const OUTPUT_ALIGN: usize = 8;

/// Check that a `[inputs, outputs]` weight tiles into 4x8 kernel blocks.
///
/// # Errors
///
/// Returns a shape error otherwise.
pub fn check_kernel_alignment(weight: &WeightMatrix) -> Result<()> {
    let (n_in, n_out) = weight.shape();
    if n_in % INPUT_ALIGN != 0 || n_out % OUTPUT_ALIGN != 0 {
        return Err(ExportError::shape(
            n_in,
            n_out,
            format!(
                "inputs must be a multiple of {INPUT_ALIGN} and outputs a multiple of {OUTPUT_ALIGN}"
            ),
        ));
    }
    Ok(())
}

/// Compute the per-output-channel scale of a `[inputs, outputs]` weight.
///
/// For each output channel:
///
/// ```text
/// scale = max(max|w| / 127, max|w[2k] + w[2k+1]| / 129)
/// ```
///
/// The kernels accumulate adjacent input pairs before widening, so the pair
/// sum must also fit the int8 budget.
///
/// # Errors
///
/// Returns a shape error if inputs are not a multiple of 4 or outputs not a
/// multiple of 8.
pub fn compute_scaling(weight: &WeightMatrix) -> Result<Vec<f32>> {
    check_kernel_alignment(weight)?;
    let (n_in, n_out) = weight.shape();

    let mut max_abs = vec![0.0f32; n_out];
    let mut max_pair = vec![0.0f32; n_out];

    for k in (0..n_in).step_by(2) {
        let even = weight.row(k);
        let odd = weight.row(k + 1);
        for j in 0..n_out {
            max_abs[j] = max_abs[j].max(even[j].abs()).max(odd[j].abs());
            max_pair[j] = max_pair[j].max((even[j] + odd[j]).abs());
        }
    }

    Ok(max_abs
        .iter()
        .zip(&max_pair)
        .map(|(a, p)| (a / 127.0).max(p / 129.0))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_from_max_abs() {
        // Alternating signs: pair sums vanish, max |w| decides.
        let mut w = WeightMatrix::zeros(4, 8);
        for j in 0..8 {
            w.set(0, j, 1.27);
            w.set(1, j, -1.27);
        }
        let scale = compute_scaling(&w).unwrap();
        for s in scale {
            assert!((s - 0.01).abs() < 1e-6);
        }
    }

    #[test]
    fn test_scale_from_pair_sum() {
        // Correlated pair: 1.29 + 1.29 over 129 beats 1.29 over 127.
        let mut w = WeightMatrix::zeros(4, 8);
        for j in 0..8 {
            w.set(2, j, 1.29);
            w.set(3, j, 1.29);
        }
        let scale = compute_scaling(&w).unwrap();
        assert!((scale[0] - 0.02).abs() < 1e-6);
    }

    #[test]
    fn test_scale_per_channel() {
        let mut w = WeightMatrix::zeros(4, 8);
        w.set(0, 3, 2.54);
        let scale = compute_scaling(&w).unwrap();
        assert!((scale[3] - 0.02).abs() < 1e-6);
        assert_eq!(scale[0], 0.0);
    }

    #[test]
    fn test_alignment_required() {
        assert!(compute_scaling(&WeightMatrix::zeros(6, 8)).is_err());
        assert!(compute_scaling(&WeightMatrix::zeros(4, 12)).is_err());
    }
}
