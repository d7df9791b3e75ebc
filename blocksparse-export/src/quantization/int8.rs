//! Signed 8-bit weight quantization with bias compensation.
//!
//! Implements `W_q = round(W / scale)` clipped to `[-128, 127]`, per output
//! channel, together with the `subias` correction used by the int8 kernels.

use serde::{Deserialize, Serialize};

use crate::config::{ClipPolicy, QuantizeConfig};
use crate::error::{ExportError, Result};
use crate::matrix::WeightMatrix;
use crate::quantization::scale::{compute_scaling, INPUT_ALIGN, OUTPUT_ALIGN};

/// Guard added to every scale so all-zero channels divide cleanly.
const SCALE_EPS: f32 = 1e-30;

/// Quantized `[inputs, outputs]` weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensor {
    /// Quantized values, row-major `[inputs, outputs]`.
    pub values: Vec<i8>,

    /// Calibration scale per output channel.
    pub scale: Vec<f32>,

    /// `bias - sum_inputs(values * scale)` per output channel.
    pub subias: Vec<f32>,

    /// `(inputs, outputs)`.
    pub shape: (usize, usize),

    /// Number of values that were clipped into range.
    pub clipped: usize,
}

impl QuantizedTensor {
    /// Input dimension.
    #[must_use]
    pub const fn inputs(&self) -> usize {
        self.shape.0
    }

    /// Output dimension.
    #[must_use]
    pub const fn outputs(&self) -> usize {
        self.shape.1
    }

    /// Scale stored in the artifact: `scale / 127` per output channel.
    #[must_use]
    pub fn export_scale(&self) -> Vec<f32> {
        self.scale.iter().map(|s| s / 127.0).collect()
    }

    /// Values in the 8x4 interleaved order expected by the dense int8 kernel.
    ///
    /// # Errors
    ///
    /// Returns a shape error if the weight does not tile into 4x8 blocks.
    pub fn interleaved_values(&self) -> Result<Vec<i8>> {
        interleave_8x4(&self.values, self.shape.0, self.shape.1)
    }
}

/// Expand a scale given either per channel or as a single broadcast value.
///
/// # Errors
///
/// Returns a shape error for any other length.
pub fn broadcast_scale(scale: &[f32], outputs: usize) -> Result<Vec<f32>> {
    match scale.len() {
        1 => Ok(vec![scale[0]; outputs]),
        n if n == outputs => Ok(scale.to_vec()),
        n => Err(ExportError::shape(
            n,
            1,
            format!("scale must have 1 or {outputs} entries"),
        )),
    }
}

/// Quantize `weight` with a per-output-channel `scale`.
///
/// Returns the quantized values and the number of clipped values.
///
/// # Errors
///
/// Returns a shape error if the scale length does not match, or a calibration
/// error under [`ClipPolicy::Strict`] when a value falls outside `[-128, 127]`.
#[allow(clippy::cast_possible_truncation)]
pub fn quantize_weight(
    weight: &WeightMatrix,
    scale: &[f32],
    config: &QuantizeConfig,
) -> Result<(Vec<i8>, usize)> {
    let (_, n_out) = weight.shape();
    let scale = broadcast_scale(scale, n_out)?;

    let mut clipped = 0;
    let mut values = Vec::with_capacity(weight.as_slice().len());
    for (index, w) in weight.as_slice().iter().enumerate() {
        let q = (w / (scale[index % n_out] + SCALE_EPS)).round_ties_even();
        if !(-128.0..=127.0).contains(&q) {
            if config.clip_policy == ClipPolicy::Strict {
                return Err(ExportError::Calibration { index, value: q });
            }
            clipped += 1;
        }
        values.push(q.clamp(-128.0, 127.0) as i8);
    }

    if clipped > 0 {
        tracing::warn!(
            clipped,
            total = values.len(),
            "quantization clipped values outside int8 range"
        );
    }
    Ok((values, clipped))
}

/// `bias - sum_inputs(values * scale)` per output channel.
///
/// A missing bias counts as zero.
#[must_use]
pub fn compute_subias(
    values: &[i8],
    scale: &[f32],
    bias: Option<&[f32]>,
    shape: (usize, usize),
) -> Vec<f32> {
    let (n_in, n_out) = shape;
    let mut subias: Vec<f32> = bias.map_or_else(|| vec![0.0; n_out], <[f32]>::to_vec);
    for i in 0..n_in {
        for (j, s) in subias.iter_mut().enumerate() {
            *s -= f32::from(values[i * n_out + j]) * scale[j];
        }
    }
    subias
}

/// Calibrate (if `scale` is `None`) and quantize a `[inputs, outputs]` weight.
///
/// # Errors
///
/// Returns error if calibration needs 4x8 alignment the weight lacks, the bias
/// or scale length is wrong, or a strict clip policy is violated.
pub fn quantize(
    weight: &WeightMatrix,
    bias: Option<&[f32]>,
    scale: Option<&[f32]>,
    config: &QuantizeConfig,
) -> Result<QuantizedTensor> {
    let (n_in, n_out) = weight.shape();
    if let Some(b) = bias {
        if b.len() != n_out {
            return Err(ExportError::shape(
                b.len(),
                1,
                format!("bias must have {n_out} entries"),
            ));
        }
    }

    let scale = match scale {
        Some(s) => broadcast_scale(s, n_out)?,
        None => compute_scaling(weight)?,
    };
    let (values, clipped) = quantize_weight(weight, &scale, config)?;
    let subias = compute_subias(&values, &scale, bias, (n_in, n_out));

    Ok(QuantizedTensor {
        values,
        scale,
        subias,
        shape: (n_in, n_out),
        clipped,
    })
}

/// Reconstruct the float weight from quantized values and calibration scale.
///
/// # Errors
///
/// Returns a shape error if `values` does not match `shape`.
pub fn dequantize(quantized: &QuantizedTensor) -> Result<WeightMatrix> {
    let (n_in, n_out) = quantized.shape;
    let data = quantized
        .values
        .iter()
        .enumerate()
        .map(|(i, q)| f32::from(*q) * quantized.scale[i % n_out])
        .collect();
    WeightMatrix::from_vec(data, n_in, n_out)
}

/// Reorder a row-major `[inputs, outputs]` array into 8-output by 4-input tiles:
/// `[outputs/8][inputs/4][8 outputs][4 inputs]`.
///
/// # Errors
///
/// Returns a shape error if the extents are not multiples of 4 and 8.
pub fn interleave_8x4<T: Copy>(values: &[T], n_in: usize, n_out: usize) -> Result<Vec<T>> {
    if n_in % INPUT_ALIGN != 0 || n_out % OUTPUT_ALIGN != 0 || values.len() != n_in * n_out {
        return Err(ExportError::shape(
            n_in,
            n_out,
            "8x4 interleave needs inputs % 4 == 0 and outputs % 8 == 0",
        ));
    }

    let mut out = Vec::with_capacity(values.len());
    for ob in 0..n_out / OUTPUT_ALIGN {
        for ib in 0..n_in / INPUT_ALIGN {
            for o in 0..OUTPUT_ALIGN {
                for i in 0..INPUT_ALIGN {
                    out.push(values[(ib * INPUT_ALIGN + i) * n_out + ob * OUTPUT_ALIGN + o]);
                }
            }
        }
    }
    Ok(out)
}
