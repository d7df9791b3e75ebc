//! Int8 quantization for export.
//!
//! This module provides:
//! - **Calibration**: per-output-channel scales from max-abs and pair-sum bounds
//! - **Quantization**: `round(W / scale)` clipped to int8, plus `subias`

mod int8;
mod scale;

pub use int8::{
    broadcast_scale, compute_subias, dequantize, interleave_8x4, quantize, quantize_weight,
    QuantizedTensor,
};
pub use scale::{check_kernel_alignment, compute_scaling, INPUT_ALIGN, OUTPUT_ALIGN};
