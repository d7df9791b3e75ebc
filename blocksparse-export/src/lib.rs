//! Block sparsification, int8 calibration and C weight-blob export for
//! recurrent networks.
//!
//! This crate turns trained weights into a deployable artifact:
//! - **Progressive pruning**: low-energy blocks of GRU gate matrices are zeroed
//!   on a cubic schedule during training
//! - **Int8 calibration**: per-output-channel scales with `subias` correction
//! - **Block-sparse encoding**: diagonal, non-zero 4x8 blocks and a
//!   self-delimiting index
//! - **Blob emission**: a C declarations unit and initialization unit with a
//!   named-array registry and an init routine
//!
//! # Quick Start
//!
//! ```no_run
//! use blocksparse_export::prelude::*;
//! use candle_core::{DType, Device, Tensor};
//!
//! # fn main() -> blocksparse_export::Result<()> {
//! let device = Device::Cpu;
//! let w_ih = Tensor::randn(0.0f32, 0.1, (96, 64), &device)?;
//! let w_hh = Tensor::randn(0.0f32, 0.1, (96, 32), &device)?;
//! let mut units = vec![GruWeights::from_tensors("gru1", &w_ih, &w_hh, None, None)?];
//!
//! // Training loop: one scheduler step per optimizer step.
//! let task = SparsificationTask::new("gru1", GateSet::recurrent_default());
//! let mut scheduler = SparsificationScheduler::new(vec![task], SchedulerConfig::default())?;
//! for _ in 0..10_000 {
//!     scheduler.step(&mut units)?;
//! }
//!
//! // Export.
//! let config = ExportConfig::default().with_quantize(true);
//! let mut exporter = ModelExporter::create("rnn_data", config)?;
//! let dense = Tensor::zeros((8, 32), DType::F32, &device)?;
//! exporter.export("gru1", &Layer::Gru(units.remove(0)))?;
//! exporter.export("dense_out", &Layer::Dense { weight: dense, bias: None })?;
//! let blob = exporter.finish()?;
//! blob.save_weights_file("rnn_data.bin")?;
//! # Ok(())
//! # }
//! ```
//!
//! # Sparsification Schedule
//!
//! Between `start` and `stop` the scheduler acts every `interval` steps with
//!
//! ```text
//! alpha   = ((stop - step) / (stop - start)) ^ exponent
//! density = alpha + (1 - alpha) * target_density
//! ```
//!
//! and on every step after `stop` with `density = target_density`.
//!
//! # Quantization
//!
//! ```text
//! scale  = max(max|W| / 127, max|W[2k] + W[2k+1]| / 129)
//! W_q    = round(W / scale) clamped to [-128, 127]
//! subias = bias - sum_inputs(W_q * scale)
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::doc_markdown)] // Many technical terms don't need backticks

mod config;
mod error;
mod matrix;
pub mod export;
pub mod quantization;
pub mod sparse;
pub mod sparsify;

pub use config::{
    ClipPolicy, ExportConfig, Gate, GateConfig, GateSet, QuantizeConfig, SchedulerConfig,
    WriterConfig,
};
pub use error::{ExportError, Result};
pub use export::{
    export_linear, ArrayData, BlobWriter, Layer, LayerReport, LinearOptions, ModelBlob,
    ModelExporter, NamedArray, TypeTag,
};
pub use matrix::WeightMatrix;
pub use quantization::{compute_scaling, dequantize, quantize, QuantizedTensor};
pub use sparse::{encode_blocks, extract_diagonal, SparseRepresentation};
pub use sparsify::{
    gru_flops_per_step, sparsify_matrix, BlockMask, GruWeights, SparsificationScheduler,
    SparsificationTask, StepReport,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ExportConfig, GateSet, SchedulerConfig};
    pub use crate::error::{ExportError, Result};
    pub use crate::export::{Layer, ModelExporter};
    pub use crate::sparsify::{GruWeights, SparsificationScheduler, SparsificationTask};
}
