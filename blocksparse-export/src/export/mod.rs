//! Serialization of weights into compilable C units.
//!
//! This module provides:
//! - [`BlobWriter`]: named-array registry emitting declarations and initialization units
//! - [`export_linear`]: dense or block-sparse, float or int8 linear layers
//! - [`ModelExporter`]: lowering of whole layers (dense, conv, GRU, embedding)
//! - [`ModelBlob::write_weights_file`]: the runtime-loaded weights file

mod layers;
mod writer;

pub use layers::{export_linear, Layer, LayerReport, LinearOptions, LinearSummary, ModelExporter};
pub use writer::{
    ArrayData, BlobWriter, LayerEntry, ModelBlob, NamedArray, TypeTag, WEIGHT_BLOB_MAGIC,
    WEIGHT_BLOCK_SIZE, WEIGHT_NAME_LEN,
};
