//! Error types for blocksparse-export.

use thiserror::Error;

/// Result type alias for blocksparse-export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Errors that can occur while sparsifying, quantizing or serializing weights.
///
/// All variants are fail-fast: the operation that produced them is aborted
/// and nothing is retried internally.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Block shape does not divide the matrix, or a square matrix was required.
    #[error("shape error: {reason} (matrix {rows}x{cols})")]
    Shape {
        /// Matrix rows.
        rows: usize,
        /// Matrix columns.
        cols: usize,
        /// What went wrong.
        reason: String,
    },

    /// Quantization produced a value outside the int8 range.
    #[error("calibration error: value {value} at index {index} outside [-128, 127]")]
    Calibration {
        /// Flat index of the offending weight.
        index: usize,
        /// Rounded value before clipping.
        value: f32,
    },

    /// An array or layer name was registered twice.
    #[error("duplicate {kind} name: {name}")]
    DuplicateName {
        /// `"array"` or `"layer"`.
        kind: &'static str,
        /// The colliding name.
        name: String,
    },

    /// A layer kind has no export mapping.
    #[error("unsupported layer kind: {0}")]
    UnsupportedLayer(String),

    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A sparsification task refers to a unit that was not supplied.
    #[error("no weights supplied for unit '{0}'")]
    MissingUnit(String),

    /// The writer was poisoned by an earlier error and can no longer be sealed.
    #[error("blob writer is sealed after an earlier failure")]
    Sealed,

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed or written.
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl ExportError {
    pub(crate) fn shape(rows: usize, cols: usize, reason: impl Into<String>) -> Self {
        Self::Shape {
            rows,
            cols,
            reason: reason.into(),
        }
    }
}
