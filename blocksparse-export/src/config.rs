//! Configuration for sparsification scheduling, quantization and blob export.
//!
//! This module provides:
//! - [`SchedulerConfig`]: progressive pruning timeline
//! - [`GateConfig`] / [`GateSet`]: per-gate block pruning targets
//! - [`QuantizeConfig`]: int8 calibration policy
//! - [`WriterConfig`]: layout of the emitted declaration/initialization units
//! - [`ExportConfig`]: model-level export options, loadable from YAML

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// Progressive sparsification timeline.
///
/// Between `start` and `stop` the scheduler acts every `interval` steps with
/// `alpha = ((stop - step) / (stop - start)) ^ exponent`; from `stop` on it acts
/// on every step with `alpha = 0`.
///
/// # Example
///
/// ```
/// use blocksparse_export::SchedulerConfig;
///
/// let config = SchedulerConfig::default()
///     .with_start(100)
///     .with_stop(1000)
///     .with_interval(10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// First step at which pruning may happen.
    pub start: usize,

    /// Step at which the target density is reached.
    pub stop: usize,

    /// Pruning interval between `start` and `stop`.
    pub interval: usize,

    /// Interpolation exponent; larger values prune earlier.
    pub exponent: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start: 2500,
            stop: 8000,
            interval: 50,
            exponent: 3.0,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the start step.
    #[must_use]
    pub const fn with_start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    /// Set the stop step.
    #[must_use]
    pub const fn with_stop(mut self, stop: usize) -> Self {
        self.stop = stop;
        self
    }

    /// Set the pruning interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: usize) -> Self {
        self.interval = interval;
        self
    }

    /// Set the interpolation exponent.
    #[must_use]
    pub const fn with_exponent(mut self, exponent: f64) -> Self {
        self.exponent = exponent;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the timeline is empty or the interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.start >= self.stop {
            return Err(ExportError::InvalidConfig(format!(
                "start ({}) must be < stop ({})",
                self.start, self.stop
            )));
        }

        if self.interval == 0 {
            return Err(ExportError::InvalidConfig(
                "interval must be > 0".to_string(),
            ));
        }

        if !self.exponent.is_finite() || self.exponent <= 0.0 {
            return Err(ExportError::InvalidConfig(
                "exponent must be finite and > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// The six weight bands of a gated recurrent unit.
///
/// Input gates index the `3H x inputs` input weight, recurrent gates the
/// `3H x H` recurrent weight. The band of each gate is given by
/// [`Gate::band`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// Input weight of the reset gate.
    InputReset,
    /// Input weight of the update gate.
    InputUpdate,
    /// Input weight of the candidate ("new") gate.
    InputNew,
    /// Recurrent weight of the reset gate.
    RecurrentReset,
    /// Recurrent weight of the update gate.
    RecurrentUpdate,
    /// Recurrent weight of the candidate ("new") gate.
    RecurrentNew,
}

impl Gate {
    /// All gates, input side first.
    pub const ALL: [Self; 6] = [
        Self::InputReset,
        Self::InputUpdate,
        Self::InputNew,
        Self::RecurrentReset,
        Self::RecurrentUpdate,
        Self::RecurrentNew,
    ];

    /// Whether the gate lives in the recurrent weight.
    #[must_use]
    pub const fn is_recurrent(self) -> bool {
        matches!(
            self,
            Self::RecurrentReset | Self::RecurrentUpdate | Self::RecurrentNew
        )
    }

    /// Row band (in units of the hidden size) inside the stacked weight.
    #[must_use]
    pub const fn band(self) -> usize {
        match self {
            Self::InputReset | Self::RecurrentReset => 0,
            Self::InputUpdate | Self::RecurrentUpdate => 1,
            Self::InputNew | Self::RecurrentNew => 2,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InputReset => "input_reset",
            Self::InputUpdate => "input_update",
            Self::InputNew => "input_new",
            Self::RecurrentReset => "recurrent_reset",
            Self::RecurrentUpdate => "recurrent_update",
            Self::RecurrentNew => "recurrent_new",
        };
        f.write_str(name)
    }
}

/// Block pruning target for one gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Fraction of blocks to keep once the schedule has finished.
    pub target_density: f64,

    /// Block shape `(rows, cols)`.
    pub block_shape: (usize, usize),

    /// Exempt the main diagonal from pruning (square matrices only).
    #[serde(default)]
    pub keep_diagonal: bool,
}

impl GateConfig {
    /// Create a gate target.
    #[must_use]
    pub const fn new(target_density: f64, block_shape: (usize, usize), keep_diagonal: bool) -> Self {
        Self {
            target_density,
            block_shape,
            keep_diagonal,
        }
    }

    /// Validate the gate target.
    ///
    /// # Errors
    ///
    /// Returns error if the density is outside `[0, 1]` or a block extent is zero.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.target_density) {
            return Err(ExportError::InvalidConfig(format!(
                "target_density must be in [0, 1], got {}",
                self.target_density
            )));
        }

        if self.block_shape.0 == 0 || self.block_shape.1 == 0 {
            return Err(ExportError::InvalidConfig(
                "block_shape extents must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-gate pruning targets of one recurrent unit.
///
/// Gates that are absent are left untouched by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateSet {
    gates: BTreeMap<Gate, GateConfig>,
}

impl GateSet {
    /// Create an empty gate set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets used for the denoiser's recurrent layers: 8x4 blocks,
    /// reset/update/new densities 0.3/0.2/0.5, diagonal kept on the recurrent side.
    #[must_use]
    pub fn recurrent_default() -> Self {
        let mut set = Self::new();
        for (gate, density) in [
            (Gate::RecurrentReset, 0.3),
            (Gate::RecurrentUpdate, 0.2),
            (Gate::RecurrentNew, 0.5),
            (Gate::InputReset, 0.3),
            (Gate::InputUpdate, 0.2),
            (Gate::InputNew, 0.5),
        ] {
            set.gates
                .insert(gate, GateConfig::new(density, (8, 4), gate.is_recurrent()));
        }
        set
    }

    /// Add or replace the target of one gate.
    #[must_use]
    pub fn with_gate(mut self, gate: Gate, config: GateConfig) -> Self {
        self.gates.insert(gate, config);
        self
    }

    /// Target of a gate, if configured.
    #[must_use]
    pub fn get(&self, gate: Gate) -> Option<&GateConfig> {
        self.gates.get(&gate)
    }

    /// Iterate configured gates in key order.
    pub fn iter(&self) -> impl Iterator<Item = (Gate, &GateConfig)> {
        self.gates.iter().map(|(g, c)| (*g, c))
    }

    /// Number of configured gates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Whether no gate is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Validate every gate target.
    ///
    /// # Errors
    ///
    /// Returns the first invalid gate target.
    pub fn validate(&self) -> Result<()> {
        for (gate, config) in &self.gates {
            config.validate().map_err(|e| match e {
                ExportError::InvalidConfig(msg) => {
                    ExportError::InvalidConfig(format!("{gate}: {msg}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

/// What to do when a quantized weight falls outside the int8 range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipPolicy {
    /// Clip to `[-128, 127]` and report the number of clipped values.
    #[default]
    Clip,
    /// Fail with a calibration error.
    Strict,
}

/// Configuration for int8 quantization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizeConfig {
    /// Out-of-range handling.
    #[serde(default)]
    pub clip_policy: ClipPolicy,
}

impl QuantizeConfig {
    /// Set the clip policy.
    #[must_use]
    pub const fn with_clip_policy(mut self, clip_policy: ClipPolicy) -> Self {
        self.clip_policy = clip_policy;
        self
    }
}

/// Layout of the emitted declaration and initialization units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Name of the aggregate model struct; the init routine is `init_<lowercase>`.
    #[serde(default = "default_model_struct_name")]
    pub model_struct_name: String,

    /// Header declaring `WeightArray`, `LinearLayer` and the init functions.
    #[serde(default = "default_nnet_header")]
    pub nnet_header: String,

    /// Optional comment placed at the top of both units.
    #[serde(default)]
    pub message: Option<String>,

    /// Declare the model struct through a `typedef`.
    #[serde(default)]
    pub add_typedef: bool,

    /// Emit the named-array registry, model struct and init routine.
    #[serde(default = "default_true")]
    pub binary_blob: bool,

    /// Only write the declarations unit.
    #[serde(default)]
    pub header_only: bool,
}

fn default_model_struct_name() -> String {
    "Model".into()
}

fn default_nnet_header() -> String {
    "nnet.h".into()
}

const fn default_true() -> bool {
    true
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            model_struct_name: default_model_struct_name(),
            nnet_header: default_nnet_header(),
            message: None,
            add_typedef: false,
            binary_blob: true,
            header_only: false,
        }
    }
}

impl WriterConfig {
    /// Set the model struct name.
    #[must_use]
    pub fn with_model_struct_name(mut self, name: impl Into<String>) -> Self {
        self.model_struct_name = name.into();
        self
    }

    /// Set the banner comment.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Declare the model struct with a `typedef`.
    #[must_use]
    pub const fn with_typedef(mut self, enabled: bool) -> Self {
        self.add_typedef = enabled;
        self
    }

    /// Enable or disable the named-array registry.
    #[must_use]
    pub const fn with_binary_blob(mut self, enabled: bool) -> Self {
        self.binary_blob = enabled;
        self
    }

    /// Only produce the declarations unit.
    #[must_use]
    pub const fn with_header_only(mut self, enabled: bool) -> Self {
        self.header_only = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the struct name is not a C identifier.
    pub fn validate(&self) -> Result<()> {
        if !is_c_identifier(&self.model_struct_name) {
            return Err(ExportError::InvalidConfig(format!(
                "model_struct_name '{}' is not a C identifier",
                self.model_struct_name
            )));
        }
        if self.nnet_header.is_empty() {
            return Err(ExportError::InvalidConfig(
                "nnet_header must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn is_c_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Model-level export options.
///
/// # Example
///
/// ```no_run
/// use blocksparse_export::ExportConfig;
///
/// # fn main() -> blocksparse_export::Result<()> {
/// let config = ExportConfig::from_file("export.yaml")?;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Quantize layers to int8.
    #[serde(default)]
    pub quantize: bool,

    /// Layers kept in float even when `quantize` is set.
    #[serde(default)]
    pub unquantized: Vec<String>,

    /// Derive per-channel scales from each weight. When unset, quantized
    /// layers use `default_scale`.
    #[serde(default = "default_true")]
    pub calibrate: bool,

    /// Scale used for layers that are not auto-calibrated.
    #[serde(default = "default_scale")]
    pub default_scale: f32,

    /// Store GRU input weights block-sparse.
    #[serde(default = "default_true")]
    pub gru_input_sparse: bool,

    /// Store GRU recurrent weights block-sparse (diagonal kept separately).
    #[serde(default = "default_true")]
    pub gru_recurrent_sparse: bool,

    /// Quantization settings.
    #[serde(default)]
    pub quantization: QuantizeConfig,

    /// Output layout.
    #[serde(default)]
    pub writer: WriterConfig,
}

fn default_scale() -> f32 {
    1.0 / 128.0
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            quantize: false,
            unquantized: Vec::new(),
            calibrate: true,
            default_scale: default_scale(),
            gru_input_sparse: true,
            gru_recurrent_sparse: true,
            quantization: QuantizeConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl ExportConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file can't be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Enable or disable quantization.
    #[must_use]
    pub fn with_quantize(mut self, quantize: bool) -> Self {
        self.quantize = quantize;
        self
    }

    /// Exclude a layer from quantization.
    #[must_use]
    pub fn with_unquantized(mut self, layer: impl Into<String>) -> Self {
        self.unquantized.push(layer.into());
        self
    }

    /// Enable or disable per-weight calibration.
    #[must_use]
    pub fn with_calibration(mut self, calibrate: bool) -> Self {
        self.calibrate = calibrate;
        self
    }

    /// Set the scale used when calibration is disabled.
    #[must_use]
    pub fn with_default_scale(mut self, scale: f32) -> Self {
        self.default_scale = scale;
        self
    }

    /// Replace the quantization settings.
    #[must_use]
    pub fn with_quantization(mut self, quantization: QuantizeConfig) -> Self {
        self.quantization = quantization;
        self
    }

    /// Replace the writer layout.
    #[must_use]
    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Whether the named layer should be quantized.
    #[must_use]
    pub fn quantizes(&self, layer: &str) -> bool {
        self.quantize && !self.unquantized.iter().any(|l| l == layer)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the scale is not positive or the writer layout is invalid.
    pub fn validate(&self) -> Result<()> {
        if !self.default_scale.is_finite() || self.default_scale <= 0.0 {
            return Err(ExportError::InvalidConfig(
                "default_scale must be finite and > 0".to_string(),
            ));
        }
        self.writer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.start, 2500);
        assert_eq!(config.stop, 8000);
        assert_eq!(config.interval, 50);
        assert!((config.exponent - 3.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_validation() {
        assert!(SchedulerConfig::new().with_start(10).with_stop(10).validate().is_err());
        assert!(SchedulerConfig::new().with_interval(0).validate().is_err());
        assert!(SchedulerConfig::new().with_exponent(0.0).validate().is_err());
        assert!(SchedulerConfig::new().with_exponent(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_gate_bands() {
        assert_eq!(Gate::InputReset.band(), 0);
        assert_eq!(Gate::RecurrentUpdate.band(), 1);
        assert_eq!(Gate::InputNew.band(), 2);
        assert!(Gate::RecurrentNew.is_recurrent());
        assert!(!Gate::InputNew.is_recurrent());
    }

    #[test]
    fn test_gate_config_validation() {
        assert!(GateConfig::new(0.5, (4, 4), false).validate().is_ok());
        assert!(GateConfig::new(1.5, (4, 4), false).validate().is_err());
        assert!(GateConfig::new(-0.1, (4, 4), false).validate().is_err());
        assert!(GateConfig::new(0.5, (0, 4), false).validate().is_err());
    }

    #[test]
    fn test_recurrent_default_gate_set() {
        let set = GateSet::recurrent_default();
        assert_eq!(set.len(), 6);
        assert!(set.get(Gate::RecurrentReset).is_some_and(|c| c.keep_diagonal));
        assert!(set.get(Gate::InputReset).is_some_and(|c| !c.keep_diagonal));
        assert_eq!(set.get(Gate::InputNew).map(|c| c.block_shape), Some((8, 4)));
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_gate_set_validation_names_gate() {
        let set = GateSet::new().with_gate(Gate::InputUpdate, GateConfig::new(2.0, (4, 4), false));
        let err = set.validate().unwrap_err().to_string();
        assert!(err.contains("input_update"), "{err}");
    }

    #[test]
    fn test_writer_config_validation() {
        assert!(WriterConfig::default().validate().is_ok());
        assert!(WriterConfig::default()
            .with_model_struct_name("RNNoise")
            .validate()
            .is_ok());
        assert!(WriterConfig::default()
            .with_model_struct_name("9model")
            .validate()
            .is_err());
    }

    #[test]
    fn test_export_config_yaml_roundtrip() {
        let config = ExportConfig::default()
            .with_quantize(true)
            .with_unquantized("conv1")
            .with_writer(WriterConfig::default().with_model_struct_name("Denoiser"));

        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: ExportConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_export_config_defaults_from_partial_yaml() {
        let config: ExportConfig = serde_yaml::from_str("quantize: true\nunquantized: [dense_out]\n").unwrap();
        assert!(config.quantizes("gru1"));
        assert!(!config.quantizes("dense_out"));
        assert!(config.gru_recurrent_sparse);
        assert_eq!(config.writer.model_struct_name, "Model");
        assert_eq!(config.quantization.clip_policy, ClipPolicy::Clip);
    }

    #[test]
    fn test_export_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.yaml");
        let config = ExportConfig::default().with_quantize(true);
        config.to_file(&path).unwrap();
        assert_eq!(ExportConfig::from_file(&path).unwrap(), config);
    }
}
