//! Per-layer lowering onto the blob writer.
//!
//! Every supported layer kind is reduced to one or more linear layers with an
//! `[inputs, outputs]` weight, which [`export_linear`] stores dense or
//! block-sparse, float or int8.

use std::io::Write;
use std::path::Path;

use candle_core::{DType, Tensor};

use crate::config::{ExportConfig, QuantizeConfig};
use crate::error::{ExportError, Result};
use crate::export::writer::{ArrayData, BlobWriter, ModelBlob};
use crate::matrix::WeightMatrix;
use crate::quantization::{broadcast_scale, compute_scaling, quantize};
use crate::sparse::{encode_blocks, extract_diagonal};
use crate::sparsify::GruWeights;

/// Storage options for one linear layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearOptions {
    /// Store the weight block-sparse with an index.
    pub sparse: bool,
    /// Store the diagonal separately (sparse only).
    pub diagonal: bool,
    /// Store int8 values with `subias` and `scale`.
    pub quantize: bool,
    /// Calibration scale; derived from the weight when `None`.
    pub scale: Option<Vec<f32>>,
    /// Clip handling.
    pub quantization: QuantizeConfig,
}

impl LinearOptions {
    /// Dense float storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block-sparse storage, optionally with a separate diagonal.
    #[must_use]
    pub const fn with_sparse(mut self, sparse: bool, diagonal: bool) -> Self {
        self.sparse = sparse;
        self.diagonal = sparse && diagonal;
        self
    }

    /// Int8 storage with the given scale, or calibrated when `None`.
    #[must_use]
    pub fn with_quantize(mut self, quantize: bool, scale: Option<Vec<f32>>) -> Self {
        self.quantize = quantize;
        self.scale = scale;
        self
    }

    /// Set the clip handling.
    #[must_use]
    pub const fn with_quantization(mut self, quantization: QuantizeConfig) -> Self {
        self.quantization = quantization;
        self
    }
}

/// What [`export_linear`] wrote for one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearSummary {
    /// Layer name.
    pub name: String,
    /// Input dimension.
    pub inputs: usize,
    /// Output dimension.
    pub outputs: usize,
    /// Values clipped during quantization.
    pub clipped: usize,
    /// Fraction of 4x8 blocks stored, for sparse layers.
    pub block_density: Option<f64>,
}

fn quoted(name: Option<&str>) -> String {
    name.map_or_else(|| "NULL".to_string(), |n| format!("\"{n}\""))
}

/// Write a `[inputs, outputs]` linear layer and register it as `LinearLayer`.
///
/// Arrays, in order: `<name>_weights_diag`, `<name>_weights_int8`,
/// `<name>_weights_float`, `<name>_weights_idx`, `<name>_subias`,
/// `<name>_scale`, `<name>_bias`, each only when the options call for it.
/// With quantization the float weights are a debug-only reference.
///
/// Any failure poisons the writer, so a partly written layer is never
/// finalized.
///
/// # Errors
///
/// Returns error if the weight does not tile into 4x8 blocks where needed,
/// the bias or scale has the wrong length, quantization fails under a strict
/// clip policy, or the writer rejects a name.
pub fn export_linear<W: Write>(
    writer: &mut BlobWriter<W>,
    name: &str,
    weight: &WeightMatrix,
    bias: Option<&[f32]>,
    options: &LinearOptions,
) -> Result<LinearSummary> {
    let result = write_linear(writer, name, weight, bias, options);
    if result.is_err() {
        writer.poison();
    }
    result
}

fn write_linear<W: Write>(
    writer: &mut BlobWriter<W>,
    name: &str,
    weight: &WeightMatrix,
    bias: Option<&[f32]>,
    options: &LinearOptions,
) -> Result<LinearSummary> {
    let (n_in, n_out) = weight.shape();
    if let Some(b) = bias {
        if b.len() != n_out {
            return Err(ExportError::shape(
                b.len(),
                1,
                format!("bias of {name} must have {n_out} entries"),
            ));
        }
    }
    let weights = format!("{name}_weights");

    let scale = if options.quantize {
        Some(match &options.scale {
            Some(s) => broadcast_scale(s, n_out)?,
            None => compute_scaling(weight)?,
        })
    } else {
        None
    };

    let mut clipped = 0;
    let mut block_density = None;
    let mut quantized = None;

    if options.sparse {
        let residual = if options.diagonal {
            let (diag, residual) = extract_diagonal(weight)?;
            writer.register_array(format!("{weights}_diag"), ArrayData::Float(diag))?;
            residual
        } else {
            weight.clone()
        };

        let q = match &scale {
            Some(s) => Some(quantize(&residual, bias, Some(s), &options.quantization)?),
            None => None,
        };
        let encoded = encode_blocks(&residual, q.as_ref().map(|q| q.values.as_slice()))?;
        block_density = Some(encoded.block_density());

        if let Some(values) = encoded.values_int8 {
            writer.register_array(format!("{weights}_int8"), ArrayData::Int8(values))?;
        }
        let float = ArrayData::Float(encoded.values_float);
        if options.quantize {
            writer.register_debug_array(format!("{weights}_float"), float)?;
        } else {
            writer.register_array(format!("{weights}_float"), float)?;
        }
        writer.register_array(format!("{weights}_idx"), ArrayData::Int32(encoded.index))?;
        quantized = q;
    } else {
        if let Some(s) = &scale {
            let q = quantize(weight, bias, Some(s), &options.quantization)?;
            writer.register_array(
                format!("{weights}_int8"),
                ArrayData::Int8(q.interleaved_values()?),
            )?;
            quantized = Some(q);
        }
        let float = ArrayData::Float(weight.as_slice().to_vec());
        if options.quantize {
            writer.register_debug_array(format!("{weights}_float"), float)?;
        } else {
            writer.register_array(format!("{weights}_float"), float)?;
        }
    }

    if let Some(q) = &quantized {
        clipped = q.clipped;
        writer.register_array(format!("{name}_subias"), ArrayData::Float(q.subias.clone()))?;
        writer.register_array(format!("{name}_scale"), ArrayData::Float(q.export_scale()))?;
    }

    if let Some(b) = bias {
        writer.register_array(format!("{name}_bias"), ArrayData::Float(b.to_vec()))?;
    }

    let bias_name = bias.map(|_| format!("{name}_bias"));
    let subias_name = options.quantize.then(|| format!("{name}_subias"));
    let int8_name = options.quantize.then(|| format!("{weights}_int8"));
    let float_name = format!("{weights}_float");
    let idx_name = options.sparse.then(|| format!("{weights}_idx"));
    let diag_name = options.diagonal.then(|| format!("{weights}_diag"));
    let scale_name = options.quantize.then(|| format!("{name}_scale"));

    let init = format!(
        "linear_init(&model->{name}, arrays, {}, {}, {}, {}, {}, {}, {}, {n_in}, {n_out})",
        quoted(bias_name.as_deref()),
        quoted(subias_name.as_deref()),
        quoted(int8_name.as_deref()),
        quoted(Some(float_name.as_str())),
        quoted(idx_name.as_deref()),
        quoted(diag_name.as_deref()),
        quoted(scale_name.as_deref()),
    );
    writer.register_layer(name, "LinearLayer", init)?;

    tracing::debug!(
        layer = name,
        n_in,
        n_out,
        sparse = options.sparse,
        quantize = options.quantize,
        "exported linear layer"
    );
    Ok(LinearSummary {
        name: name.to_string(),
        inputs: n_in,
        outputs: n_out,
        clipped,
        block_density,
    })
}

/// A trained layer in framework layout, ready for export.
///
/// Tensor shapes follow the usual training-framework conventions noted on
/// each variant.
#[derive(Debug, Clone)]
pub enum Layer {
    /// Fully connected, weight `[out, in]`, bias `[out]`.
    Dense {
        /// Weight.
        weight: Tensor,
        /// Bias.
        bias: Option<Tensor>,
    },
    /// 1-D convolution, weight `[out, in, kernel]`.
    Conv1d {
        /// Weight.
        weight: Tensor,
        /// Bias, zero when absent.
        bias: Option<Tensor>,
    },
    /// 1-D transposed convolution, weight `[in, out, kernel]`.
    TConv1d {
        /// Weight.
        weight: Tensor,
        /// Bias, zero when absent.
        bias: Option<Tensor>,
        /// Upsampling stride.
        stride: usize,
    },
    /// 2-D convolution, weight `[out, in, kheight, ktime]`. Always stored in float.
    Conv2d {
        /// Weight.
        weight: Tensor,
        /// Bias, zero when absent.
        bias: Option<Tensor>,
    },
    /// Gated recurrent unit with gates stacked reset, update, new.
    Gru(GruWeights),
    /// Lookup table, weight `[num_embeddings, dim]`.
    Embedding {
        /// Table.
        weight: Tensor,
    },
    /// A layer kind with no export mapping.
    Unsupported {
        /// Kind name as reported by the model.
        kind: String,
    },
}

impl Layer {
    /// Short kind name.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Dense { .. } => "dense",
            Self::Conv1d { .. } => "conv1d",
            Self::TConv1d { .. } => "tconv1d",
            Self::Conv2d { .. } => "conv2d",
            Self::Gru(_) => "gru",
            Self::Embedding { .. } => "embedding",
            Self::Unsupported { kind } => kind.as_str(),
        }
    }
}

/// Outcome of exporting one model layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerReport {
    /// Exported name.
    pub name: String,
    /// Kind name.
    pub kind: String,
    /// Linear sublayers written (empty for float-only kinds).
    pub linear: Vec<LinearSummary>,
}

impl LayerReport {
    /// Values clipped across all sublayers.
    #[must_use]
    pub fn clipped(&self) -> usize {
        self.linear.iter().map(|l| l.clipped).sum()
    }
}

fn to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

fn bias_or_zeros(bias: Option<&Tensor>, len: usize) -> Result<Vec<f32>> {
    bias.map_or_else(|| Ok(vec![0.0; len]), to_vec)
}

fn dims3(weight: &Tensor, layer: &str) -> Result<(usize, usize, usize)> {
    match *weight.dims() {
        [a, b, c] if c > 0 => Ok((a, b, c)),
        ref dims => Err(ExportError::InvalidConfig(format!(
            "{layer} expects a 3-D weight with non-empty kernel, got {dims:?}"
        ))),
    }
}

/// Drives named model layers through a [`BlobWriter`].
///
/// Layer names have `.` replaced by `_` so module paths become C identifiers.
/// A failed layer poisons the writer, so [`finish`](Self::finish) then fails
/// with [`ExportError::Sealed`].
///
/// # Example
///
/// ```no_run
/// use blocksparse_export::{ExportConfig, Layer, ModelExporter};
/// use candle_core::{Device, Tensor};
///
/// # fn main() -> blocksparse_export::Result<()> {
/// let config = ExportConfig::default().with_quantize(true);
/// let mut exporter = ModelExporter::create("out/model_data", config)?;
/// let weight = Tensor::zeros((16, 32), candle_core::DType::F32, &Device::Cpu)?;
/// exporter.export("dense_out", &Layer::Dense { weight, bias: None })?;
/// let blob = exporter.finish()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ModelExporter<W: Write> {
    writer: BlobWriter<W>,
    config: ExportConfig,
}

impl ModelExporter<std::io::BufWriter<std::fs::File>> {
    /// Open `<stem>.h` / `<stem>.c` with the configured layout.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a file can't be created.
    pub fn create<P: AsRef<Path>>(path_stem: P, config: ExportConfig) -> Result<Self> {
        config.validate()?;
        let writer = BlobWriter::create(path_stem, config.writer.clone())?;
        Ok(Self { writer, config })
    }
}

impl<W: Write> ModelExporter<W> {
    /// Wrap an existing writer.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid.
    pub fn new(writer: BlobWriter<W>, config: ExportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { writer, config })
    }

    /// The underlying writer.
    #[must_use]
    pub const fn writer(&self) -> &BlobWriter<W> {
        &self.writer
    }

    /// Export configuration.
    #[must_use]
    pub const fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Export one layer.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::UnsupportedLayer`] for unmapped kinds, or any
    /// shape, calibration or writer error from the lowering.
    pub fn export(&mut self, name: &str, layer: &Layer) -> Result<LayerReport> {
        let name = name.replace('.', "_");
        let span = tracing::debug_span!("export_layer", layer = %name, kind = layer.kind());
        let _guard = span.enter();

        let result = self.lower(&name, layer);
        match &result {
            Ok(report) => tracing::info!(
                layer = %name,
                kind = %report.kind,
                clipped = report.clipped(),
                "exported layer"
            ),
            Err(err) => {
                tracing::warn!(layer = %name, error = %err, "layer export failed");
                self.writer.poison();
            }
        }
        result
    }

    /// Export layers in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first layer error.
    pub fn export_all<'a, I>(&mut self, layers: I) -> Result<Vec<LayerReport>>
    where
        I: IntoIterator<Item = (&'a str, &'a Layer)>,
    {
        layers
            .into_iter()
            .map(|(name, layer)| self.export(name, layer))
            .collect()
    }

    /// Finalize the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Sealed`] after any failed export.
    pub fn finish(self) -> Result<ModelBlob> {
        self.writer.finalize()
    }

    fn options(&self, name: &str) -> LinearOptions {
        let quantize = self.config.quantizes(name);
        let scale = (!self.config.calibrate).then(|| vec![self.config.default_scale]);
        LinearOptions::new()
            .with_quantize(quantize, scale)
            .with_quantization(self.config.quantization)
    }

    fn define(&mut self, name: &str, suffix: &str, value: impl std::fmt::Display) -> Result<()> {
        self.writer
            .define(&format!("{}_{suffix}", name.to_uppercase()), value)
    }

    fn lower(&mut self, name: &str, layer: &Layer) -> Result<LayerReport> {
        let linear = match layer {
            Layer::Dense { weight, bias } => vec![self.dense(name, weight, bias.as_ref())?],
            Layer::Conv1d { weight, bias } => vec![self.conv1d(name, weight, bias.as_ref())?],
            Layer::TConv1d {
                weight,
                bias,
                stride,
            } => vec![self.tconv1d(name, weight, bias.as_ref(), *stride)?],
            Layer::Conv2d { weight, bias } => {
                self.conv2d(name, weight, bias.as_ref())?;
                Vec::new()
            }
            Layer::Gru(gru) => self.gru(name, gru)?,
            Layer::Embedding { weight } => vec![self.embedding(name, weight)?],
            Layer::Unsupported { kind } => {
                return Err(ExportError::UnsupportedLayer(format!("{kind} ({name})")));
            }
        };
        Ok(LayerReport {
            name: name.to_string(),
            kind: layer.kind().to_string(),
            linear,
        })
    }

    fn dense(&mut self, name: &str, weight: &Tensor, bias: Option<&Tensor>) -> Result<LinearSummary> {
        let weight = WeightMatrix::from_tensor(weight)?.transpose();
        let bias = bias_or_zeros(bias, weight.cols())?;
        let options = self.options(name);
        let summary = export_linear(&mut self.writer, name, &weight, Some(&bias), &options)?;
        self.define(name, "OUT_SIZE", summary.outputs)?;
        Ok(summary)
    }

    fn conv1d(&mut self, name: &str, weight: &Tensor, bias: Option<&Tensor>) -> Result<LinearSummary> {
        let (out_channels, in_channels, kernel) = dims3(weight, "conv1d")?;
        // [out, in, k] -> [k, in, out] -> [k * in, out]
        let lowered = weight
            .permute((2, 1, 0))?
            .contiguous()?
            .reshape((kernel * in_channels, out_channels))?;
        let weight = WeightMatrix::from_tensor(&lowered)?;
        let bias = bias_or_zeros(bias, out_channels)?;

        let options = self.options(name);
        let summary = export_linear(&mut self.writer, name, &weight, Some(&bias), &options)?;
        self.define(name, "OUT_SIZE", out_channels)?;
        self.define(name, "IN_SIZE", in_channels)?;
        self.define(
            name,
            "STATE_SIZE",
            format!("({in_channels} * ({}))", kernel - 1),
        )?;
        self.define(name, "DELAY", (kernel - 1) / 2)?;
        Ok(summary)
    }

    fn tconv1d(
        &mut self,
        name: &str,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: usize,
    ) -> Result<LinearSummary> {
        let (in_channels, out_channels, kernel) = dims3(weight, "tconv1d")?;
        // [in, out, k] -> [k, out, in] -> [k * out, in] -> [in, k * out]
        let lowered = weight
            .permute((2, 1, 0))?
            .contiguous()?
            .reshape((kernel * out_channels, in_channels))?
            .t()?
            .contiguous()?;
        let weight = WeightMatrix::from_tensor(&lowered)?;
        let bias = bias_or_zeros(bias, out_channels)?.repeat(kernel);

        let options = self.options(name);
        let summary = export_linear(&mut self.writer, name, &weight, Some(&bias), &options)?;
        self.define(name, "KERNEL_SIZE", kernel)?;
        self.define(name, "STRIDE", stride)?;
        self.define(name, "IN_CHANNELS", in_channels)?;
        self.define(name, "OUT_CHANNELS", out_channels)?;
        Ok(summary)
    }

    fn conv2d(&mut self, name: &str, weight: &Tensor, bias: Option<&Tensor>) -> Result<()> {
        let [out_channels, in_channels, kheight, ktime] = *weight.dims() else {
            return Err(ExportError::InvalidConfig(format!(
                "conv2d expects a 4-D weight, got {:?}",
                weight.dims()
            )));
        };
        if self.config.quantizes(name) {
            tracing::warn!(layer = name, "conv2d weights are always exported in float");
        }

        // [out, in, kheight, ktime] -> [out, in, ktime, kheight]
        let kernel = weight.permute((0, 1, 3, 2))?.contiguous()?;
        let bias_name = format!("{name}_bias");
        let weight_name = format!("{name}_weight_float");
        self.writer
            .register_array(weight_name.clone(), ArrayData::Float(to_vec(&kernel)?))?;
        self.writer.register_array(
            bias_name.clone(),
            ArrayData::Float(bias_or_zeros(bias, out_channels)?),
        )?;

        let init = format!(
            "conv2d_init(&model->{name}, arrays, \"{bias_name}\", \"{weight_name}\", \
             {in_channels}, {out_channels}, {ktime}, {kheight})"
        );
        self.writer.register_layer(name, "Conv2dLayer", init)
    }

    fn gru(&mut self, name: &str, gru: &GruWeights) -> Result<Vec<LinearSummary>> {
        let h = gru.hidden_size;

        // Kernels expect gates ordered update, reset, new.
        let mut input = gru.input.clone();
        let mut recurrent = gru.recurrent.clone();
        input.swap_row_bands(0, h, h)?;
        recurrent.swap_row_bands(0, h, h)?;
        let swap_bias = |bias: &Option<Vec<f32>>| {
            bias.clone().map(|mut b| {
                let (reset, rest) = b.split_at_mut(h);
                reset.swap_with_slice(&mut rest[..h]);
                b
            })
        };
        let input_bias = swap_bias(&gru.input_bias);
        let recurrent_bias = swap_bias(&gru.recurrent_bias);

        let base = self.options(name);
        let input_options = base
            .clone()
            .with_sparse(self.config.gru_input_sparse, false);
        let recurrent_options = base.with_sparse(
            self.config.gru_recurrent_sparse,
            self.config.gru_recurrent_sparse,
        );

        let input_summary = export_linear(
            &mut self.writer,
            &format!("{name}_input"),
            &input.transpose(),
            input_bias.as_deref(),
            &input_options,
        )?;
        let recurrent_summary = export_linear(
            &mut self.writer,
            &format!("{name}_recurrent"),
            &recurrent.transpose(),
            recurrent_bias.as_deref(),
            &recurrent_options,
        )?;

        self.define(name, "OUT_SIZE", h)?;
        self.define(name, "STATE_SIZE", h)?;
        Ok(vec![input_summary, recurrent_summary])
    }

    fn embedding(&mut self, name: &str, weight: &Tensor) -> Result<LinearSummary> {
        let table = WeightMatrix::from_tensor(weight)?;
        let bias = vec![0.0; table.cols()];
        let options = self.options(name);
        let summary = export_linear(&mut self.writer, name, &table, Some(&bias), &options)?;
        self.define(name, "OUT_SIZE", summary.outputs)?;
        Ok(summary)
    }
}
