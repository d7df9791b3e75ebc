//! Named-array registry and C unit emission.
//!
//! A [`BlobWriter`] owns two sinks: the declarations unit (`.h`) and the
//! initialization unit (`.c`). Arrays are written to the initialization unit
//! as they are registered, each guarded by `USE_WEIGHTS_FILE` so a build can
//! swap the inline literals for a runtime-loaded weights file. The layer
//! struct, the array table and the init routine are written by
//! [`BlobWriter::finalize`].

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{is_c_identifier, WriterConfig};
use crate::error::{ExportError, Result};

/// Element type of a named array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    /// 32-bit float.
    Float,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Kernel weight type, stored as 8-bit.
    Qweight,
}

impl TypeTag {
    /// All tags.
    pub const ALL: [Self; 6] = [
        Self::Float,
        Self::Int8,
        Self::Uint16,
        Self::Int16,
        Self::Int32,
        Self::Qweight,
    ];

    /// Numeric code stored in the weights file.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Float => 0,
            Self::Int32 => 1,
            Self::Qweight => 2,
            Self::Int8 => 3,
            Self::Uint16 => 4,
            Self::Int16 => 5,
        }
    }

    /// C element type.
    #[must_use]
    pub const fn c_type(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int8 => "opus_int8",
            Self::Uint16 => "opus_uint16",
            Self::Int16 => "opus_int16",
            Self::Int32 => "int",
            Self::Qweight => "qweight",
        }
    }

    /// Suffix of the `WEIGHT_TYPE_*` constant.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Int32 => "int",
            Self::Qweight => "qweight",
        }
    }

    /// Bytes per element.
    #[must_use]
    pub const fn element_size(self) -> usize {
        match self {
            Self::Float | Self::Int32 => 4,
            Self::Uint16 | Self::Int16 => 2,
            Self::Int8 | Self::Qweight => 1,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Typed payload of a named array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    /// `float` values.
    Float(Vec<f32>),
    /// `opus_int8` values.
    Int8(Vec<i8>),
    /// `opus_uint16` values.
    Uint16(Vec<u16>),
    /// `opus_int16` values.
    Int16(Vec<i16>),
    /// `int` values.
    Int32(Vec<i32>),
    /// `qweight` values.
    Qweight(Vec<i8>),
}

impl ArrayData {
    /// Type tag of the payload.
    #[must_use]
    pub const fn type_tag(&self) -> TypeTag {
        match self {
            Self::Float(_) => TypeTag::Float,
            Self::Int8(_) => TypeTag::Int8,
            Self::Uint16(_) => TypeTag::Uint16,
            Self::Int16(_) => TypeTag::Int16,
            Self::Int32(_) => TypeTag::Int32,
            Self::Qweight(_) => TypeTag::Qweight,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int8(v) | Self::Qweight(v) => v.len(),
            Self::Uint16(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Int32(v) => v.len(),
        }
    }

    /// Whether the payload has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.len() * self.type_tag().element_size()
    }

    /// Little-endian payload bytes.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Float(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Int8(v) | Self::Qweight(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Uint16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Int16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Int32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// C literal for each element.
    ///
    /// # Errors
    ///
    /// Returns error if a float value is NaN or infinite.
    pub fn c_literals(&self) -> Result<Vec<String>> {
        fn ints<T: ToString>(v: &[T]) -> Vec<String> {
            v.iter().map(ToString::to_string).collect()
        }
        Ok(match self {
            Self::Float(v) => v
                .iter()
                .map(|x| {
                    if x.is_finite() {
                        Ok(format!("{x:?}"))
                    } else {
                        Err(ExportError::InvalidConfig(format!(
                            "non-finite value {x} in float array"
                        )))
                    }
                })
                .collect::<Result<_>>()?,
            Self::Int8(v) | Self::Qweight(v) => ints(v),
            Self::Uint16(v) => ints(v),
            Self::Int16(v) => ints(v),
            Self::Int32(v) => ints(v),
        })
    }
}

/// A payload registered under a unique name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArray {
    /// Array name, unique within a blob.
    pub name: String,
    /// Typed payload.
    pub data: ArrayData,
}

impl NamedArray {
    /// Type tag of the payload.
    #[must_use]
    pub const fn type_tag(&self) -> TypeTag {
        self.data.type_tag()
    }
}

/// A registered layer: struct member type and init expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    /// Member name in the model struct.
    pub name: String,
    /// C layer type, e.g. `LinearLayer`.
    pub layer_type: String,
    /// Expression returning non-zero on failure.
    pub init: String,
}

/// Magic of each weights-file record.
pub const WEIGHT_BLOB_MAGIC: &[u8; 4] = b"DNNw";

/// Payload alignment and record header size of the weights file.
pub const WEIGHT_BLOCK_SIZE: usize = 64;

/// Bytes reserved for the NUL-terminated array name.
pub const WEIGHT_NAME_LEN: usize = 44;

/// The sealed result of a successful [`BlobWriter::finalize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelBlob {
    layers: Vec<LayerEntry>,
    arrays: Vec<NamedArray>,
}

impl ModelBlob {
    /// Layers in registration order.
    #[must_use]
    pub fn layers(&self) -> &[LayerEntry] {
        &self.layers
    }

    /// Look up a layer by name.
    #[must_use]
    pub fn layer(&self, name: &str) -> Option<&LayerEntry> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Arrays in registration order.
    #[must_use]
    pub fn arrays(&self) -> &[NamedArray] {
        &self.arrays
    }

    /// Look up an array by name.
    #[must_use]
    pub fn array(&self, name: &str) -> Option<&NamedArray> {
        self.arrays.iter().find(|a| a.name == name)
    }

    /// Array names in registration order.
    pub fn array_names(&self) -> impl Iterator<Item = &str> {
        self.arrays.iter().map(|a| a.name.as_str())
    }

    /// Write the runtime-loaded weights file.
    ///
    /// Each array becomes a 64-byte record header followed by its payload,
    /// zero-padded to a multiple of 64 bytes. Header fields are little-endian
    /// `i32`: magic, version 0, type code, payload size, block size, then the
    /// NUL-padded name.
    ///
    /// # Errors
    ///
    /// Returns error if a name does not fit the header or the sink fails.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn write_weights_file<W: Write>(&self, mut out: W) -> Result<()> {
        for array in &self.arrays {
            let name = array.name.as_bytes();
            if name.len() >= WEIGHT_NAME_LEN {
                return Err(ExportError::InvalidConfig(format!(
                    "array name '{}' exceeds {} bytes",
                    array.name,
                    WEIGHT_NAME_LEN - 1
                )));
            }
            let payload = array.data.to_le_bytes();
            let size = i32::try_from(payload.len()).map_err(|_| {
                ExportError::InvalidConfig(format!("array '{}' is too large", array.name))
            })?;

            let mut head = Vec::with_capacity(WEIGHT_BLOCK_SIZE);
            head.extend_from_slice(WEIGHT_BLOB_MAGIC);
            head.extend_from_slice(&0i32.to_le_bytes());
            head.extend_from_slice(&array.type_tag().code().to_le_bytes());
            head.extend_from_slice(&size.to_le_bytes());
            head.extend_from_slice(&(WEIGHT_BLOCK_SIZE as i32).to_le_bytes());
            head.extend_from_slice(name);
            head.resize(WEIGHT_BLOCK_SIZE, 0);
            out.write_all(&head)?;

            out.write_all(&payload)?;
            let padding = payload.len().next_multiple_of(WEIGHT_BLOCK_SIZE) - payload.len();
            out.write_all(&vec![0u8; padding])?;
        }
        out.flush()?;
        Ok(())
    }

    /// Write the weights file to `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the file can't be created or written.
    pub fn save_weights_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        self.write_weights_file(BufWriter::new(file))
    }
}

/// Streaming writer for the declarations and initialization units.
///
/// Any failed registration poisons the writer: every later call, including
/// [`finalize`](Self::finalize), fails with [`ExportError::Sealed`] and the
/// closing sections are never written, so a truncated artifact cannot
/// compile.
///
/// # Example
///
/// ```
/// use blocksparse_export::{ArrayData, BlobWriter, WriterConfig};
///
/// # fn main() -> blocksparse_export::Result<()> {
/// let mut header = Vec::new();
/// let mut source = Vec::new();
/// let mut writer = BlobWriter::new(&mut header, Some(&mut source), "model_data", WriterConfig::default())?;
/// writer.register_array("dense_bias", ArrayData::Float(vec![0.5, -0.25]))?;
/// writer.register_layer("dense", "LinearLayer", "dense_init(&model->dense, arrays)")?;
/// let blob = writer.finalize()?;
/// assert_eq!(blob.arrays().len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct BlobWriter<W: Write> {
    header: Option<W>,
    source: Option<W>,
    config: WriterConfig,
    guard: String,
    arrays: Vec<NamedArray>,
    array_names: HashSet<String>,
    layers: Vec<LayerEntry>,
    layer_names: HashSet<String>,
    poisoned: bool,
    finished: bool,
}

impl BlobWriter<BufWriter<File>> {
    /// Create `<stem>.h` and, unless `header_only`, `<stem>.c`.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a file can't be created.
    pub fn create<P: AsRef<Path>>(path_stem: P, config: WriterConfig) -> Result<Self> {
        let stem = path_stem.as_ref();
        let basename = stem
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ExportError::InvalidConfig(format!("invalid output stem {}", stem.display()))
            })?
            .to_string();

        let header = BufWriter::new(File::create(stem.with_extension("h"))?);
        let source = if config.header_only {
            None
        } else {
            Some(BufWriter::new(File::create(stem.with_extension("c"))?))
        };
        Self::new(header, source, &basename, config)
    }
}

impl<W: Write> BlobWriter<W> {
    /// Start a writer over the given sinks.
    ///
    /// `basename` names the header (`<basename>.h`) and its include guard.
    /// `source` is ignored when the config is header-only.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the preamble can't be written.
    pub fn new(mut header: W, source: Option<W>, basename: &str, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let guard = format!("{}_H", basename.to_uppercase().replace(['.', '-'], "_"));

        let mut preamble = String::new();
        if let Some(message) = &config.message {
            preamble.push_str(&format!("/* {message} */\n\n"));
        }

        let mut h = preamble.clone();
        h.push_str(&format!(
            "\n#ifndef {guard}\n#define {guard}\n\n#include \"{}\"\n\n",
            config.nnet_header
        ));
        header.write_all(h.as_bytes())?;

        let source = if config.header_only {
            None
        } else {
            let mut source = source.ok_or_else(|| {
                ExportError::InvalidConfig("a source sink is required unless header_only".into())
            })?;
            let mut s = preamble;
            s.push_str(&format!(
                "\n#ifdef HAVE_CONFIG_H\n#include \"config.h\"\n#endif\n\n#include \"{basename}.h\"\n\n"
            ));
            source.write_all(s.as_bytes())?;
            Some(source)
        };

        tracing::debug!(guard = %guard, header_only = config.header_only, "blob writer opened");
        Ok(Self {
            header: Some(header),
            source,
            config,
            guard,
            arrays: Vec::new(),
            array_names: HashSet::new(),
            layers: Vec::new(),
            layer_names: HashSet::new(),
            poisoned: false,
            finished: false,
        })
    }

    /// Writer layout.
    #[must_use]
    pub const fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Whether an earlier failure poisoned the writer.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Whether `name` is already registered as an array.
    #[must_use]
    pub fn contains_array(&self, name: &str) -> bool {
        self.array_names.contains(name)
    }

    /// Registered arrays so far.
    #[must_use]
    pub fn arrays(&self) -> &[NamedArray] {
        &self.arrays
    }

    /// Registered layers so far.
    #[must_use]
    pub fn layers(&self) -> &[LayerEntry] {
        &self.layers
    }

    /// Register and emit an array.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::DuplicateName`] if `name` was registered before,
    /// [`ExportError::Sealed`] if the writer is poisoned, or an I/O error.
    pub fn register_array(&mut self, name: impl Into<String>, data: ArrayData) -> Result<()> {
        let name = name.into();
        self.guarded(|w| w.emit_array(name, data, false))
    }

    /// Register and emit a float reference array that kernels only read when
    /// `DISABLE_DEBUG_FLOAT` is not defined.
    ///
    /// # Errors
    ///
    /// Same as [`register_array`](Self::register_array).
    pub fn register_debug_array(&mut self, name: impl Into<String>, data: ArrayData) -> Result<()> {
        let name = name.into();
        self.guarded(|w| w.emit_array(name, data, true))
    }

    /// Register a layer to be declared in the model struct and initialized by
    /// the init routine.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::DuplicateName`] if `name` was registered before,
    /// or [`ExportError::Sealed`] if the writer is poisoned.
    pub fn register_layer(
        &mut self,
        name: impl Into<String>,
        layer_type: impl Into<String>,
        init: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        let layer_type = layer_type.into();
        let init = init.into();
        self.guarded(|w| {
            check_identifier(&name)?;
            if !w.layer_names.insert(name.clone()) {
                return Err(ExportError::DuplicateName { kind: "layer", name });
            }
            tracing::debug!(layer = %name, layer_type = %layer_type, "registered layer");
            w.layers.push(LayerEntry {
                name,
                layer_type,
                init,
            });
            Ok(())
        })
    }

    /// Emit `#define <name> <value>` into the declarations unit.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Sealed`] if the writer is poisoned, or an I/O
    /// error.
    pub fn define(&mut self, name: &str, value: impl fmt::Display) -> Result<()> {
        let line = format!("\n#define {name} {value}\n");
        self.guarded(|w| w.write_header(&line))
    }

    /// Write the closing sections and release both sinks.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Sealed`] if an earlier call failed, or an I/O
    /// error while writing the closing sections.
    pub fn finalize(mut self) -> Result<ModelBlob> {
        if self.poisoned {
            self.finished = true;
            return Err(ExportError::Sealed);
        }
        // Release the sinks whatever happens below.
        self.finished = true;
        let header = self.header.take();
        let source = self.source.take();

        if let Some(mut source) = source {
            source.write_all(self.source_epilogue().as_bytes())?;
            source.flush()?;
        }
        if let Some(mut header) = header {
            header.write_all(self.header_epilogue().as_bytes())?;
            header.flush()?;
        }

        tracing::info!(
            arrays = self.arrays.len(),
            layers = self.layers.len(),
            "finalized model blob"
        );
        Ok(ModelBlob {
            layers: std::mem::take(&mut self.layers),
            arrays: std::mem::take(&mut self.arrays),
        })
    }

    /// Mark the output as unusable after a failure outside the writer.
    pub(crate) fn poison(&mut self) {
        self.poisoned = true;
    }

    fn guarded<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.poisoned {
            return Err(ExportError::Sealed);
        }
        let result = op(self);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn write_header(&mut self, text: &str) -> Result<()> {
        let header = self.header.as_mut().ok_or(ExportError::Sealed)?;
        header.write_all(text.as_bytes())?;
        Ok(())
    }

    fn emit_array(&mut self, name: String, data: ArrayData, debug_only: bool) -> Result<()> {
        check_identifier(&name)?;
        if self.array_names.contains(&name) {
            return Err(ExportError::DuplicateName { kind: "array", name });
        }

        let tag = data.type_tag();
        let blob = self.config.binary_blob;

        if blob {
            let mut markers = String::from("\n#ifndef USE_WEIGHTS_FILE\n");
            if debug_only {
                markers.push_str("#ifndef DISABLE_DEBUG_FLOAT\n");
            }
            markers.push_str(&format!(
                "#define WEIGHTS_{name}_DEFINED\n#define WEIGHTS_{name}_TYPE WEIGHT_TYPE_{}\n",
                tag.suffix()
            ));
            if debug_only {
                markers.push_str("#endif\n");
            }
            markers.push_str("#endif\n");
            self.write_header(&markers)?;
        }

        if let Some(source) = self.source.as_mut() {
            let mut text = String::new();
            if blob {
                text.push_str("\n#ifndef USE_WEIGHTS_FILE\n");
            }
            if debug_only {
                text.push_str("#ifndef DISABLE_DEBUG_FLOAT\n");
            }
            text.push_str(&array_literal(&name, &data)?);
            if debug_only {
                text.push_str("#endif /*DISABLE_DEBUG_FLOAT*/\n");
            }
            if blob {
                text.push_str("\n#endif /* USE_WEIGHTS_FILE */\n");
            }
            source.write_all(text.as_bytes())?;
        }

        tracing::trace!(array = %name, tag = %tag, len = data.len(), "registered array");
        self.array_names.insert(name.clone());
        self.arrays.push(NamedArray { name, data });
        Ok(())
    }

    fn init_prototype(&self) -> String {
        let model = &self.config.model_struct_name;
        let prefix = if self.config.add_typedef { "" } else { "struct " };
        format!(
            "int init_{}({prefix}{model} *model, const WeightArray *arrays)",
            model.to_lowercase()
        )
    }

    fn header_epilogue(&self) -> String {
        let mut h = String::new();
        if self.config.binary_blob {
            let model = &self.config.model_struct_name;
            h.push_str(&format!(
                "\n#ifndef USE_WEIGHTS_FILE\nextern const WeightArray {}_arrays[];\n#endif\n",
                model.to_lowercase()
            ));

            if self.config.add_typedef {
                h.push_str("\ntypedef struct {");
            } else {
                h.push_str(&format!("\nstruct {model} {{"));
            }
            for layer in &self.layers {
                h.push_str(&format!("\n    {} {};", layer.layer_type, layer.name));
            }
            if self.config.add_typedef {
                h.push_str(&format!("\n}} {model};\n"));
            } else {
                h.push_str("\n};\n");
            }
            h.push_str(&format!("\n{};\n", self.init_prototype()));
        }
        h.push_str(&format!("\n#endif /* {} */\n", self.guard));
        h
    }

    fn source_epilogue(&self) -> String {
        let mut s = String::new();
        if !self.config.binary_blob {
            return s;
        }
        let model = self.config.model_struct_name.to_lowercase();

        s.push_str("\n#ifndef USE_WEIGHTS_FILE\n");
        s.push_str(&format!("const WeightArray {model}_arrays[] = {{\n"));
        for array in &self.arrays {
            let name = &array.name;
            s.push_str(&format!("#ifdef WEIGHTS_{name}_DEFINED\n"));
            s.push_str(&format!(
                "    {{\"{name}\",  WEIGHTS_{name}_TYPE, sizeof({name}), {name}}},\n"
            ));
            s.push_str("#endif\n");
        }
        s.push_str("    {NULL, 0, 0, NULL}\n};\n#endif /* USE_WEIGHTS_FILE */\n");

        s.push_str("\n#ifndef DUMP_BINARY_WEIGHTS\n");
        s.push_str(&format!("{} {{\n", self.init_prototype()));
        for layer in &self.layers {
            s.push_str(&format!("    if ({}) return 1;\n", layer.init));
        }
        s.push_str("    return 0;\n}\n#endif /* DUMP_BINARY_WEIGHTS */\n");
        s
    }
}

impl<W: Write> Drop for BlobWriter<W> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                guard = %self.guard,
                arrays = self.arrays.len(),
                "blob writer dropped without finalize; output is incomplete"
            );
        }
    }
}

impl<W: Write> fmt::Debug for BlobWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriter")
            .field("guard", &self.guard)
            .field("arrays", &self.arrays.len())
            .field("layers", &self.layers.len())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if is_c_identifier(name) {
        Ok(())
    } else {
        Err(ExportError::InvalidConfig(format!(
            "'{name}' is not a valid C identifier"
        )))
    }
}

/// `static const T name[len] = { ... };` with eight values per line.
fn array_literal(name: &str, data: &ArrayData) -> Result<String> {
    let values = data.c_literals()?;
    let mut text = format!(
        "static const {} {name}[{}] = {{\n    ",
        data.type_tag().c_type(),
        values.len()
    );
    let last = values.len().saturating_sub(1);
    for (i, v) in values.iter().enumerate() {
        text.push_str(v);
        if i == last {
            break;
        }
        text.push(',');
        text.push_str(if i % 8 == 7 { "\n    " } else { " " });
    }
    text.push_str("\n};\n\n");
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer<'a>(
        header: &'a mut Vec<u8>,
        source: &'a mut Vec<u8>,
        config: WriterConfig,
    ) -> BlobWriter<&'a mut Vec<u8>> {
        BlobWriter::new(header, Some(source), "test_data", config).unwrap()
    }

    #[test]
    fn test_type_codes_are_distinct() {
        let codes: HashSet<i32> = TypeTag::ALL.iter().map(|t| t.code()).collect();
        assert_eq!(codes.len(), TypeTag::ALL.len());
        assert_eq!(TypeTag::Int8.c_type(), "opus_int8");
        assert_eq!(TypeTag::Int32.suffix(), "int");
    }

    #[test]
    fn test_array_literal_layout() {
        let data = ArrayData::Int32((0..10).collect());
        let text = array_literal("idx", &data).unwrap();
        assert_eq!(
            text,
            "static const int idx[10] = {\n    0, 1, 2, 3, 4, 5, 6, 7,\n    8, 9\n};\n\n"
        );
    }

    #[test]
    fn test_float_literals() {
        let data = ArrayData::Float(vec![0.5, -1.0, 1e-7]);
        assert_eq!(data.c_literals().unwrap(), vec!["0.5", "-1.0", "1e-7"]);
        assert!(ArrayData::Float(vec![f32::NAN]).c_literals().is_err());
    }

    #[test]
    fn test_registry_table_and_init_routine() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let mut w = writer(&mut h, &mut s, WriterConfig::default());
        w.register_array("a_bias", ArrayData::Float(vec![1.0])).unwrap();
        w.register_array("a_idx", ArrayData::Int32(vec![0])).unwrap();
        w.register_layer("a", "LinearLayer", "init_a()").unwrap();
        w.register_layer("b", "LinearLayer", "init_b()").unwrap();
        let blob = w.finalize().unwrap();
        assert_eq!(blob.array_names().collect::<Vec<_>>(), vec!["a_bias", "a_idx"]);

        let source = String::from_utf8(s).unwrap();
        let header = String::from_utf8(h).unwrap();

        let first = source.find("{\"a_bias\",").unwrap();
        let second = source.find("{\"a_idx\",").unwrap();
        let sentinel = source.find("{NULL, 0, 0, NULL}").unwrap();
        assert!(first < second && second < sentinel);
        assert!(source.contains("const WeightArray model_arrays[] = {"));

        let init_a = source.find("if (init_a()) return 1;").unwrap();
        let init_b = source.find("if (init_b()) return 1;").unwrap();
        assert!(init_a < init_b);
        assert!(source.contains("    return 0;\n}"));

        assert!(header.contains("#ifndef TEST_DATA_H"));
        assert!(header.contains("#define WEIGHTS_a_bias_DEFINED"));
        assert!(header.contains("#define WEIGHTS_a_idx_TYPE WEIGHT_TYPE_int"));
        assert!(header.contains("struct Model {\n    LinearLayer a;\n    LinearLayer b;\n};"));
        assert!(header.contains("int init_model(struct Model *model, const WeightArray *arrays);"));
        assert!(header.trim_end().ends_with("#endif /* TEST_DATA_H */"));
    }

    #[test]
    fn test_typedef_struct() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let config = WriterConfig::default()
            .with_model_struct_name("RNNoise")
            .with_typedef(true);
        let w = writer(&mut h, &mut s, config);
        w.finalize().unwrap();
        let header = String::from_utf8(h).unwrap();
        assert!(header.contains("typedef struct {\n} RNNoise;"));
        assert!(header.contains("int init_rnnoise(RNNoise *model, const WeightArray *arrays);"));
    }

    #[test]
    fn test_duplicate_array_poisons_writer() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let mut w = writer(&mut h, &mut s, WriterConfig::default());
        w.register_array("x", ArrayData::Float(vec![1.0])).unwrap();
        let err = w.register_array("x", ArrayData::Float(vec![2.0]));
        assert!(matches!(err, Err(ExportError::DuplicateName { kind: "array", .. })));
        assert!(w.is_poisoned());
        assert!(matches!(
            w.register_array("y", ArrayData::Float(vec![3.0])),
            Err(ExportError::Sealed)
        ));
        assert!(matches!(w.finalize(), Err(ExportError::Sealed)));

        let source = String::from_utf8(s).unwrap();
        assert!(!source.contains("{NULL, 0, 0, NULL}"));
    }

    #[test]
    fn test_duplicate_layer_rejected() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let mut w = writer(&mut h, &mut s, WriterConfig::default());
        w.register_layer("gru", "GRULayer", "x").unwrap();
        assert!(matches!(
            w.register_layer("gru", "GRULayer", "x"),
            Err(ExportError::DuplicateName { kind: "layer", .. })
        ));
    }

    #[test]
    fn test_debug_array_guarded() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let mut w = writer(&mut h, &mut s, WriterConfig::default());
        w.register_debug_array("w_float", ArrayData::Float(vec![0.25]))
            .unwrap();
        w.finalize().unwrap();
        let source = String::from_utf8(s).unwrap();
        let guard = source.find("#ifndef DISABLE_DEBUG_FLOAT").unwrap();
        let def = source.find("static const float w_float[1]").unwrap();
        let end = source.find("#endif /*DISABLE_DEBUG_FLOAT*/").unwrap();
        assert!(guard < def && def < end);
    }

    #[test]
    fn test_without_binary_blob() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let mut w = writer(&mut h, &mut s, WriterConfig::default().with_binary_blob(false));
        w.register_array("v", ArrayData::Int16(vec![-3, 4])).unwrap();
        w.finalize().unwrap();
        let source = String::from_utf8(s).unwrap();
        let header = String::from_utf8(h).unwrap();
        assert!(source.contains("static const opus_int16 v[2] = {\n    -3, 4\n};"));
        assert!(!source.contains("USE_WEIGHTS_FILE"));
        assert!(!header.contains("struct Model"));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let mut w = writer(&mut h, &mut s, WriterConfig::default());
        assert!(matches!(
            w.register_array("bad name", ArrayData::Int8(vec![1])),
            Err(ExportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_weights_file_records() {
        let (mut h, mut s) = (Vec::new(), Vec::new());
        let mut w = writer(&mut h, &mut s, WriterConfig::default());
        w.register_array("small", ArrayData::Int8(vec![1, -1, 2])).unwrap();
        w.register_array("wide", ArrayData::Float(vec![1.0; 20])).unwrap();
        let blob = w.finalize().unwrap();

        let mut bytes = Vec::new();
        blob.write_weights_file(&mut bytes).unwrap();
        // 64 header + 64 padded payload, then 64 header + 128 padded payload.
        assert_eq!(bytes.len(), 64 + 64 + 64 + 128);
        assert_eq!(&bytes[..4], b"DNNw");
        assert_eq!(i32::from_le_bytes(bytes[8..12].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(bytes[12..16].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(bytes[16..20].try_into().unwrap()), 64);
        assert_eq!(&bytes[20..25], b"small");
        assert_eq!(bytes[25], 0);
        assert_eq!(&bytes[64..67], &[1, 0xff, 2]);

        let second = 128;
        assert_eq!(
            i32::from_le_bytes(bytes[second + 12..second + 16].try_into().unwrap()),
            80
        );
    }

    #[test]
    fn test_weights_file_rejects_long_names() {
        let long = "n".repeat(WEIGHT_NAME_LEN);
        let blob = ModelBlob {
            layers: Vec::new(),
            arrays: vec![NamedArray {
                name: long,
                data: ArrayData::Int8(vec![0]),
            }],
        };
        assert!(blob.write_weights_file(Vec::new()).is_err());
    }
}
