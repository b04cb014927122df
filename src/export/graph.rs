use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};

use crate::error::{ConversionError, Result};
use crate::types::{AxisRole, Precision};

pub const FORMAT_VERSION: u32 = 1;
pub const PRODUCER: &str = concat!("ctc-export ", env!("CARGO_PKG_VERSION"));

/// One graph operation. Operand order is fixed per variant and documented on
/// the variant; trailing optional operands (biases) may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// `[x, weight, bias?]`
    Conv1d {
        stride: usize,
        padding: usize,
        groups: usize,
    },
    /// `[x, weight[out, in], bias?]`
    Linear,
    /// `[x, weight_quantized[out, in], weight_scale[out | 1], bias?]`
    QuantizedLinear,
    /// `[a, b]`
    MatMul,
    Add,
    Scale {
        factor: f64,
    },
    Gelu,
    Softmax,
    /// `[x, weight, bias]`
    LayerNorm {
        eps: f64,
    },
    /// `[x, weight, bias]`
    GroupNorm {
        num_groups: usize,
        eps: f64,
    },
    Transpose {
        dim0: usize,
        dim1: usize,
    },
    Unsqueeze {
        dim: usize,
    },
    SplitHeads {
        num_heads: usize,
    },
    MergeHeads,
    DropTail {
        axis: usize,
        count: usize,
    },
}

impl Op {
    /// Operator class name used to select quantization targets.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Conv1d { .. } => "Conv",
            Self::Linear => "Gemm",
            Self::QuantizedLinear => "DynamicQuantizeLinear",
            Self::MatMul => "MatMul",
            Self::Add => "Add",
            Self::Scale { .. } => "Mul",
            Self::Gelu => "Gelu",
            Self::Softmax => "Softmax",
            Self::LayerNorm { .. } => "LayerNormalization",
            Self::GroupNorm { .. } => "GroupNormalization",
            Self::Transpose { .. } => "Transpose",
            Self::Unsqueeze { .. } => "Unsqueeze",
            Self::SplitHeads { .. } | Self::MergeHeads => "Reshape",
            Self::DropTail { .. } => "Slice",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(flatten)]
    pub op: Op,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub role: AxisRole,
    /// Present for fixed axes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

/// A declared graph input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub axes: Vec<AxisInfo>,
}

impl ValueInfo {
    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    pub fn dynamic_axes(&self) -> impl Iterator<Item = (usize, &AxisInfo)> {
        self.axes
            .iter()
            .enumerate()
            .filter(|(_, axis)| axis.role.is_dynamic())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Self::F32(v) => v.len() * 4,
            Self::I8(v) => v.len(),
        }
    }

    fn dtype(&self) -> ElementType {
        match self {
            Self::F32(_) => ElementType::F32,
            Self::I8(_) => ElementType::I8,
        }
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::I8(v) => v.iter().map(|&x| x as u8).collect(),
        }
    }
}

/// A named constant tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl Initializer {
    pub fn from_tensor(name: impl Into<String>, tensor: &Tensor) -> candle_core::Result<Self> {
        let values = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            name: name.into(),
            shape: tensor.dims().to_vec(),
            data: TensorData::F32(values),
        })
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        match &self.data {
            TensorData::F32(values) => Tensor::from_slice(values, self.shape.as_slice(), device)
                .map_err(|e| ConversionError::session_load("materialize initializer", e)),
            TensorData::I8(_) => Err(ConversionError::session_load(
                "materialize initializer",
                format!("{} is int8 and is consumed only by quantized nodes", self.name),
            )),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.byte_len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ElementType {
    F32,
    I8,
}

impl ElementType {
    fn safetensors_dtype(self) -> Dtype {
        match self {
            Self::F32 => Dtype::F32,
            Self::I8 => Dtype::I8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "location", rename_all = "lowercase")]
enum InitializerStorage {
    /// Stored as `f64` so both element types survive the JSON round trip exactly.
    Inline { values: Vec<f64> },
    Sidecar,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InitializerRecord {
    name: String,
    dtype: ElementType,
    shape: Vec<usize>,
    #[serde(flatten)]
    storage: InitializerStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphManifest {
    format_version: u32,
    producer: String,
    precision: Precision,
    inline_threshold_bytes: usize,
    inputs: Vec<ValueInfo>,
    outputs: Vec<ValueInfo>,
    nodes: Vec<Node>,
    initializers: Vec<InitializerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sidecar: Option<String>,
}

/// Encoded form of a graph: manifest bytes plus the optional sidecar blob.
#[derive(Debug, Clone)]
pub struct EncodedGraph {
    pub manifest: Vec<u8>,
    pub sidecar: Option<Vec<u8>>,
}

impl EncodedGraph {
    pub fn total_size_bytes(&self) -> usize {
        self.manifest.len() + self.sidecar.as_ref().map_or(0, Vec::len)
    }
}

/// Serializable inference graph. Immutable once built; transformations such as
/// quantization produce a new graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedGraph {
    producer: String,
    precision: Precision,
    inline_threshold_bytes: usize,
    inputs: Vec<ValueInfo>,
    outputs: Vec<ValueInfo>,
    nodes: Vec<Node>,
    initializers: BTreeMap<String, Initializer>,
}

impl ExportedGraph {
    pub fn from_parts(
        precision: Precision,
        inline_threshold_bytes: usize,
        inputs: Vec<ValueInfo>,
        outputs: Vec<ValueInfo>,
        nodes: Vec<Node>,
        initializers: BTreeMap<String, Initializer>,
    ) -> Self {
        Self {
            producer: PRODUCER.to_string(),
            precision,
            inline_threshold_bytes,
            inputs,
            outputs,
            nodes,
            initializers,
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn inline_threshold_bytes(&self) -> usize {
        self.inline_threshold_bytes
    }

    pub fn inputs(&self) -> &[ValueInfo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueInfo] {
        &self.outputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn initializers(&self) -> &BTreeMap<String, Initializer> {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.get(name)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|v| v.name.clone()).collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|v| v.name.clone()).collect()
    }

    /// Checks every node operand is defined before use and every declared
    /// output is produced.
    pub fn validate(&self) -> Result<()> {
        let mut defined: BTreeSet<&str> = self.inputs.iter().map(|v| v.name.as_str()).collect();
        defined.extend(self.initializers.keys().map(String::as_str));
        for node in &self.nodes {
            for input in &node.inputs {
                if !defined.contains(input.as_str()) {
                    return Err(ConversionError::session_load(
                        "validate graph",
                        format!("node {} reads undefined value {input}", node.name),
                    ));
                }
            }
            defined.extend(node.outputs.iter().map(String::as_str));
        }
        for output in &self.outputs {
            if !defined.contains(output.name.as_str()) {
                return Err(ConversionError::session_load(
                    "validate graph",
                    format!("declared output {} is never produced", output.name),
                ));
            }
        }
        Ok(())
    }

    /// Serializes into a JSON manifest plus, when any initializer exceeds the
    /// inline threshold, a safetensors sidecar referenced as `sidecar_name`.
    pub fn encode(&self, sidecar_name: &str) -> Result<EncodedGraph> {
        let mut records = Vec::with_capacity(self.initializers.len());
        let mut external = Vec::new();
        for init in self.initializers.values() {
            let storage = if init.byte_len() > self.inline_threshold_bytes {
                external.push((init.name.clone(), init.data.dtype(), init.shape.clone(), init.data.to_le_bytes()));
                InitializerStorage::Sidecar
            } else {
                let values = match &init.data {
                    TensorData::F32(v) => v.iter().map(|&x| f64::from(x)).collect(),
                    TensorData::I8(v) => v.iter().map(|&x| f64::from(x)).collect(),
                };
                InitializerStorage::Inline { values }
            };
            records.push(InitializerRecord {
                name: init.name.clone(),
                dtype: init.data.dtype(),
                shape: init.shape.clone(),
                storage,
            });
        }

        let sidecar = if external.is_empty() {
            None
        } else {
            let views = external
                .iter()
                .map(|(name, dtype, shape, bytes)| {
                    TensorView::new(dtype.safetensors_dtype(), shape.clone(), bytes)
                        .map(|view| (name.clone(), view))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ConversionError::safetensors("build sidecar view", e))?;
            let blob = safetensors::tensor::serialize(views, &None)
                .map_err(|e| ConversionError::safetensors("serialize sidecar", e))?;
            Some(blob)
        };

        let manifest = GraphManifest {
            format_version: FORMAT_VERSION,
            producer: self.producer.clone(),
            precision: self.precision,
            inline_threshold_bytes: self.inline_threshold_bytes,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            nodes: self.nodes.clone(),
            initializers: records,
            sidecar: sidecar.as_ref().map(|_| sidecar_name.to_string()),
        };
        let manifest = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ConversionError::json("serialize graph manifest", e))?;
        Ok(EncodedGraph { manifest, sidecar })
    }

    pub fn decode(manifest: &[u8], sidecar: Option<&[u8]>) -> Result<Self> {
        let manifest: GraphManifest = serde_json::from_slice(manifest)
            .map_err(|e| ConversionError::json("parse graph manifest", e))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(ConversionError::session_load(
                "decode graph",
                format!(
                    "unsupported format version {} (expected {FORMAT_VERSION})",
                    manifest.format_version
                ),
            ));
        }

        let blob = match (&manifest.sidecar, sidecar) {
            (Some(_), Some(bytes)) => Some(
                SafeTensors::deserialize(bytes)
                    .map_err(|e| ConversionError::safetensors("parse sidecar", e))?,
            ),
            (Some(name), None) => {
                return Err(ConversionError::session_load(
                    "decode graph",
                    format!("manifest references sidecar {name} but none was supplied"),
                ))
            }
            (None, _) => None,
        };

        let mut initializers = BTreeMap::new();
        for record in manifest.initializers {
            let numel: usize = record.shape.iter().product();
            let data = match record.storage {
                InitializerStorage::Inline { values } => match record.dtype {
                    ElementType::F32 => TensorData::F32(values.iter().map(|&x| x as f32).collect()),
                    ElementType::I8 => TensorData::I8(values.iter().map(|&x| x as i8).collect()),
                },
                InitializerStorage::Sidecar => {
                    let blob = blob.as_ref().ok_or_else(|| {
                        ConversionError::session_load(
                            "decode graph",
                            format!("initializer {} is external but no sidecar is declared", record.name),
                        )
                    })?;
                    let view = blob
                        .tensor(&record.name)
                        .map_err(|e| ConversionError::safetensors("read sidecar tensor", e))?;
                    if view.dtype() != record.dtype.safetensors_dtype() || view.shape() != record.shape.as_slice() {
                        return Err(ConversionError::session_load(
                            "decode graph",
                            format!("sidecar tensor {} disagrees with its manifest record", record.name),
                        ));
                    }
                    decode_le_bytes(record.dtype, view.data())
                }
            };
            if data.len() != numel {
                return Err(ConversionError::session_load(
                    "decode graph",
                    format!(
                        "initializer {} holds {} values, shape {:?} needs {numel}",
                        record.name,
                        data.len(),
                        record.shape
                    ),
                ));
            }
            initializers.insert(
                record.name.clone(),
                Initializer {
                    name: record.name,
                    shape: record.shape,
                    data,
                },
            );
        }

        Ok(Self {
            producer: manifest.producer,
            precision: manifest.precision,
            inline_threshold_bytes: manifest.inline_threshold_bytes,
            inputs: manifest.inputs,
            outputs: manifest.outputs,
            nodes: manifest.nodes,
            initializers,
        })
    }

    /// Writes the manifest to `path` and any sidecar blob to `<path>.data`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let sidecar_path = sidecar_path(path);
        let sidecar_name = sidecar_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ConversionError::invalid_input(format!("not a file path: {}", path.display())))?;
        let encoded = self.encode(&sidecar_name)?;
        std::fs::write(path, &encoded.manifest)
            .map_err(|e| ConversionError::io("write graph manifest", e))?;
        if let Some(blob) = &encoded.sidecar {
            std::fs::write(&sidecar_path, blob)
                .map_err(|e| ConversionError::io("write graph sidecar", e))?;
        }
        tracing::debug!(
            path = %path.display(),
            manifest_bytes = encoded.manifest.len(),
            sidecar_bytes = encoded.sidecar.as_ref().map_or(0, Vec::len),
            "graph saved"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let manifest =
            std::fs::read(path).map_err(|e| ConversionError::io("read graph manifest", e))?;
        let header: SidecarProbe = serde_json::from_slice(&manifest)
            .map_err(|e| ConversionError::json("parse graph manifest", e))?;
        let sidecar = match header.sidecar {
            Some(name) => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                Some(
                    std::fs::read(dir.join(name))
                        .map_err(|e| ConversionError::io("read graph sidecar", e))?,
                )
            }
            None => None,
        };
        Self::decode(&manifest, sidecar.as_deref())
    }

    /// Manifest plus sidecar size as they would be written by [`Self::save`].
    pub fn total_size_bytes(&self) -> Result<usize> {
        Ok(self.encode("graph.data")?.total_size_bytes())
    }
}

#[derive(Deserialize)]
struct SidecarProbe {
    #[serde(default)]
    sidecar: Option<String>,
}

pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".data");
    PathBuf::from(name)
}

fn decode_le_bytes(dtype: ElementType, bytes: &[u8]) -> TensorData {
    match dtype {
        ElementType::F32 => TensorData::F32(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        ElementType::I8 => TensorData::I8(bytes.iter().map(|&b| b as i8).collect()),
    }
}
