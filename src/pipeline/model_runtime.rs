#[cfg(feature = "onnx")]
use std::path::Path;
use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::config::ExportOptions;
use crate::error::{ConversionError, Result};
use crate::export::graph::{ExportedGraph, Node, Op, TensorData, ValueInfo};
use crate::model::ops::{kernels, Conv1dParams};
use crate::pipeline::traits::InferenceSession;
use crate::quantize::{dynamic_quantized_linear, QuantizedWeight};
use crate::types::{NamedTensors, Precision};

/// Input and output names a caller expects a loaded graph to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpectations {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl SessionExpectations {
    pub fn ctc(options: &ExportOptions) -> Self {
        Self {
            inputs: vec![options.input_name.clone()],
            outputs: vec![options.output_name.clone()],
        }
    }

    fn check(&self, inputs: &[String], outputs: &[String]) -> Result<()> {
        if inputs != self.inputs.as_slice() || outputs != self.outputs.as_slice() {
            return Err(ConversionError::session_load(
                "check graph signature",
                format!(
                    "graph declares inputs {inputs:?} / outputs {outputs:?}, expected {:?} / {:?}",
                    self.inputs, self.outputs
                ),
            ));
        }
        Ok(())
    }
}

pub fn parse_device(device: &str) -> Result<Device> {
    if device.eq_ignore_ascii_case("cpu") {
        Ok(Device::Cpu)
    } else if device.eq_ignore_ascii_case("cuda") {
        Device::new_cuda(0).map_err(|e| ConversionError::session_load("CUDA init", e))
    } else {
        Err(ConversionError::invalid_input(format!(
            "unsupported device '{device}', expected 'cpu' or 'cuda'"
        )))
    }
}

/// Operands resolved once at load time.
enum Prepared {
    Plain,
    Quantized {
        weight: Arc<QuantizedWeight>,
        bias: Option<Vec<f32>>,
    },
}

/// An [`ExportedGraph`] bound to the candle interpreter. Immutable after load.
pub struct GraphSession {
    graph: ExportedGraph,
    constants: HashMap<String, Tensor>,
    prepared: Vec<Prepared>,
    device: Device,
}

impl GraphSession {
    pub fn load(graph: ExportedGraph, expectations: &SessionExpectations, device: &Device) -> Result<Self> {
        expectations.check(&graph.input_names(), &graph.output_names())?;
        graph.validate()?;

        let mut constants = HashMap::new();
        for (name, init) in graph.initializers() {
            if let TensorData::F32(_) = init.data {
                constants.insert(name.clone(), init.to_tensor(device)?);
            }
        }

        let prepared = graph
            .nodes()
            .iter()
            .map(|node| prepare(node, &graph))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            nodes = graph.nodes().len(),
            initializers = graph.initializers().len(),
            precision = graph.precision().as_str(),
            ?device,
            "graph session loaded"
        );

        Ok(Self {
            graph,
            constants,
            prepared,
            device: device.clone(),
        })
    }

    pub fn graph(&self) -> &ExportedGraph {
        &self.graph
    }

    fn check_input(info: &ValueInfo, tensor: &Tensor) -> Result<()> {
        if tensor.rank() != info.rank() {
            return Err(ConversionError::inference(
                "check input",
                format!(
                    "{} expects rank {}, got shape {:?}",
                    info.name,
                    info.rank(),
                    tensor.dims()
                ),
            ));
        }
        for (i, (axis, &actual)) in info.axes.iter().zip(tensor.dims()).enumerate() {
            if let Some(size) = axis.size {
                if size != actual {
                    return Err(ConversionError::inference(
                        "check input",
                        format!("{} axis {i} is fixed at {size}, got {actual}", info.name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn operand<'a>(&'a self, node: &Node, name: &str, env: &'a HashMap<String, Tensor>) -> Result<&'a Tensor> {
        env.get(name).or_else(|| self.constants.get(name)).ok_or_else(|| {
            ConversionError::inference(
                "resolve operand",
                format!("node {} reads {name}, which is not available", node.name),
            )
        })
    }

    fn eval(&self, node: &Node, prepared: &Prepared, env: &HashMap<String, Tensor>) -> Result<Tensor> {
        let out = match prepared {
            Prepared::Quantized { weight, bias } => {
                let x = self.operand(node, &node.inputs[0], env)?;
                quantized_linear(x, weight, bias.as_deref())
            }
            Prepared::Plain => {
                let operands = node
                    .inputs
                    .iter()
                    .map(|name| self.operand(node, name, env))
                    .collect::<Result<Vec<&Tensor>>>()?;
                run_op(&node.op, &operands)
            }
        };
        out.map_err(|e| ConversionError::inference("evaluate node", format!("{}: {e}", node.name)))
    }
}

impl InferenceSession for GraphSession {
    fn input_names(&self) -> Vec<String> {
        self.graph.input_names()
    }

    fn output_names(&self) -> Vec<String> {
        self.graph.output_names()
    }

    fn precision(&self) -> Precision {
        self.graph.precision()
    }

    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors> {
        let mut env: HashMap<String, Tensor> = HashMap::new();
        for info in self.graph.inputs() {
            let tensor = inputs.get(&info.name).ok_or_else(|| {
                ConversionError::inference("check input", format!("missing input {}", info.name))
            })?;
            Self::check_input(info, tensor)?;
            let tensor = tensor
                .to_device(&self.device)
                .map_err(|e| ConversionError::inference("move input to device", e))?;
            env.insert(info.name.clone(), tensor);
        }

        for (node, prepared) in self.graph.nodes().iter().zip(&self.prepared) {
            let value = self.eval(node, prepared, &env)?;
            for output in &node.outputs {
                env.insert(output.clone(), value.clone());
            }
        }

        let mut outputs = NamedTensors::new();
        for info in self.graph.outputs() {
            let value = env.remove(&info.name).ok_or_else(|| {
                ConversionError::inference("collect outputs", format!("{} was not produced", info.name))
            })?;
            outputs.insert(info.name.clone(), value);
        }
        Ok(outputs)
    }
}

fn prepare(node: &Node, graph: &ExportedGraph) -> Result<Prepared> {
    if node.op != Op::QuantizedLinear {
        return Ok(Prepared::Plain);
    }
    let bad = |msg: String| ConversionError::session_load("prepare quantized node", format!("{}: {msg}", node.name));
    let (weight_name, scale_name, bias_name) = match node.inputs.as_slice() {
        [_, w, s] => (w, s, None),
        [_, w, s, b] => (w, s, Some(b)),
        _ => return Err(bad(format!("unexpected operand count {}", node.inputs.len()))),
    };
    let weight = graph
        .initializer(weight_name)
        .ok_or_else(|| bad(format!("{weight_name} is not an initializer")))?;
    let scale = graph
        .initializer(scale_name)
        .ok_or_else(|| bad(format!("{scale_name} is not an initializer")))?;
    let (TensorData::I8(values), TensorData::F32(scales)) = (&weight.data, &scale.data) else {
        return Err(bad("expected int8 weight and f32 scales".to_string()));
    };
    let [out_features, in_features] = weight.shape[..] else {
        return Err(bad(format!("weight rank {} is not 2", weight.shape.len())));
    };
    if scales.len() != 1 && scales.len() != out_features {
        return Err(bad(format!("{} scales for {out_features} channels", scales.len())));
    }
    let bias = match bias_name {
        Some(name) => match graph.initializer(name).map(|b| &b.data) {
            Some(TensorData::F32(b)) if b.len() == out_features => Some(b.clone()),
            _ => return Err(bad(format!("bias {name} is not an f32 vector of {out_features}"))),
        },
        None => None,
    };
    Ok(Prepared::Quantized {
        weight: Arc::new(QuantizedWeight {
            values: values.clone(),
            scales: scales.clone(),
            out_features,
            in_features,
        }),
        bias,
    })
}

fn run_op(op: &Op, v: &[&Tensor]) -> candle_core::Result<Tensor> {
    let arg = |i: usize| {
        v.get(i).copied().ok_or_else(|| {
            candle_core::Error::Msg(format!("{} is missing operand {i}", op.class()))
        })
    };
    match op {
        Op::Conv1d {
            stride,
            padding,
            groups,
        } => kernels::conv1d(
            arg(0)?,
            arg(1)?,
            v.get(2).copied(),
            Conv1dParams {
                stride: *stride,
                padding: *padding,
                groups: *groups,
            },
        ),
        Op::Linear => kernels::linear(arg(0)?, arg(1)?, v.get(2).copied()),
        Op::MatMul => kernels::matmul(arg(0)?, arg(1)?),
        Op::Add => arg(0)?.broadcast_add(arg(1)?),
        Op::Scale { factor } => arg(0)?.affine(*factor, 0.0),
        Op::Gelu => arg(0)?.gelu(),
        Op::Softmax => candle_nn::ops::softmax_last_dim(arg(0)?),
        Op::LayerNorm { eps } => kernels::layer_norm(arg(0)?, arg(1)?, arg(2)?, *eps),
        Op::GroupNorm { num_groups, eps } => {
            kernels::group_norm(arg(0)?, arg(1)?, arg(2)?, *num_groups, *eps)
        }
        Op::Transpose { dim0, dim1 } => arg(0)?.transpose(*dim0, *dim1)?.contiguous(),
        Op::Unsqueeze { dim } => arg(0)?.unsqueeze(*dim),
        Op::SplitHeads { num_heads } => kernels::split_heads(arg(0)?, *num_heads),
        Op::MergeHeads => kernels::merge_heads(arg(0)?),
        Op::DropTail { axis, count } => kernels::drop_tail(arg(0)?, *axis, *count),
        Op::QuantizedLinear => Err(candle_core::Error::Msg(
            "quantized node was not prepared at load time".to_string(),
        )),
    }
}

fn quantized_linear(x: &Tensor, weight: &QuantizedWeight, bias: Option<&[f32]>) -> candle_core::Result<Tensor> {
    let dims = x.dims().to_vec();
    let Some((&k, lead)) = dims.split_last() else {
        return Err(candle_core::Error::Msg("quantized linear on a scalar".to_string()));
    };
    if k != weight.in_features {
        return Err(candle_core::Error::Msg(format!(
            "input features {k} do not match weight in_features {}",
            weight.in_features
        )));
    }
    let rows: usize = lead.iter().product();
    let flat = x.flatten_all()?.to_vec1::<f32>()?;
    let y = dynamic_quantized_linear(&flat, rows, weight, bias);
    let mut out_dims = lead.to_vec();
    out_dims.push(weight.out_features);
    Tensor::from_vec(y, out_dims, x.device())
}

/// A `.onnx` artifact produced by another toolchain, served by ONNX Runtime.
#[cfg(feature = "onnx")]
pub struct OnnxSession {
    session: std::sync::Mutex<ort::session::Session>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    precision: Precision,
}

#[cfg(feature = "onnx")]
impl OnnxSession {
    pub fn load(
        path: &Path,
        expectations: &SessionExpectations,
        device: &str,
        precision: Precision,
    ) -> Result<Self> {
        let execution_providers = onnx_execution_providers(device)?;
        let session = ort::session::Session::builder()
            .map_err(|e| ConversionError::session_load("onnx session builder", e))?
            .with_execution_providers(execution_providers)
            .map_err(|e| ConversionError::session_load("onnx execution providers", e))?
            .commit_from_file(path)
            .map_err(|e| ConversionError::session_load("onnx model load", e))?;

        let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        expectations.check(&inputs, &outputs)?;

        tracing::info!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            model_path = %path.display(),
            device,
            "ONNX session loaded"
        );

        Ok(Self {
            session: std::sync::Mutex::new(session),
            inputs,
            outputs,
            precision,
        })
    }
}

#[cfg(feature = "onnx")]
impl InferenceSession for OnnxSession {
    fn input_names(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors> {
        let name = &self.inputs[0];
        let audio = inputs
            .get(name)
            .ok_or_else(|| ConversionError::inference("onnx input", format!("missing input {name}")))?;
        let (batch, samples) = audio
            .dims2()
            .map_err(|e| ConversionError::inference("onnx input tensor", e))?;
        let data = audio
            .flatten_all()
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| ConversionError::inference("onnx input tensor", e))?;
        let input = ort::value::TensorRef::from_array_view(([batch, samples], data.as_slice()))
            .map_err(|e| ConversionError::inference("onnx input tensor", e))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| ConversionError::inference("onnx session lock", "session mutex poisoned"))?;
        let outputs = session
            .run(ort::inputs![name.as_str() => input])
            .map_err(|e| ConversionError::inference("onnx forward pass", e))?;

        let mut result = NamedTensors::new();
        for out_name in &self.outputs {
            let (dims, values) = outputs[out_name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| ConversionError::inference("onnx extract output", e))?;
            let dims: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
            let tensor = Tensor::from_slice(values, dims, &Device::Cpu)
                .map_err(|e| ConversionError::inference("onnx output tensor", e))?;
            result.insert(out_name.clone(), tensor);
        }
        Ok(result)
    }
}

#[cfg(feature = "onnx")]
fn onnx_execution_providers(device: &str) -> Result<Vec<ort::ep::ExecutionProviderDispatch>> {
    if device.eq_ignore_ascii_case("cpu") {
        Ok(vec![ort::ep::CPU::default().build()])
    } else if device.eq_ignore_ascii_case("cuda") {
        Ok(vec![
            ort::ep::CUDA::default()
                .with_device_id(0)
                .build()
                .error_on_failure(),
            ort::ep::CPU::default().build(),
        ])
    } else {
        Err(ConversionError::invalid_input(format!(
            "unsupported ONNX device '{device}', expected 'cpu' or 'cuda'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use candle_core::DType;

    use super::*;
    use crate::export::graph::{AxisInfo, Initializer};
    use crate::types::AxisRole;

    fn linear_graph(precision: Precision, op: Op, inputs: &[&str], inits: Vec<Initializer>) -> ExportedGraph {
        let axes = |features: usize| {
            vec![
                AxisInfo {
                    name: Some("batch".into()),
                    role: AxisRole::Batch,
                    size: None,
                },
                AxisInfo {
                    name: Some("time".into()),
                    role: AxisRole::Sequence,
                    size: None,
                },
                AxisInfo {
                    name: None,
                    role: AxisRole::Fixed,
                    size: Some(features),
                },
            ]
        };
        ExportedGraph::from_parts(
            precision,
            1024,
            vec![ValueInfo {
                name: "audio".into(),
                axes: axes(2),
            }],
            vec![ValueInfo {
                name: "emissions".into(),
                axes: axes(3),
            }],
            vec![Node {
                name: "n0".into(),
                op,
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: vec!["emissions".into()],
            }],
            inits.into_iter().map(|i| (i.name.clone(), i)).collect::<BTreeMap<_, _>>(),
        )
    }

    fn f32_init(name: &str, shape: Vec<usize>, values: Vec<f32>) -> Initializer {
        Initializer {
            name: name.into(),
            shape,
            data: TensorData::F32(values),
        }
    }

    fn expectations() -> SessionExpectations {
        SessionExpectations::ctc(&ExportOptions::default())
    }

    #[test]
    fn runs_varying_sequence_lengths() {
        let graph = linear_graph(
            Precision::F32,
            Op::Linear,
            &["audio", "w", "b"],
            vec![
                f32_init("w", vec![3, 2], vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
                f32_init("b", vec![3], vec![0.0, 0.0, 0.5]),
            ],
        );
        let session = GraphSession::load(graph, &expectations(), &Device::Cpu).unwrap();
        for t in [1, 4, 9] {
            let x = Tensor::ones((2, t, 2), DType::F32, &Device::Cpu).unwrap();
            let y = session.emissions(&x).unwrap();
            assert_eq!(y.dims(), &[2, t, 3]);
            let row = y.get(0).unwrap().get(0).unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(row, vec![1.0, 1.0, 2.5]);
        }
    }

    #[test]
    fn rejects_wrong_fixed_axis_and_rank() {
        let graph = linear_graph(
            Precision::F32,
            Op::Linear,
            &["audio", "w"],
            vec![f32_init("w", vec![3, 2], vec![0.0; 6])],
        );
        let session = GraphSession::load(graph, &expectations(), &Device::Cpu).unwrap();
        let wrong_features = Tensor::ones((1, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let err = session.emissions(&wrong_features).unwrap_err();
        assert_eq!(err.kind(), "inference_run_error");
        let wrong_rank = Tensor::ones((4, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(session.emissions(&wrong_rank).is_err());
    }

    #[test]
    fn load_rejects_unexpected_signature() {
        let graph = linear_graph(
            Precision::F32,
            Op::Linear,
            &["audio", "w"],
            vec![f32_init("w", vec![3, 2], vec![0.0; 6])],
        );
        let expectations = SessionExpectations {
            inputs: vec!["input_values".into()],
            outputs: vec!["logits".into()],
        };
        let err = GraphSession::load(graph, &expectations, &Device::Cpu).err().unwrap();
        assert_eq!(err.kind(), "session_load_error");
    }

    #[test]
    fn quantized_node_runs_through_int8_kernel() {
        let graph = linear_graph(
            Precision::Int8Dynamic,
            Op::QuantizedLinear,
            &["audio", "w_quantized", "w_scale"],
            vec![
                Initializer {
                    name: "w_quantized".into(),
                    shape: vec![3, 2],
                    data: TensorData::I8(vec![127, 0, 0, 127, 127, 127]),
                },
                f32_init("w_scale", vec![3], vec![1.0 / 127.0; 3]),
            ],
        );
        let session = GraphSession::load(graph, &expectations(), &Device::Cpu).unwrap();
        assert_eq!(session.precision(), Precision::Int8Dynamic);
        let x = Tensor::new(&[[[0.5f32, -0.25]]], &Device::Cpu).unwrap();
        let y = session.emissions(&x).unwrap();
        let v = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((v[0] - 0.5).abs() < 0.01);
        assert!((v[1] + 0.25).abs() < 0.01);
        assert!((v[2] - 0.25).abs() < 0.01);
    }

    #[test]
    fn parse_device_accepts_cpu_only_names() {
        assert!(parse_device("CPU").is_ok());
        assert_eq!(parse_device("tpu").unwrap_err().kind(), "invalid_input");
    }
}
