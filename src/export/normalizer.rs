use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{ConversionError, Result};
use crate::export::tracer::{TracedValue, Tracer};
use crate::pipeline::traits::TraceableModel;

/// Whatever a model's forward pass returns, before normalization.
#[derive(Debug, Clone)]
pub enum ModelOutput<V> {
    Tensor(V),
    /// Fixed-position composite, e.g. `(emissions, lengths)`.
    Tuple(Vec<ModelOutput<V>>),
    /// An optional slot left empty, e.g. `lengths` for unpadded input.
    Absent,
}

impl<V> ModelOutput<V> {
    fn describe(&self) -> String {
        match self {
            Self::Tensor(_) => "tensor".to_string(),
            Self::Tuple(items) => format!(
                "tuple({})",
                items.iter().map(|i| i.describe()).collect::<Vec<_>>().join(", ")
            ),
            Self::Absent => "absent".to_string(),
        }
    }
}

/// Picks the canonical emission tensor out of a model output: the bare tensor,
/// or the first element of a tuple when that element is a tensor.
pub fn normalize<V>(output: ModelOutput<V>) -> Result<V> {
    match output {
        ModelOutput::Tensor(v) => Ok(v),
        ModelOutput::Tuple(items) => {
            let shape = format!(
                "tuple({})",
                items.iter().map(|i| i.describe()).collect::<Vec<_>>().join(", ")
            );
            match items.into_iter().next() {
                Some(ModelOutput::Tensor(v)) => Ok(v),
                _ => Err(ConversionError::shape_contract(
                    "normalize model output",
                    format!("expected a tensor or a tuple led by a tensor, got {shape}"),
                )),
            }
        }
        ModelOutput::Absent => Err(ConversionError::shape_contract(
            "normalize model output",
            "model produced no output",
        )),
    }
}

/// Single-output view over a model, so the exporter never special-cases output arity.
#[derive(Clone)]
pub struct OutputNormalizer {
    model: Arc<dyn TraceableModel>,
}

impl OutputNormalizer {
    pub fn new(model: Arc<dyn TraceableModel>) -> Self {
        Self { model }
    }

    pub fn emissions(&self, input: &Tensor) -> Result<Tensor> {
        normalize(self.model.forward_eager(input)?)
    }

    pub fn trace(&self, tracer: &mut Tracer, input: &TracedValue) -> Result<TracedValue> {
        normalize(self.model.forward_traced(tracer, input)?)
    }

    /// Runs the model once and checks the normalized output is a rank-3 emission tensor.
    pub fn check_contract(&self, probe: &Tensor) -> Result<Vec<usize>> {
        let emissions = self.emissions(probe)?;
        if emissions.rank() != 3 {
            return Err(ConversionError::shape_contract(
                "check emission rank",
                format!(
                    "expected [batch, frames, vocab], got shape {:?}",
                    emissions.dims()
                ),
            ));
        }
        Ok(emissions.dims().to_vec())
    }
}
