use candle_core::Tensor;

use crate::error::{ConversionError, Result};
use crate::export::normalizer::ModelOutput;
use crate::export::tracer::{TracedValue, Tracer};
use crate::types::{DecisionPath, NamedTensors, Precision};

/// A model that can run eagerly and be traced into a graph with the same code path.
pub trait TraceableModel: Send + Sync {
    fn forward_eager(&self, input: &Tensor) -> Result<ModelOutput<Tensor>>;

    fn forward_traced(
        &self,
        tracer: &mut Tracer,
        input: &TracedValue,
    ) -> Result<ModelOutput<TracedValue>>;
}

/// A serialized graph bound to an inference runtime.
pub trait InferenceSession: Send + Sync {
    fn input_names(&self) -> Vec<String>;
    fn output_names(&self) -> Vec<String>;
    fn precision(&self) -> Precision;
    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors>;

    /// Feeds `audio` to the single input and returns the first declared output.
    fn emissions(&self, audio: &Tensor) -> Result<Tensor> {
        let input = self
            .input_names()
            .into_iter()
            .next()
            .ok_or_else(|| ConversionError::inference("session emissions", "session declares no input"))?;
        let output = self
            .output_names()
            .into_iter()
            .next()
            .ok_or_else(|| ConversionError::inference("session emissions", "session declares no output"))?;
        let mut inputs = NamedTensors::new();
        inputs.insert(input, audio.clone());
        let mut outputs = self.run(&inputs)?;
        outputs.remove(&output).ok_or_else(|| {
            ConversionError::inference("session emissions", format!("output {output} missing from run"))
        })
    }
}

/// CTC forced-alignment search over one utterance.
///
/// `log_probs` is `[frames, vocab]` with every row the same length; the
/// returned path holds one label per frame (blank or a target symbol) and the
/// path's total log-probability.
pub trait ForcedAlignPrimitive: Send + Sync {
    fn align(
        &self,
        log_probs: &[Vec<f32>],
        targets: &[usize],
        input_length: usize,
        target_length: usize,
        blank: usize,
    ) -> Result<DecisionPath>;
}
