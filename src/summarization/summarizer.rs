use candle_core::{Device, Tensor};
use std::time::Instant;

use super::SummarizationError;
use crate::config::{GenerationConfig, SummaryConfig};
use crate::models::{
    BartLoader, EncodedBatch, GenerateOptions, PAD_TOKEN, Seq2SeqModel, TextTokenizer,
};
use crate::pipeline::{self, ModelLoader, ModelPipeline, ModelSlots, PipelineError};

/// Abstractive summarizer for one configured model.
///
/// Documents longer than the encoder input limit are truncated; the summary is generated in a
/// single pass.
pub struct Summarizer<L: ModelLoader = BartLoader> {
    slots: ModelSlots<L>,
    generation: GenerationConfig,
    max_input_tokens: usize,
}

impl Summarizer<BartLoader> {
    /// Build a summarizer for a configured model, loading weights from disk or the Hub.
    pub fn from_config(config: &SummaryConfig, device: Device) -> Self {
        Self::new(
            config.model_name.clone(),
            config.generation_config.clone(),
            config.max_input_tokens,
            device,
            BartLoader::default(),
        )
    }
}

impl<L> Summarizer<L>
where
    L: ModelLoader,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    /// Build a summarizer around a custom loader.
    pub fn new(
        model_name: impl Into<String>,
        generation: GenerationConfig,
        max_input_tokens: usize,
        device: Device,
        loader: L,
    ) -> Self {
        Self {
            slots: ModelSlots::new(model_name, device, loader),
            generation,
            max_input_tokens,
        }
    }

    /// Summarize `text`.
    pub fn summarize(&self, text: &str) -> Result<String, SummarizationError> {
        pipeline::invoke(self, text)
    }
}

impl<L> ModelPipeline for Summarizer<L>
where
    L: ModelLoader,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    type Request<'a> = &'a str;
    type Encoded = EncodedBatch;
    type Output = Tensor;
    type Error = SummarizationError;

    fn encode(&self, text: &str) -> Result<EncodedBatch, SummarizationError> {
        let tokenizer = self.slots.acquire_tokenizer()?;
        let input_ids = tokenizer.summarization_inputs(text, self.max_input_tokens)?;
        let pad = tokenizer.require_token(PAD_TOKEN)?;
        tracing::debug!(
            tokens = input_ids.len(),
            max_input_tokens = self.max_input_tokens,
            "Encoded summarization request"
        );
        let batch = EncodedBatch::from_rows(&[input_ids], pad, &Device::Cpu)
            .map_err(PipelineError::Tensor)?;
        Ok(batch)
    }

    fn forward(&self, encoded: EncodedBatch) -> Result<Tensor, SummarizationError> {
        let model = self.slots.acquire_model()?;
        let options = GenerateOptions::from_config(&self.generation, None);

        let started = Instant::now();
        let output = model
            .generate(&encoded, &options)
            .map_err(PipelineError::Generation)?;
        tracing::debug!(
            num_beams = options.num_beams,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generated summary"
        );
        Ok(output)
    }

    fn decode(&self, output: Tensor) -> Result<String, SummarizationError> {
        let tokenizer = self.slots.acquire_tokenizer()?;
        let rows = output.to_vec2::<u32>().map_err(PipelineError::Tensor)?;
        match rows.first() {
            Some(row) => Ok(tokenizer.decode(row, true)?),
            None => Ok(String::new()),
        }
    }

    fn device(&self) -> &Device {
        self.slots.device()
    }

    fn model_name(&self) -> &str {
        self.slots.model_name()
    }
}
