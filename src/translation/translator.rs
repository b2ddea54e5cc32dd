//! NLLB translator: resolves language codes, splits long inputs into sentence-aligned chunks and
//! generates every chunk in one batch.

use candle_core::{Device, Tensor};
use std::time::Instant;

use super::chunking::{ChunkMarkers, split_chunks};
use super::{TranslationError, languages};
use crate::config::{GenerationConfig, TranslationConfig};
use crate::models::{
    EncodedBatch, GenerateOptions, NllbLoader, PAD_TOKEN, Seq2SeqModel, TextTokenizer,
};
use crate::pipeline::{self, ModelLoader, ModelPipeline, ModelSlots, PipelineError, ToDevice};

/// Text whose first token marks a sentence boundary in the model vocabulary.
const SEPARATOR_TEXT: &str = ".";

/// Largest chunk the translator feeds the encoder for a given output limit.
///
/// Keeps a quarter of the output budget free so chunk translations are not cut short.
pub fn chunk_token_budget(max_length: usize) -> usize {
    max_length * 3 / 4
}

/// Raw fields of one translation request.
#[derive(Debug, Clone, Copy)]
pub struct TranslationRequest<'a> {
    /// Text to translate.
    pub text: &'a str,
    /// Short code of the source language.
    pub src_lang: &'a str,
    /// Short code of the target language.
    pub tgt_lang: &'a str,
}

/// Encoded chunks plus the target-language token forced at the first decoding step.
#[derive(Debug, Clone)]
pub struct TranslationBatch {
    /// One row per chunk, in document order.
    pub batch: EncodedBatch,
    /// Token id of the target locale tag.
    pub forced_bos_token_id: u32,
}

impl ToDevice for TranslationBatch {
    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            batch: self.batch.to_device(device)?,
            forced_bos_token_id: self.forced_bos_token_id,
        })
    }
}

/// Chunked NLLB translator.
///
/// Long documents are split at sentence separators into chunks that are generated as one batch;
/// the decoded chunks are joined with newlines in their original order.
pub struct Translator<L: ModelLoader = NllbLoader> {
    slots: ModelSlots<L>,
    generation: GenerationConfig,
}

impl Translator<NllbLoader> {
    /// Build a translator for the configured model, loading weights from disk or the Hub.
    pub fn from_config(config: &TranslationConfig, device: Device) -> Self {
        Self::new(
            config.model_name.clone(),
            config.generation_config.clone(),
            device,
            NllbLoader::default(),
        )
    }
}

impl<L> Translator<L>
where
    L: ModelLoader,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    /// Build a translator around a custom loader.
    pub fn new(
        model_name: impl Into<String>,
        generation: GenerationConfig,
        device: Device,
        loader: L,
    ) -> Self {
        Self {
            slots: ModelSlots::new(model_name, device, loader),
            generation,
        }
    }

    /// Translate `text` from `src_lang` to `tgt_lang`.
    pub fn translate(
        &self,
        text: &str,
        src_lang: &str,
        tgt_lang: &str,
    ) -> Result<String, TranslationError> {
        pipeline::invoke(
            self,
            TranslationRequest {
                text,
                src_lang,
                tgt_lang,
            },
        )
    }

    /// Token budget per chunk derived from the configured output length.
    pub fn chunk_budget(&self) -> usize {
        chunk_token_budget(self.generation.max_length)
    }
}

fn separator_token<T: TextTokenizer>(tokenizer: &T) -> Result<u32, PipelineError> {
    tokenizer
        .encode(SEPARATOR_TEXT)?
        .first()
        .copied()
        .ok_or_else(|| PipelineError::MissingToken(SEPARATOR_TEXT.to_string()))
}

impl<L> ModelPipeline for Translator<L>
where
    L: ModelLoader,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    type Request<'a> = TranslationRequest<'a>;
    type Encoded = TranslationBatch;
    type Output = Tensor;
    type Error = TranslationError;

    fn encode(
        &self,
        request: TranslationRequest<'_>,
    ) -> Result<TranslationBatch, TranslationError> {
        let src_tag = languages::resolve(request.src_lang)?;
        let tgt_tag = languages::resolve(request.tgt_lang)?;

        let tokenizer = self.slots.acquire_tokenizer()?;
        let inputs = tokenizer.translation_inputs(request.text, src_tag, tgt_tag)?;
        let markers = ChunkMarkers {
            separator: separator_token(tokenizer)?,
            pad: tokenizer.require_token(PAD_TOKEN)?,
        };

        let token_count = inputs.input_ids.len();
        let budget = self.chunk_budget();
        let chunks = split_chunks(inputs.input_ids, budget, markers)?;
        tracing::debug!(
            src = src_tag,
            tgt = tgt_tag,
            tokens = token_count,
            chunks = chunks.len(),
            chunk_budget = budget,
            "Encoded translation request"
        );

        let batch = EncodedBatch::from_rows(&chunks, markers.pad, &Device::Cpu)
            .map_err(PipelineError::Tensor)?;
        Ok(TranslationBatch {
            batch,
            forced_bos_token_id: inputs.forced_bos_token_id,
        })
    }

    fn forward(&self, encoded: TranslationBatch) -> Result<Tensor, TranslationError> {
        let model = self.slots.acquire_model()?;
        let options =
            GenerateOptions::from_config(&self.generation, Some(encoded.forced_bos_token_id));

        let started = Instant::now();
        let output = model
            .generate(&encoded.batch, &options)
            .map_err(PipelineError::Generation)?;
        tracing::debug!(
            rows = encoded.batch.batch_size(),
            num_beams = options.num_beams,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generated translation"
        );
        Ok(output)
    }

    fn decode(&self, output: Tensor) -> Result<String, TranslationError> {
        let tokenizer = self.slots.acquire_tokenizer()?;
        let rows = output.to_vec2::<u32>().map_err(PipelineError::Tensor)?;
        let segments = rows
            .iter()
            .map(|row| tokenizer.decode(row, true))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(segments.join("\n"))
    }

    fn device(&self) -> &Device {
        self.slots.device()
    }

    fn model_name(&self) -> &str {
        self.slots.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_three_quarters_of_max_length_rounded_down() {
        assert_eq!(chunk_token_budget(200), 150);
        assert_eq!(chunk_token_budget(267), 200);
        assert_eq!(chunk_token_budget(3), 2);
        assert_eq!(chunk_token_budget(1), 0);
    }
}
