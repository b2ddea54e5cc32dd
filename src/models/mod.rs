//! Sequence-to-sequence model backends and the tokenizer seam the pipelines depend on.

mod bart;
mod generation;
mod hub;
mod layers;
mod m2m100;

pub use bart::{BartConfig, BartModel};
pub use hub::{BartLoader, CheckpointModel, HfTokenizer, HubLoader, NllbLoader};
pub use layers::Activation;
pub use m2m100::{M2M100Config, M2M100Model};

use crate::config::GenerationConfig;
use crate::pipeline::{PipelineError, ToDevice};
use candle_core::{Device, Tensor};

/// Beginning-of-sequence token of BART-style vocabularies.
pub const BOS_TOKEN: &str = "<s>";
/// End-of-sequence token shared by NLLB and BART vocabularies.
pub const EOS_TOKEN: &str = "</s>";
/// Padding token of NLLB-style vocabularies.
pub const PAD_TOKEN: &str = "<pad>";

/// Rectangular batch of encoder inputs.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    /// Token ids with shape `(rows, sequence_length)`, dtype `u32`.
    pub input_ids: Tensor,
    /// `1.0` for real tokens and `0.0` for padding, dtype `f32`, same shape as `input_ids`.
    pub attention_mask: Tensor,
}

impl EncodedBatch {
    /// Stack equally sized rows into a batch, masking out `pad_token_id`.
    pub fn from_rows(
        rows: &[Vec<u32>],
        pad_token_id: u32,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let width = rows.first().map(Vec::len).unwrap_or_default();
        if rows.iter().any(|row| row.len() != width) {
            candle_core::bail!("encoder rows must share one length");
        }
        let ids: Vec<u32> = rows.iter().flatten().copied().collect();
        let mask: Vec<f32> = ids
            .iter()
            .map(|&id| if id == pad_token_id { 0.0 } else { 1.0 })
            .collect();
        Ok(Self {
            input_ids: Tensor::from_vec(ids, (rows.len(), width), device)?,
            attention_mask: Tensor::from_vec(mask, (rows.len(), width), device)?,
        })
    }

    /// Number of rows in the batch.
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or_default()
    }
}

impl ToDevice for EncodedBatch {
    fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
        })
    }
}

/// Decoding parameters for one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions {
    /// Maximum output length, decoder start token included.
    pub max_length: usize,
    /// Tokens to generate after the decoder start token; overrides `max_length` when set.
    pub max_new_tokens: Option<usize>,
    /// End-of-sequence is suppressed while a row is shorter than this.
    pub min_length: usize,
    /// Beam count; `1` decodes greedily.
    pub num_beams: usize,
    /// Exponent applied to hypothesis length when ranking finished beams.
    pub length_penalty: f32,
    /// Stop a row's beam search once it holds `num_beams` finished hypotheses.
    pub early_stopping: bool,
    /// Penalty applied to logits of tokens already present in a row.
    pub repetition_penalty: Option<f32>,
    /// Size of n-grams that may not repeat within a row; `0` disables the check.
    pub no_repeat_ngram_size: usize,
    /// Token forced at the first decoding step, typically the target language tag.
    pub forced_bos_token_id: Option<u32>,
    /// Token forced as the last position when a row reaches the length limit.
    pub forced_eos_token_id: Option<u32>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default(), None)
    }
}

impl GenerateOptions {
    /// Build options from configuration plus a per-request forced first token.
    pub fn from_config(config: &GenerationConfig, forced_bos_token_id: Option<u32>) -> Self {
        Self {
            max_length: config.max_length,
            max_new_tokens: config.max_new_tokens,
            min_length: config.min_length,
            num_beams: config.num_beams.max(1),
            length_penalty: config.length_penalty,
            early_stopping: config.early_stopping,
            repetition_penalty: config.repetition_penalty,
            no_repeat_ngram_size: config.no_repeat_ngram_size,
            forced_bos_token_id,
            forced_eos_token_id: None,
        }
    }

    /// Output length limit, decoder start token included.
    pub fn output_length(&self) -> usize {
        self.max_new_tokens
            .map(|tokens| tokens + 1)
            .unwrap_or(self.max_length)
    }
}

/// Encoder-decoder model able to generate one output row per input row.
pub trait Seq2SeqModel: Send + Sync {
    /// Generate token ids with shape `(rows, output_length)`.
    fn generate(
        &self,
        batch: &EncodedBatch,
        options: &GenerateOptions,
    ) -> candle_core::Result<Tensor>;
}

/// Tokenizer-ready input for one translation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationInputs {
    /// Source language tag, text tokens, and end-of-sequence marker.
    pub input_ids: Vec<u32>,
    /// Target language tag forced as the first generated token.
    pub forced_bos_token_id: u32,
}

/// Subword tokenizer operations required by the pipelines.
pub trait TextTokenizer: Send + Sync {
    /// Encode raw text without adding special tokens.
    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError>;

    /// Decode ids into text.
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, PipelineError>;

    /// Look up a vocabulary entry.
    fn token_to_id(&self, token: &str) -> Option<u32>;

    /// Look up a vocabulary entry the caller cannot work without.
    fn require_token(&self, token: &str) -> Result<u32, PipelineError> {
        self.token_to_id(token)
            .ok_or_else(|| PipelineError::MissingToken(token.to_string()))
    }

    /// Frame `text` the way NLLB expects: `[src_tag] tokens </s>`, with `tgt_tag` forced first
    /// on the decoder side.
    fn translation_inputs(
        &self,
        text: &str,
        src_tag: &str,
        tgt_tag: &str,
    ) -> Result<TranslationInputs, PipelineError> {
        let src = self.require_token(src_tag)?;
        let tgt = self.require_token(tgt_tag)?;
        let eos = self.require_token(EOS_TOKEN)?;
        let tokens = self.encode(text)?;

        let mut input_ids = Vec::with_capacity(tokens.len() + 2);
        input_ids.push(src);
        input_ids.extend(tokens);
        input_ids.push(eos);
        Ok(TranslationInputs {
            input_ids,
            forced_bos_token_id: tgt,
        })
    }

    /// Frame `text` the way BART expects: `<s> tokens </s>`, keeping at most `max_tokens` ids.
    fn summarization_inputs(
        &self,
        text: &str,
        max_tokens: usize,
    ) -> Result<Vec<u32>, PipelineError> {
        let bos = self.require_token(BOS_TOKEN)?;
        let eos = self.require_token(EOS_TOKEN)?;
        let mut tokens = self.encode(text)?;
        tokens.truncate(max_tokens.saturating_sub(2));

        let mut input_ids = Vec::with_capacity(tokens.len() + 2);
        input_ids.push(bos);
        input_ids.extend(tokens);
        input_ids.push(eos);
        Ok(input_ids)
    }
}
