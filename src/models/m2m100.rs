//! M2M100 encoder-decoder, the architecture behind the NLLB-200 checkpoints.
//!
//! Weight names follow the Hugging Face `M2M100ForConditionalGeneration` layout. Layers are
//! pre-norm, positions are fixed sinusoids offset past the padding index, and the output
//! projection is tied to the shared token embedding.

use candle_core::{DType, Device, IndexOp, Module, Result, Tensor};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder, embedding};
use serde::Deserialize;

use super::generation::{self, DecodingModel, SpecialTokens};
use super::layers::{
    Activation, DecoderLayer, EncoderLayer, NormPlacement, StackDims, causal_bias,
    key_padding_bias, norm, prefix_tensors, stack,
};
use super::{CheckpointModel, EncodedBatch, GenerateOptions, Seq2SeqModel};

const POSITION_OFFSET: usize = 2;

/// Hyperparameters read from a checkpoint's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct M2M100Config {
    /// Vocabulary size of the shared embedding.
    pub vocab_size: usize,
    /// Hidden size.
    pub d_model: usize,
    /// Number of encoder layers.
    pub encoder_layers: usize,
    /// Number of decoder layers.
    pub decoder_layers: usize,
    /// Attention heads per encoder layer.
    pub encoder_attention_heads: usize,
    /// Attention heads per decoder layer.
    pub decoder_attention_heads: usize,
    /// Encoder feed-forward width.
    pub encoder_ffn_dim: usize,
    /// Decoder feed-forward width.
    pub decoder_ffn_dim: usize,
    /// Longest sequence the position table covers.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Whether token embeddings are multiplied by `sqrt(d_model)`.
    #[serde(default = "default_scale_embedding")]
    pub scale_embedding: bool,
    /// Feed-forward activation.
    #[serde(default)]
    pub activation_function: Activation,
    /// Padding token id.
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
    /// End-of-sequence token id.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    /// First token fed to the decoder.
    #[serde(default = "default_eos_token_id")]
    pub decoder_start_token_id: u32,
}

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_scale_embedding() -> bool {
    true
}

fn default_pad_token_id() -> u32 {
    1
}

fn default_eos_token_id() -> u32 {
    2
}

impl M2M100Config {
    fn encoder_dims(&self) -> StackDims {
        StackDims {
            d_model: self.d_model,
            heads: self.encoder_attention_heads,
            ffn_dim: self.encoder_ffn_dim,
            activation: self.activation_function,
            norm: NormPlacement::Pre,
        }
    }

    fn decoder_dims(&self) -> StackDims {
        StackDims {
            heads: self.decoder_attention_heads,
            ffn_dim: self.decoder_ffn_dim,
            ..self.encoder_dims()
        }
    }
}

/// Fixed sinusoidal position table whose padding row is all zeros.
struct SinusoidalPositions {
    table: Tensor,
    dim: usize,
    padding_idx: usize,
}

impl SinusoidalPositions {
    fn new(max_positions: usize, dim: usize, padding_idx: usize, device: &Device) -> Result<Self> {
        let num_positions = max_positions + POSITION_OFFSET;
        let half_dim = dim / 2;
        let scale = 10_000f64.ln() / half_dim.saturating_sub(1).max(1) as f64;
        let freqs: Vec<f32> = (0..half_dim)
            .map(|i| (-(i as f64) * scale).exp() as f32)
            .collect();

        let mut table = vec![0f32; num_positions * dim];
        for (position, row) in table.chunks_exact_mut(dim).enumerate() {
            if position == padding_idx {
                continue;
            }
            for (i, freq) in freqs.iter().enumerate() {
                let angle = position as f32 * freq;
                row[i] = angle.sin();
                row[half_dim + i] = angle.cos();
            }
        }
        Ok(Self {
            table: Tensor::from_vec(table, (num_positions, dim), device)?,
            dim,
            padding_idx,
        })
    }

    /// Look up embeddings for a `(batch, seq)` mask. Real tokens count up from
    /// `padding_idx + 1`; padding maps to the zero row.
    fn forward(&self, mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = mask.dims2()?;
        let rows = self.table.dim(0)?;
        if seq_len + self.padding_idx >= rows {
            candle_core::bail!(
                "sequence of {seq_len} tokens exceeds the {} supported positions",
                rows - self.padding_idx - 1
            );
        }
        let ids = mask
            .cumsum(1)?
            .mul(mask)?
            .affine(1.0, self.padding_idx as f64)?
            .to_dtype(DType::U32)?
            .flatten_all()?;
        self.table
            .index_select(&ids, 0)?
            .reshape((batch, seq_len, self.dim))
    }
}

struct Stack<L> {
    positions: SinusoidalPositions,
    layers: Vec<L>,
    layer_norm: LayerNorm,
}

impl<L> Stack<L> {
    fn new(
        config: &M2M100Config,
        count: usize,
        vb: VarBuilder,
        build: impl Fn(VarBuilder) -> Result<L>,
    ) -> Result<Self> {
        Ok(Self {
            positions: SinusoidalPositions::new(
                config.max_position_embeddings,
                config.d_model,
                config.pad_token_id as usize,
                vb.device(),
            )?,
            layers: stack(count, &vb, build)?,
            layer_norm: norm(config.d_model, vb.pp("layer_norm"))?,
        })
    }
}

/// M2M100 conditional-generation model.
pub struct M2M100Model {
    shared: Embedding,
    encoder: Stack<EncoderLayer>,
    decoder: Stack<DecoderLayer>,
    lm_head: Linear,
    embed_scale: f64,
    config: M2M100Config,
    device: Device,
}

impl M2M100Model {
    /// Build the model from weights exposed by `vb`.
    pub fn new(config: &M2M100Config, vb: VarBuilder) -> Result<Self> {
        let shared_prefix = if vb.contains_tensor("model.shared.weight") {
            "model.shared"
        } else {
            "model.encoder.embed_tokens"
        };
        let shared = embedding(config.vocab_size, config.d_model, vb.pp(shared_prefix))?;
        let lm_head = Linear::new(shared.embeddings().clone(), None);
        let embed_scale = if config.scale_embedding {
            (config.d_model as f64).sqrt()
        } else {
            1.0
        };

        let (encoder_dims, decoder_dims) = (config.encoder_dims(), config.decoder_dims());
        Ok(Self {
            encoder: Stack::new(
                config,
                config.encoder_layers,
                vb.pp("model.encoder"),
                |vb| EncoderLayer::new(encoder_dims, vb),
            )?,
            decoder: Stack::new(
                config,
                config.decoder_layers,
                vb.pp("model.decoder"),
                |vb| DecoderLayer::new(decoder_dims, vb),
            )?,
            shared,
            lm_head,
            embed_scale,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        self.shared.forward(ids)? * self.embed_scale
    }
}

impl DecodingModel for M2M100Model {
    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            decoder_start: self.config.decoder_start_token_id,
            pad: self.config.pad_token_id,
            eos: self.config.eos_token_id,
        }
    }

    fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let positions = self.encoder.positions.forward(attention_mask)?;
        let mut hidden = (self.embed(input_ids)? + positions)?;
        let bias = key_padding_bias(attention_mask)?;
        for layer in &self.encoder.layers {
            hidden = layer.forward(&hidden, &bias)?;
        }
        self.encoder.layer_norm.forward(&hidden)
    }

    fn next_token_logits(
        &self,
        sequences: &[Vec<u32>],
        encoder_hidden: &Tensor,
        encoder_bias: &Tensor,
    ) -> Result<Tensor> {
        let (ids, mask) = prefix_tensors(sequences, self.config.pad_token_id, &self.device)?;
        let len = ids.dim(1)?;

        let positions = self.decoder.positions.forward(&mask)?;
        let mut hidden = (self.embed(&ids)? + positions)?;
        let causal = causal_bias(len, &self.device)?;
        for layer in &self.decoder.layers {
            hidden = layer.forward(&hidden, &causal, encoder_hidden, encoder_bias)?;
        }
        let hidden = self.decoder.layer_norm.forward(&hidden)?;
        let last = hidden.i((.., len - 1))?.contiguous()?;
        self.lm_head.forward(&last)?.to_dtype(DType::F32)
    }
}

impl CheckpointModel for M2M100Model {
    type Config = M2M100Config;

    fn from_checkpoint(config: &M2M100Config, vb: VarBuilder) -> Result<Self> {
        Self::new(config, vb)
    }
}

impl Seq2SeqModel for M2M100Model {
    fn generate(&self, batch: &EncodedBatch, options: &GenerateOptions) -> Result<Tensor> {
        if batch.batch_size() == 0 {
            return Tensor::zeros((0, 0), DType::U32, &self.device);
        }
        generation::generate(self, batch, options)
    }
}

#[cfg(test)]
pub(super) fn tiny_config() -> M2M100Config {
    M2M100Config {
        vocab_size: 16,
        d_model: 8,
        encoder_layers: 1,
        decoder_layers: 1,
        encoder_attention_heads: 2,
        decoder_attention_heads: 2,
        encoder_ffn_dim: 16,
        decoder_ffn_dim: 16,
        max_position_embeddings: 32,
        scale_embedding: true,
        activation_function: Activation::Relu,
        pad_token_id: 1,
        eos_token_id: 2,
        decoder_start_token_id: 2,
    }
}
