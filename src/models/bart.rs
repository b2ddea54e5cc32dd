//! BART encoder-decoder used for abstractive summarization.
//!
//! Weight names follow the Hugging Face `BartForConditionalGeneration` layout. Positions come
//! from a learned table offset by two rows, embeddings are normalized before the first layer and
//! the output projection is tied to the shared token embedding plus an optional per-token bias.

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

/// Hyperparameters read from a BART checkpoint's `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct BartConfig {
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
    #[serde(default)]
    pub scale_embedding: bool,
    /// Feed-forward activation.
    #[serde(default = "default_activation")]
    pub activation_function: Activation,
    /// Padding token id.
    #[serde(default = "default_pad_token_id")]
    pub pad_token_id: u32,
    /// Beginning-of-sequence token id.
    #[serde(default)]
    pub bos_token_id: u32,
    /// End-of-sequence token id.
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    /// First token fed to the decoder.
    #[serde(default = "default_eos_token_id")]
    pub decoder_start_token_id: u32,
    /// Token the checkpoint always emits first.
    #[serde(default)]
    pub forced_bos_token_id: Option<u32>,
    /// Token the checkpoint emits when a row hits the length limit.
    #[serde(default)]
    pub forced_eos_token_id: Option<u32>,
    /// Pre-norm layers (mBART) instead of post-norm ones.
    #[serde(default)]
    pub normalize_before: bool,
    /// Whether each stack ends with an extra `layer_norm`.
    #[serde(default)]
    pub add_final_layer_norm: bool,
}

fn default_max_position_embeddings() -> usize {
    1024
}

fn default_activation() -> Activation {
    Activation::Gelu
}

fn default_pad_token_id() -> u32 {
    1
}

fn default_eos_token_id() -> u32 {
    2
}

impl BartConfig {
    fn encoder_dims(&self) -> StackDims {
        StackDims {
            d_model: self.d_model,
            heads: self.encoder_attention_heads,
            ffn_dim: self.encoder_ffn_dim,
            activation: self.activation_function,
            norm: if self.normalize_before {
                NormPlacement::Pre
            } else {
                NormPlacement::Post
            },
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

/// Learned position table; position `i` is stored at row `i + 2`.
struct LearnedPositions {
    table: Embedding,
}

impl LearnedPositions {
    fn new(max_positions: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            table: embedding(max_positions + POSITION_OFFSET, dim, vb)?,
        })
    }

    /// Embeddings for positions `0..len`, shape `(len, dim)`.
    fn forward(&self, len: usize, device: &Device) -> Result<Tensor> {
        let rows = self.table.embeddings().dim(0)?;
        if len + POSITION_OFFSET > rows {
            candle_core::bail!(
                "sequence of {len} tokens exceeds the {} supported positions",
                rows - POSITION_OFFSET
            );
        }
        let start = POSITION_OFFSET as u32;
        let ids = Tensor::arange(start, start + len as u32, device)?;
        self.table.forward(&ids)
    }
}

struct Stack<L> {
    positions: LearnedPositions,
    layernorm_embedding: LayerNorm,
    layers: Vec<L>,
    layer_norm: Option<LayerNorm>,
}

impl<L> Stack<L> {
    fn new(
        config: &BartConfig,
        count: usize,
        vb: VarBuilder,
        build: impl Fn(VarBuilder) -> Result<L>,
    ) -> Result<Self> {
        let layer_norm = if config.add_final_layer_norm {
            Some(norm(config.d_model, vb.pp("layer_norm"))?)
        } else {
            None
        };
        Ok(Self {
            positions: LearnedPositions::new(
                config.max_position_embeddings,
                config.d_model,
                vb.pp("embed_positions"),
            )?,
            layernorm_embedding: norm(config.d_model, vb.pp("layernorm_embedding"))?,
            layers: stack(count, &vb, build)?,
            layer_norm,
        })
    }

    /// Add positions to `(batch, len, dim)` token embeddings and normalize them.
    fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        let positions = self.positions.forward(tokens.dim(1)?, tokens.device())?;
        self.layernorm_embedding
            .forward(&tokens.broadcast_add(&positions)?)
    }

    fn finish(&self, hidden: Tensor) -> Result<Tensor> {
        match &self.layer_norm {
            Some(layer_norm) => layer_norm.forward(&hidden),
            None => Ok(hidden),
        }
    }
}

/// BART conditional-generation model.
pub struct BartModel {
    shared: Embedding,
    encoder: Stack<EncoderLayer>,
    decoder: Stack<DecoderLayer>,
    lm_head: Linear,
    final_logits_bias: Option<Tensor>,
    embed_scale: f64,
    config: BartConfig,
    device: Device,
}

impl BartModel {
    /// Build the model from weights exposed by `vb`.
    pub fn new(config: &BartConfig, vb: VarBuilder) -> Result<Self> {
        let shared_prefix = if vb.contains_tensor("model.shared.weight") {
            "model.shared"
        } else {
            "model.encoder.embed_tokens"
        };
        let shared = embedding(config.vocab_size, config.d_model, vb.pp(shared_prefix))?;
        let lm_head = Linear::new(shared.embeddings().clone(), None);
        let final_logits_bias = if vb.contains_tensor("final_logits_bias") {
            Some(vb.get((1, config.vocab_size), "final_logits_bias")?)
        } else {
            None
        };
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
            final_logits_bias,
            embed_scale,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    fn embed_tokens(&self, ids: &Tensor) -> Result<Tensor> {
        self.shared.forward(ids)? * self.embed_scale
    }
}

impl DecodingModel for BartModel {
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
        let mut hidden = self.encoder.embed(&self.embed_tokens(input_ids)?)?;
        let bias = key_padding_bias(attention_mask)?;
        for layer in &self.encoder.layers {
            hidden = layer.forward(&hidden, &bias)?;
        }
        self.encoder.finish(hidden)
    }

    fn next_token_logits(
        &self,
        sequences: &[Vec<u32>],
        encoder_hidden: &Tensor,
        encoder_bias: &Tensor,
    ) -> Result<Tensor> {
        let (ids, _) = prefix_tensors(sequences, self.config.pad_token_id, &self.device)?;
        let len = ids.dim(1)?;

        let mut hidden = self.decoder.embed(&self.embed_tokens(&ids)?)?;
        let causal = causal_bias(len, &self.device)?;
        for layer in &self.decoder.layers {
            hidden = layer.forward(&hidden, &causal, encoder_hidden, encoder_bias)?;
        }
        let hidden = self.decoder.finish(hidden)?;
        let last = hidden.i((.., len - 1))?.contiguous()?;
        let logits = self.lm_head.forward(&last)?;
        let logits = match &self.final_logits_bias {
            Some(bias) => logits.broadcast_add(bias)?,
            None => logits,
        };
        logits.to_dtype(DType::F32)
    }
}

impl CheckpointModel for BartModel {
    type Config = BartConfig;

    fn from_checkpoint(config: &BartConfig, vb: VarBuilder) -> Result<Self> {
        Self::new(config, vb)
    }
}

impl Seq2SeqModel for BartModel {
    fn generate(&self, batch: &EncodedBatch, options: &GenerateOptions) -> Result<Tensor> {
        if batch.batch_size() == 0 {
            return Tensor::zeros((0, 0), DType::U32, &self.device);
        }
        let options = GenerateOptions {
            forced_bos_token_id: options
                .forced_bos_token_id
                .or(self.config.forced_bos_token_id),
            forced_eos_token_id: options
                .forced_eos_token_id
                .or(self.config.forced_eos_token_id),
            ..options.clone()
        };
        generation::generate(self, batch, &options)
    }
}
