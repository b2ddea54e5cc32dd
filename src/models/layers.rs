//! Transformer building blocks shared by the BART-family encoder-decoders.
//!
//! Weight names follow the Hugging Face layout common to BART, mBART and M2M100:
//! `self_attn`, `self_attn_layer_norm`, `encoder_attn`, `encoder_attn_layer_norm`, `fc1`, `fc2`
//! and `final_layer_norm`.

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder, layer_norm, linear};
use serde::Deserialize;

const LAYER_NORM_EPS: f64 = 1e-5;
const MASK_FILL: f64 = -1e9;

/// Feed-forward activation functions found in seq2seq checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Rectified linear unit, used by NLLB.
    #[default]
    Relu,
    /// Exact (erf) GELU, used by BART.
    Gelu,
    /// Tanh approximation of GELU.
    #[serde(rename = "gelu_new")]
    GeluNew,
}

impl Activation {
    fn apply(self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Gelu => xs.gelu_erf(),
            Self::GeluNew => xs.gelu(),
        }
    }
}

/// Where each block normalizes relative to its residual connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum NormPlacement {
    /// Normalize the block input (M2M100, mBART).
    Pre,
    /// Normalize after adding the residual (BART).
    Post,
}

/// Shape of one encoder or decoder stack.
#[derive(Debug, Clone, Copy)]
pub(super) struct StackDims {
    pub(super) d_model: usize,
    pub(super) heads: usize,
    pub(super) ffn_dim: usize,
    pub(super) activation: Activation,
    pub(super) norm: NormPlacement,
}

/// Convert a `1.0`/`0.0` mask of shape `(batch, seq)` into an additive attention bias of shape
/// `(batch, 1, 1, seq)`.
pub(super) fn key_padding_bias(mask: &Tensor) -> Result<Tensor> {
    mask.affine(-MASK_FILL, MASK_FILL)?.unsqueeze(1)?.unsqueeze(1)
}

pub(super) fn causal_bias(len: usize, device: &Device) -> Result<Tensor> {
    let mut bias = vec![0f32; len * len];
    for row in 0..len {
        for col in row + 1..len {
            bias[row * len + col] = MASK_FILL as f32;
        }
    }
    Tensor::from_vec(bias, (1, 1, len, len), device)
}

pub(super) fn norm(dim: usize, vb: VarBuilder) -> Result<LayerNorm> {
    layer_norm(dim, LAYER_NORM_EPS, vb)
}

/// Decoder prefix ids and their padding mask, both `(rows, len)`.
pub(super) fn prefix_tensors(
    sequences: &[Vec<u32>],
    pad_token_id: u32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let rows = sequences.len();
    let len = sequences.first().map(Vec::len).unwrap_or_default();
    let ids: Vec<u32> = sequences.iter().flatten().copied().collect();
    let mask: Vec<f32> = ids
        .iter()
        .map(|&id| if id == pad_token_id { 0.0 } else { 1.0 })
        .collect();
    Ok((
        Tensor::from_vec(ids, (rows, len), device)?,
        Tensor::from_vec(mask, (rows, len), device)?,
    ))
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
}

impl Attention {
    fn new(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
        })
    }

    fn split_heads(&self, xs: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        xs.reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(
        &self,
        hidden: &Tensor,
        key_value: Option<&Tensor>,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, tgt_len, _) = hidden.dims3()?;
        let key_value = key_value.unwrap_or(hidden);
        let src_len = key_value.dim(1)?;

        let q = (self.q_proj.forward(hidden)? * self.scaling)?;
        let q = self.split_heads(&q, batch, tgt_len)?;
        let k = self.split_heads(&self.k_proj.forward(key_value)?, batch, src_len)?;
        let v = self.split_heads(&self.v_proj.forward(key_value)?, batch, src_len)?;

        let weights = q.matmul(&k.t()?)?;
        let weights = match bias {
            Some(bias) => weights.broadcast_add(bias)?,
            None => weights,
        };
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let output = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, tgt_len, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&output)
    }
}

struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl FeedForward {
    fn new(dims: StackDims, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dims.d_model, dims.ffn_dim, vb.pp("fc1"))?,
            fc2: linear(dims.ffn_dim, dims.d_model, vb.pp("fc2"))?,
            activation: dims.activation,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.activation.apply(&self.fc1.forward(xs)?)?;
        self.fc2.forward(&xs)
    }
}

/// Run `block` around a residual connection, normalizing with `ln` before or after.
fn residual<F>(
    hidden: &Tensor,
    ln: &LayerNorm,
    placement: NormPlacement,
    block: F,
) -> Result<Tensor>
where
    F: FnOnce(&Tensor) -> Result<Tensor>,
{
    match placement {
        NormPlacement::Pre => hidden + block(&ln.forward(hidden)?)?,
        NormPlacement::Post => ln.forward(&(hidden + block(hidden)?)?),
    }
}

pub(super) struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
    placement: NormPlacement,
}

impl EncoderLayer {
    pub(super) fn new(dims: StackDims, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(dims.d_model, dims.heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: norm(dims.d_model, vb.pp("self_attn_layer_norm"))?,
            ffn: FeedForward::new(dims, &vb)?,
            final_layer_norm: norm(dims.d_model, vb.pp("final_layer_norm"))?,
            placement: dims.norm,
        })
    }

    pub(super) fn forward(&self, hidden: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let hidden = residual(hidden, &self.self_attn_layer_norm, self.placement, |xs| {
            self.self_attn.forward(xs, None, Some(bias))
        })?;
        residual(&hidden, &self.final_layer_norm, self.placement, |xs| self.ffn.forward(xs))
    }
}

pub(super) struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
    placement: NormPlacement,
}

impl DecoderLayer {
    pub(super) fn new(dims: StackDims, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(dims.d_model, dims.heads, vb.pp("self_attn"))?,
            self_attn_layer_norm: norm(dims.d_model, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::new(dims.d_model, dims.heads, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: norm(dims.d_model, vb.pp("encoder_attn_layer_norm"))?,
            ffn: FeedForward::new(dims, &vb)?,
            final_layer_norm: norm(dims.d_model, vb.pp("final_layer_norm"))?,
            placement: dims.norm,
        })
    }

    pub(super) fn forward(
        &self,
        hidden: &Tensor,
        causal: &Tensor,
        encoder_hidden: &Tensor,
        encoder_bias: &Tensor,
    ) -> Result<Tensor> {
        let hidden = residual(hidden, &self.self_attn_layer_norm, self.placement, |xs| {
            self.self_attn.forward(xs, None, Some(causal))
        })?;
        let hidden = residual(&hidden, &self.encoder_attn_layer_norm, self.placement, |xs| {
            self.encoder_attn
                .forward(xs, Some(encoder_hidden), Some(encoder_bias))
        })?;
        residual(&hidden, &self.final_layer_norm, self.placement, |xs| self.ffn.forward(xs))
    }
}

/// Build `count` layers under `vb.pp("layers.{i}")`.
pub(super) fn stack<T>(
    count: usize,
    vb: &VarBuilder,
    build: impl Fn(VarBuilder) -> Result<T>,
) -> Result<Vec<T>> {
    (0..count)
        .map(|i| build(vb.pp(format!("layers.{i}"))))
        .collect()
}
