//! Cross-Frame Attention
//!
//! An image diffusion model has no notion of time: each frame's self-attention
//! only sees tokens of that frame. This module provides an attention layer whose
//! keys and values can be captured from one frame and injected into another,
//! so a frozen network can be made to look at anchor or neighbouring frames
//! without retraining.
//!
//! # Data flow
//!
//! 1. For every frame that other frames read, call [`FrameAttention::project_kv`]
//!    to capture its keys/values (`[batch, heads, seq, head_dim]`).
//! 2. Concatenate the captured keys/values of the frames a target frame may
//!    read with [`FrameKv::concat`].
//! 3. Run [`FrameAttention::forward`] on the target frame with that context.
//!    [`KvMode::Augment`] appends the context after the frame's own keys/values,
//!    [`KvMode::Replace`] attends to the context alone.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::attention::{merge_heads, qkv_attention, split_heads};

/// How injected keys/values combine with a frame's own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KvMode {
    /// Attend to own tokens followed by the context tokens
    #[default]
    Augment,
    /// Attend to the context tokens only
    Replace,
}

/// Keys and values of one attention layer, `[batch, heads, seq, head_dim]`
#[derive(Debug, Clone)]
pub struct FrameKv<B: Backend> {
    pub key: Tensor<B, 4>,
    pub value: Tensor<B, 4>,
}

impl<B: Backend> FrameKv<B> {
    pub fn new(key: Tensor<B, 4>, value: Tensor<B, 4>) -> Self {
        Self { key, value }
    }

    /// Number of tokens along the sequence axis
    pub fn seq_len(&self) -> usize {
        self.key.dims()[2]
    }

    /// Concatenate several key/value sets along the sequence axis
    ///
    /// Returns `None` for an empty slice.
    pub fn concat(parts: &[&FrameKv<B>]) -> Option<FrameKv<B>> {
        match parts {
            [] => None,
            [single] => Some((*single).clone()),
            _ => {
                let keys = parts.iter().map(|kv| kv.key.clone()).collect();
                let values = parts.iter().map(|kv| kv.value.clone()).collect();
                Some(FrameKv {
                    key: Tensor::cat(keys, 2),
                    value: Tensor::cat(values, 2),
                })
            }
        }
    }
}

/// Configuration for [`FrameAttention`]
#[derive(Debug, Clone)]
pub struct FrameAttentionConfig {
    /// Query (token) dimension
    pub dim: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Head dimension (dim / num_heads if not specified)
    pub head_dim: Option<usize>,
    /// Key/value source dimension for cross-attention (None = self-attention)
    pub context_dim: Option<usize>,
}

impl FrameAttentionConfig {
    pub fn new(dim: usize, num_heads: usize) -> Self {
        Self {
            dim,
            num_heads,
            head_dim: None,
            context_dim: None,
        }
    }

    pub fn with_context_dim(mut self, context_dim: usize) -> Self {
        self.context_dim = Some(context_dim);
        self
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim.unwrap_or(self.dim / self.num_heads)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> FrameAttention<B> {
        let head_dim = self.head_dim();
        let inner_dim = self.num_heads * head_dim;
        let context_dim = self.context_dim.unwrap_or(self.dim);

        FrameAttention {
            to_q: LinearConfig::new(self.dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_k: LinearConfig::new(context_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_v: LinearConfig::new(context_dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_out: LinearConfig::new(inner_dim, self.dim).init(device),
            num_heads: self.num_heads,
            head_dim,
        }
    }
}

/// Attention layer with key/value capture and injection
#[derive(Module, Debug)]
pub struct FrameAttention<B: Backend> {
    pub to_q: Linear<B>,
    pub to_k: Linear<B>,
    pub to_v: Linear<B>,
    pub to_out: Linear<B>,
    #[module(skip)]
    pub num_heads: usize,
    #[module(skip)]
    pub head_dim: usize,
}

/// Output of a self-attention pass together with the frame's own keys/values
pub struct FrameAttentionOutput<B: Backend> {
    pub output: Tensor<B, 3>,
    pub kv: FrameKv<B>,
}

/// Materialized weights of a linear layer, `weight` is `[d_input, d_output]`
///
/// Holds plain tensors only, so it can be shared across threads by reference.
#[derive(Debug, Clone)]
pub struct Projection<B: Backend> {
    pub weight: Tensor<B, 2>,
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> Projection<B> {
    pub fn from_linear(linear: &Linear<B>) -> Self {
        Self {
            weight: linear.weight.val(),
            bias: linear.bias.as_ref().map(|bias| bias.val()),
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let out = x.matmul(self.weight.clone().unsqueeze());
        match &self.bias {
            Some(bias) => out + bias.clone().unsqueeze(),
            None => out,
        }
    }
}

/// Materialized weights of a [`FrameAttention`] layer
#[derive(Debug, Clone)]
pub struct FrameAttentionWeights<B: Backend> {
    pub to_q: Projection<B>,
    pub to_k: Projection<B>,
    pub to_v: Projection<B>,
    pub to_out: Projection<B>,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl<B: Backend> FrameAttentionWeights<B> {
    /// Project `[batch, seq, context_dim]` tokens to keys/values
    pub fn project_kv(&self, x: Tensor<B, 3>) -> FrameKv<B> {
        let k = self.to_k.forward(x.clone());
        let v = self.to_v.forward(x);
        FrameKv {
            key: split_heads(k, self.num_heads, self.head_dim),
            value: split_heads(v, self.num_heads, self.head_dim),
        }
    }

    /// Self-attention with optional injected context
    ///
    /// Input/output shape: `[batch, seq, dim]`. The context sequence length may
    /// differ from the input's; its batch size must match.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<&FrameKv<B>>,
        mode: KvMode,
    ) -> FrameAttentionOutput<B> {
        let q = split_heads(self.to_q.forward(x.clone()), self.num_heads, self.head_dim);
        let own = self.project_kv(x);

        let (k, v) = match (context, mode) {
            (None, _) => (own.key.clone(), own.value.clone()),
            (Some(ctx), KvMode::Augment) => (
                Tensor::cat(vec![own.key.clone(), ctx.key.clone()], 2),
                Tensor::cat(vec![own.value.clone(), ctx.value.clone()], 2),
            ),
            (Some(ctx), KvMode::Replace) => (ctx.key.clone(), ctx.value.clone()),
        };

        let out = merge_heads(qkv_attention(q, k, v));

        FrameAttentionOutput {
            output: self.to_out.forward(out),
            kv: own,
        }
    }

    /// Cross-attention from tokens `x` to a conditioning sequence (e.g. text)
    pub fn forward_cross(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let q = split_heads(self.to_q.forward(x), self.num_heads, self.head_dim);
        let kv = self.project_kv(context);
        let out = merge_heads(qkv_attention(q, kv.key, kv.value));
        self.to_out.forward(out)
    }
}

impl<B: Backend> FrameAttention<B> {
    /// Snapshot of the current parameter values
    pub fn weights(&self) -> FrameAttentionWeights<B> {
        FrameAttentionWeights {
            to_q: Projection::from_linear(&self.to_q),
            to_k: Projection::from_linear(&self.to_k),
            to_v: Projection::from_linear(&self.to_v),
            to_out: Projection::from_linear(&self.to_out),
            num_heads: self.num_heads,
            head_dim: self.head_dim,
        }
    }

    pub fn project_kv(&self, x: Tensor<B, 3>) -> FrameKv<B> {
        self.weights().project_kv(x)
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<&FrameKv<B>>,
        mode: KvMode,
    ) -> FrameAttentionOutput<B> {
        self.weights().forward(x, context, mode)
    }

    pub fn forward_cross(&self, x: Tensor<B, 3>, context: Tensor<B, 3>) -> Tensor<B, 3> {
        self.weights().forward_cross(x, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn max_abs_diff(a: Tensor<TestBackend, 3>, b: Tensor<TestBackend, 3>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_config_head_dim() {
        let config = FrameAttentionConfig::new(64, 4);
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.context_dim, None);
    }

    #[test]
    fn test_forward_without_context_keeps_shape() {
        let device = Default::default();
        let attn = FrameAttentionConfig::new(32, 4).init::<TestBackend>(&device);

        let x = Tensor::random([1, 16, 32], Distribution::Normal(0.0, 1.0), &device);
        let out = attn.forward(x, None, KvMode::Augment);

        assert_eq!(out.output.dims(), [1, 16, 32]);
        assert_eq!(out.kv.key.dims(), [1, 4, 16, 8]);
    }

    #[test]
    fn test_augment_extends_keys_and_changes_output() {
        let device = Default::default();
        let attn = FrameAttentionConfig::new(32, 4).init::<TestBackend>(&device);

        let frame = Tensor::random([1, 16, 32], Distribution::Normal(0.0, 1.0), &device);
        let anchor = Tensor::random([1, 16, 32], Distribution::Normal(0.0, 1.0), &device);

        let anchor_kv = attn.project_kv(anchor);
        let plain = attn.forward(frame.clone(), None, KvMode::Augment).output;
        let linked = attn.forward(frame, Some(&anchor_kv), KvMode::Augment).output;

        assert_eq!(linked.dims(), [1, 16, 32]);
        assert!(max_abs_diff(plain, linked) > 1e-6);
    }

    #[test]
    fn test_replace_with_own_kv_matches_plain_attention() {
        let device = Default::default();
        let attn = FrameAttentionConfig::new(32, 4).init::<TestBackend>(&device);

        let frame = Tensor::random([1, 9, 32], Distribution::Normal(0.0, 1.0), &device);
        let own_kv = attn.project_kv(frame.clone());

        let plain = attn.forward(frame.clone(), None, KvMode::Replace).output;
        let replaced = attn.forward(frame, Some(&own_kv), KvMode::Replace).output;

        assert!(max_abs_diff(plain, replaced) < 1e-5);
    }

    #[test]
    fn test_concat_along_sequence() {
        let device = Default::default();
        let a = FrameKv::<TestBackend>::new(
            Tensor::zeros([1, 2, 3, 4], &device),
            Tensor::zeros([1, 2, 3, 4], &device),
        );
        let b = FrameKv::<TestBackend>::new(
            Tensor::ones([1, 2, 5, 4], &device),
            Tensor::ones([1, 2, 5, 4], &device),
        );

        assert!(FrameKv::<TestBackend>::concat(&[]).is_none());
        let joined = FrameKv::concat(&[&a, &b]).unwrap();
        assert_eq!(joined.seq_len(), 8);
        assert_eq!(joined.value.dims(), [1, 2, 8, 4]);
    }

    #[test]
    fn test_cross_attention_with_text_context() {
        let device = Default::default();
        let attn = FrameAttentionConfig::new(32, 4)
            .with_context_dim(24)
            .init::<TestBackend>(&device);

        let x = Tensor::zeros([1, 16, 32], &device);
        let text = Tensor::ones([1, 7, 24], &device);
        assert_eq!(attn.forward_cross(x, text).dims(), [1, 16, 32]);
    }

    #[test]
    fn test_weights_match_module() {
        let device = Default::default();
        let attn = FrameAttentionConfig::new(32, 4).init::<TestBackend>(&device);
        let weights = attn.weights();

        let x = Tensor::random([1, 6, 32], Distribution::Normal(0.0, 1.0), &device);
        let from_module = attn.to_out.forward(x.clone());
        let from_weights = weights.to_out.forward(x.clone());
        assert!(max_abs_diff(from_module, from_weights) < 1e-5);

        let a = attn.forward(x.clone(), None, KvMode::Augment).output;
        let b = weights.forward(x, None, KvMode::Augment).output;
        assert_eq!(max_abs_diff(a, b), 0.0);
    }

    #[test]
    fn test_weights_are_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FrameAttentionWeights<TestBackend>>();
    }
}
