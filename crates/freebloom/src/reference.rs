//! Reference denoiser
//!
//! A single transformer block over latent pixels: self-attention with
//! key/value capture and injection, cross-attention to a hashed bag-of-words
//! text embedding, and a GELU feed-forward. It is not trained; weights are
//! drawn from a seeded stream so every process builds the same network, or
//! loaded from a burn record file. It exists to drive the animator end to end
//! without a pretrained checkpoint.
//!
//! [`ReferenceDenoiser`] is the burn module used for initialization and record
//! files. Sampling runs on [`ReferenceWeights`], a snapshot of its parameters
//! as plain tensors that frames share across threads.

use std::path::Path;

use burn::module::Param;
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::{gelu, silu};
use burn::tensor::Int;
use freebloom_core::{FrameAttention, FrameAttentionConfig, FrameAttentionWeights, Projection};
use rand::rngs::StdRng;

use crate::error::ModelError;
use crate::model::{ContextKv, DenoisingModel, LayerKv};
use crate::rng::{self, Purpose};

/// Reference denoiser configuration
#[derive(Debug, Clone)]
pub struct ReferenceDenoiserConfig {
    /// Latent channels
    pub channels: usize,
    /// Token width inside the block
    pub dim: usize,
    pub num_heads: usize,
    /// Text embedding width
    pub text_dim: usize,
    /// Hash buckets of the text encoder, bucket 0 is padding
    pub vocab_size: usize,
    /// Tokens per prompt after padding/truncation
    pub text_len: usize,
    /// Weight stream seed
    pub seed: u64,
}

impl Default for ReferenceDenoiserConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            dim: 32,
            num_heads: 4,
            text_dim: 32,
            vocab_size: 1024,
            text_len: 16,
            seed: 0,
        }
    }
}

fn seeded_linear<B: Backend>(
    rng: &mut StdRng,
    d_input: usize,
    d_output: usize,
    bias: bool,
    device: &B::Device,
) -> Linear<B> {
    let mut linear = LinearConfig::new(d_input, d_output).with_bias(bias).init(device);
    linear.weight = Param::from_tensor(seeded_matrix(rng, d_input, d_output, device));
    linear.bias = bias.then(|| Param::from_tensor(seeded_vector(rng, d_input, d_output, device)));
    linear
}

/// Bias of a `d_input → d_output` layer, small relative to its weights
fn seeded_vector<B: Backend>(
    rng: &mut StdRng,
    d_input: usize,
    d_output: usize,
    device: &B::Device,
) -> Tensor<B, 1> {
    let std = 0.1 * (d_input as f32).sqrt().recip();
    let values = rng::normal_values(rng, d_output)
        .into_iter()
        .map(|v| v * std)
        .collect();
    Tensor::from_data(TensorData::new(values, [d_output]), device)
}

fn seeded_matrix<B: Backend>(rng: &mut StdRng, rows: usize, cols: usize, device: &B::Device) -> Tensor<B, 2> {
    let std = (rows as f32).sqrt().recip();
    let values = rng::normal_values(rng, rows * cols)
        .into_iter()
        .map(|v| v * std)
        .collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}

fn seeded_attention<B: Backend>(
    rng: &mut StdRng,
    config: FrameAttentionConfig,
    device: &B::Device,
) -> FrameAttention<B> {
    let inner = config.num_heads * config.head_dim();
    let context = config.context_dim.unwrap_or(config.dim);
    let mut attn = config.init(device);
    attn.to_q = seeded_linear(rng, config.dim, inner, false, device);
    attn.to_k = seeded_linear(rng, context, inner, false, device);
    attn.to_v = seeded_linear(rng, context, inner, false, device);
    attn.to_out = seeded_linear(rng, inner, config.dim, true, device);
    attn
}

impl ReferenceDenoiserConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ReferenceDenoiser<B> {
        let mut rng = rng::stream(self.seed, Purpose::Weights, 0, 0);
        let dim = self.dim;

        let mut token_embedding = EmbeddingConfig::new(self.vocab_size, self.text_dim).init(device);
        token_embedding.weight = Param::from_tensor(
            seeded_matrix(&mut rng, self.vocab_size, self.text_dim, device) * (self.vocab_size as f32).sqrt(),
        );

        ReferenceDenoiser {
            proj_in: seeded_linear(&mut rng, self.channels, dim, true, device),
            time_proj: seeded_linear(&mut rng, dim, dim, true, device),
            norm1: Norm::new(dim, device),
            attn1: seeded_attention(&mut rng, FrameAttentionConfig::new(dim, self.num_heads), device),
            norm2: Norm::new(dim, device),
            attn2: seeded_attention(
                &mut rng,
                FrameAttentionConfig::new(dim, self.num_heads).with_context_dim(self.text_dim),
                device,
            ),
            norm3: Norm::new(dim, device),
            ff_in: seeded_linear(&mut rng, dim, dim * 4, true, device),
            ff_out: seeded_linear(&mut rng, dim * 4, dim, true, device),
            proj_out: seeded_linear(&mut rng, dim, self.channels, true, device),
            token_embedding,
            channels: self.channels,
            dim,
            vocab_size: self.vocab_size,
            text_len: self.text_len,
        }
    }
}

/// Single-block transformer denoiser over latent pixels, as a burn module
#[derive(Module, Debug)]
pub struct ReferenceDenoiser<B: Backend> {
    pub proj_in: Linear<B>,
    pub time_proj: Linear<B>,
    pub norm1: Norm<B>,
    /// Self-attention, the overridable layer
    pub attn1: FrameAttention<B>,
    pub norm2: Norm<B>,
    /// Cross-attention to text
    pub attn2: FrameAttention<B>,
    pub norm3: Norm<B>,
    pub ff_in: Linear<B>,
    pub ff_out: Linear<B>,
    pub proj_out: Linear<B>,
    pub token_embedding: Embedding<B>,
    #[module(skip)]
    channels: usize,
    #[module(skip)]
    dim: usize,
    #[module(skip)]
    vocab_size: usize,
    #[module(skip)]
    text_len: usize,
}

/// Layer normalization over the last dimension with a learned affine
#[derive(Module, Debug)]
pub struct Norm<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
    pub beta: Param<Tensor<B, 1>>,
}

impl<B: Backend> Norm<B> {
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([size], device)),
            beta: Param::from_tensor(Tensor::zeros([size], device)),
        }
    }
}

#[derive(Debug, Clone)]
struct NormWeights<B: Backend> {
    gamma: Tensor<B, 1>,
    beta: Tensor<B, 1>,
}

impl<B: Backend> NormWeights<B> {
    const EPS: f64 = 1e-5;

    fn from_module(norm: &Norm<B>) -> Self {
        Self {
            gamma: norm.gamma.val(),
            beta: norm.beta.val(),
        }
    }

    fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let var = x.clone().var(last_dim);
        let x_norm = (x - mean) / (var + Self::EPS).sqrt();
        x_norm * self.gamma.clone().unsqueeze() + self.beta.clone().unsqueeze()
    }
}

/// FNV-1a hash of a lowercased word
fn hash_word(word: &str) -> u64 {
    word.chars()
        .flat_map(char::to_lowercase)
        .fold(0xcbf2_9ce4_8422_2325u64, |hash, c| {
            let mut buf = [0u8; 4];
            c.encode_utf8(&mut buf)
                .bytes()
                .fold(hash, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3))
        })
}

/// Sinusoidal timestep embedding `[1, dim]`
fn timestep_embedding<B: Backend>(timestep: usize, dim: usize, device: &B::Device) -> Tensor<B, 2> {
    let half = dim / 2;
    let max_period = 10000.0f64;
    let mut values: Vec<f32> = (0..half)
        .map(|i| timestep as f64 * (-(i as f64 / half as f64) * max_period.ln()).exp())
        .flat_map(|arg| [arg.sin() as f32, arg.cos() as f32])
        .collect();
    values.resize(dim, 0.0);
    Tensor::from_data(TensorData::new(values, [1, dim]), device)
}

impl<B: Backend> ReferenceDenoiser<B> {
    /// Snapshot of the current parameters for sampling
    pub fn weights(&self) -> ReferenceWeights<B> {
        ReferenceWeights {
            proj_in: Projection::from_linear(&self.proj_in),
            time_proj: Projection::from_linear(&self.time_proj),
            norm1: NormWeights::from_module(&self.norm1),
            attn1: self.attn1.weights(),
            norm2: NormWeights::from_module(&self.norm2),
            attn2: self.attn2.weights(),
            norm3: NormWeights::from_module(&self.norm3),
            ff_in: Projection::from_linear(&self.ff_in),
            ff_out: Projection::from_linear(&self.ff_out),
            proj_out: Projection::from_linear(&self.proj_out),
            token_embedding: self.token_embedding.weight.val(),
            channels: self.channels,
            dim: self.dim,
            vocab_size: self.vocab_size,
            text_len: self.text_len,
        }
    }

    /// Save weights to a burn record file
    pub fn save(self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.save_file(path.as_ref().to_path_buf(), &recorder)?;
        Ok(())
    }

    /// Replace weights with those of a burn record file
    pub fn load(self, path: impl AsRef<Path>, device: &B::Device) -> Result<Self, ModelError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        Ok(self.load_file(path.as_ref().to_path_buf(), &recorder, device)?)
    }
}

/// Parameters of a [`ReferenceDenoiser`] as plain tensors
#[derive(Debug, Clone)]
pub struct ReferenceWeights<B: Backend> {
    proj_in: Projection<B>,
    time_proj: Projection<B>,
    norm1: NormWeights<B>,
    attn1: FrameAttentionWeights<B>,
    norm2: NormWeights<B>,
    attn2: FrameAttentionWeights<B>,
    norm3: NormWeights<B>,
    ff_in: Projection<B>,
    ff_out: Projection<B>,
    proj_out: Projection<B>,
    /// `[vocab_size, text_dim]`
    token_embedding: Tensor<B, 2>,
    channels: usize,
    dim: usize,
    vocab_size: usize,
    text_len: usize,
}

impl<B: Backend> ReferenceWeights<B> {
    fn device(&self) -> B::Device {
        self.token_embedding.device()
    }

    /// Token ids `[1, text_len]` of a prompt
    pub fn tokenize(&self, prompt: &str) -> Vec<i64> {
        let buckets = (self.vocab_size.max(2) - 1) as u64;
        let mut ids: Vec<i64> = prompt
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| (hash_word(w) % buckets + 1) as i64)
            .take(self.text_len)
            .collect();
        ids.resize(self.text_len, 0);
        ids
    }

    fn check_latent(&self, latent: &Tensor<B, 4>) -> Result<(), ModelError> {
        let [b, c, h, w] = latent.dims();
        if b != 1 || c != self.channels {
            return Err(ModelError::ShapeMismatch {
                expected: vec![1, self.channels, h, w],
                actual: vec![b, c, h, w],
            });
        }
        Ok(())
    }

    /// Latent pixels as tokens `[1, h*w, dim]` with the timestep added
    fn embed(&self, latent: Tensor<B, 4>, timestep: usize) -> Tensor<B, 3> {
        let [b, c, h, w] = latent.dims();
        let tokens = latent.reshape([b, c, h * w]).swap_dims(1, 2);
        let temb = timestep_embedding::<B>(timestep, self.dim, &self.device());
        let temb = silu(self.time_proj.forward(temb)).reshape([1, 1, self.dim]);
        self.proj_in.forward(tokens) + temb
    }
}

impl<B: Backend> DenoisingModel<B> for ReferenceWeights<B> {
    fn latent_channels(&self) -> usize {
        self.channels
    }

    fn encode_text(&self, prompt: &str) -> Result<Tensor<B, 3>, ModelError> {
        let ids = self.tokenize(prompt);
        let ids = Tensor::<B, 1, Int>::from_data(TensorData::new(ids, [self.text_len]), &self.device());
        let [_, text_dim] = self.token_embedding.dims();
        Ok(self
            .token_embedding
            .clone()
            .select(0, ids)
            .reshape([1, self.text_len, text_dim]))
    }

    fn attention_kv(
        &self,
        latent: Tensor<B, 4>,
        timestep: usize,
        _text: &Tensor<B, 3>,
    ) -> Result<LayerKv<B>, ModelError> {
        self.check_latent(&latent)?;
        let x = self.embed(latent, timestep);
        Ok(vec![self.attn1.project_kv(self.norm1.forward(x))])
    }

    fn predict_noise(
        &self,
        latent: Tensor<B, 4>,
        timestep: usize,
        text: &Tensor<B, 3>,
        context_kv_override: Option<&ContextKv<B>>,
    ) -> Result<Tensor<B, 4>, ModelError> {
        self.check_latent(&latent)?;
        let [b, c, h, w] = latent.dims();

        let (context, mode) = match context_kv_override {
            Some(ctx) if ctx.layers.len() != 1 => {
                return Err(ModelError::ShapeMismatch {
                    expected: vec![1],
                    actual: vec![ctx.layers.len()],
                })
            }
            Some(ctx) => (ctx.layers.first(), ctx.mode),
            None => (None, Default::default()),
        };

        let x = self.embed(latent.clone(), timestep);
        let x = x.clone() + self.attn1.forward(self.norm1.forward(x), context, mode).output;
        let x = x.clone() + self.attn2.forward_cross(self.norm2.forward(x), text.clone());
        let x = x.clone() + self.ff_out.forward(gelu(self.ff_in.forward(self.norm3.forward(x))));

        let correction = self.proj_out.forward(x).swap_dims(1, 2).reshape([b, c, h, w]);
        Ok(latent + correction)
    }
}
