//! Interfaces to the frozen diffusion model
//!
//! The animator never reaches into a model's internals. A conforming model
//! exposes its attention keys/values through [`DenoisingModel::attention_kv`]
//! and accepts injected ones through the `context_kv_override` argument of
//! [`DenoisingModel::predict_noise`]; that is the whole extension point.

use burn::prelude::*;
use freebloom_core::{FrameKv, KvMode};

pub use crate::error::ModelError;

/// Keys/values of every overridable attention layer, in layer order
pub type LayerKv<B> = Vec<FrameKv<B>>;

/// Keys/values injected into a frame's attention layers
#[derive(Debug, Clone)]
pub struct ContextKv<B: Backend> {
    /// One entry per attention layer, same order as [`LayerKv`]
    pub layers: Vec<FrameKv<B>>,
    pub mode: KvMode,
}

impl<B: Backend> ContextKv<B> {
    /// Concatenate the captured keys/values of several frames layer by layer
    ///
    /// Returns `None` when there are no sources, or `ModelError::ShapeMismatch`
    /// when the sources disagree on the number of layers.
    pub fn from_sources(sources: &[&LayerKv<B>], mode: KvMode) -> Result<Option<Self>, ModelError> {
        let Some(first) = sources.first() else {
            return Ok(None);
        };
        let num_layers = first.len();
        if let Some(bad) = sources.iter().find(|s| s.len() != num_layers) {
            return Err(ModelError::ShapeMismatch {
                expected: vec![num_layers],
                actual: vec![bad.len()],
            });
        }

        let layers = (0..num_layers)
            .filter_map(|layer| {
                let parts: Vec<&FrameKv<B>> = sources.iter().map(|s| &s[layer]).collect();
                FrameKv::concat(&parts)
            })
            .collect();

        Ok(Some(Self { layers, mode }))
    }
}

/// A frozen noise-prediction network
///
/// Implementations must be pure: the same inputs give the same outputs, and no
/// call mutates shared state visible to another call.
pub trait DenoisingModel<B: Backend>: Send + Sync {
    /// Latent channel count the network expects
    fn latent_channels(&self) -> usize;

    /// Text embedding `[1, tokens, dim]` for a prompt
    fn encode_text(&self, prompt: &str) -> Result<Tensor<B, 3>, ModelError>;

    /// Keys/values the frame's own attention layers would compute
    fn attention_kv(
        &self,
        latent: Tensor<B, 4>,
        timestep: usize,
        text: &Tensor<B, 3>,
    ) -> Result<LayerKv<B>, ModelError>;

    /// Predicted noise for `latent` at `timestep`
    fn predict_noise(
        &self,
        latent: Tensor<B, 4>,
        timestep: usize,
        text: &Tensor<B, 3>,
        context_kv_override: Option<&ContextKv<B>>,
    ) -> Result<Tensor<B, 4>, ModelError>;
}

/// Maps a finished latent `[1, C, h, w]` to an RGB image `[1, 3, H, W]` in `[0, 1]`
pub trait FrameDecoder<B: Backend>: Send + Sync {
    fn decode(&self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>, ModelError>;
}
