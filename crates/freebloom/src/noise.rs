//! Correlated initial noise across frames
//!
//! Frames that start from related noise tend to denoise into related images.
//! [`NoiseInitializer`] draws one seed per frame under a [`NoiseSharing`]
//! policy:
//!
//! - **independent**: unrelated draws, the baseline
//! - **shared-base**: `sqrt(1-ε)·base + sqrt(ε)·residual_i`
//! - **mixed**: shared-base mixing for selected channels or the low-frequency
//!   band, independent noise everywhere else
//!
//! All variants keep unit variance per element.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::AnimatorConfig;
use crate::error::{AnimateError, ConfigError};
use crate::rng::{self, Purpose};

/// Noise sharing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseSharing {
    Independent,
    #[default]
    SharedBase,
    Mixed,
}

/// Components that share the base noise under [`NoiseSharing::Mixed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MixedSplit {
    /// Listed latent channels are shared, the others independent
    Channels(Vec<usize>),
    /// Block averages over `factor × factor` patches are shared, the residual
    /// detail is independent
    LowFrequency { factor: usize },
}

impl Default for MixedSplit {
    fn default() -> Self {
        MixedSplit::LowFrequency { factor: 2 }
    }
}

impl MixedSplit {
    pub fn validate(&self, shape: LatentShape) -> Result<(), ConfigError> {
        match self {
            MixedSplit::Channels(channels) => {
                if channels.is_empty() {
                    return Err(ConfigError::InvalidMixedSplit("no shared channels".into()));
                }
                if let Some(&c) = channels.iter().find(|&&c| c >= shape.channels) {
                    return Err(ConfigError::InvalidMixedSplit(format!(
                        "channel {c} out of range for {} latent channels",
                        shape.channels
                    )));
                }
                Ok(())
            }
            MixedSplit::LowFrequency { factor } => {
                if *factor == 0 || shape.height % factor != 0 || shape.width % factor != 0 {
                    return Err(ConfigError::InvalidMixedSplit(format!(
                        "pooling factor {factor} does not divide {}x{}",
                        shape.height, shape.width
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Shape of one frame's latent, without the batch axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl LatentShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Tensor dims `[1, channels, height, width]`
    pub fn dims(&self) -> [usize; 4] {
        [1, self.channels, self.height, self.width]
    }
}

/// Initial noise of one frame, fixed once drawn
#[derive(Debug, Clone)]
pub struct NoiseSeed<B: Backend> {
    frame: usize,
    tensor: Tensor<B, 4>,
}

impl<B: Backend> NoiseSeed<B> {
    pub fn new(frame: usize, tensor: Tensor<B, 4>) -> Self {
        Self { frame, tensor }
    }

    /// Global frame index this seed was drawn for
    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn tensor(&self) -> &Tensor<B, 4> {
        &self.tensor
    }
}

/// Draws correlated per-frame noise
#[derive(Debug, Clone)]
pub struct NoiseInitializer {
    policy: NoiseSharing,
    epsilon: f32,
    split: MixedSplit,
    seed: u64,
}

impl NoiseInitializer {
    pub fn new(policy: NoiseSharing, epsilon: f32, seed: u64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&epsilon) {
            return Err(ConfigError::EpsilonOutOfRange(epsilon));
        }
        Ok(Self {
            policy,
            epsilon,
            split: MixedSplit::default(),
            seed,
        })
    }

    pub fn with_split(mut self, split: MixedSplit) -> Self {
        self.split = split;
        self
    }

    pub fn from_config(config: &AnimatorConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.noise_sharing, config.epsilon, config.seed)?
            .with_split(config.mixed_split.clone()))
    }

    pub fn policy(&self) -> NoiseSharing {
        self.policy
    }

    /// Draw the base noise of `batch`
    pub fn base<B: Backend>(&self, shape: LatentShape, batch: usize, device: &B::Device) -> Tensor<B, 4> {
        let mut rng = rng::stream(self.seed, Purpose::Base, batch as u64, 0);
        rng::gaussian(&mut rng, shape.dims(), device)
    }

    /// Seeds for frames `0..frames` of a standalone batch
    pub fn generate<B: Backend>(
        &self,
        frames: usize,
        shape: LatentShape,
        device: &B::Device,
    ) -> Result<Vec<NoiseSeed<B>>, AnimateError> {
        self.generate_with_base(0, frames, shape, None, 0, device)
    }

    /// Seeds for global frames `first_frame..first_frame + frames` of `batch`
    ///
    /// `base` replaces the batch's own base draw; chained batches pass the
    /// previous batch's tail seed here.
    pub fn generate_with_base<B: Backend>(
        &self,
        first_frame: usize,
        frames: usize,
        shape: LatentShape,
        base: Option<Tensor<B, 4>>,
        batch: usize,
        device: &B::Device,
    ) -> Result<Vec<NoiseSeed<B>>, AnimateError> {
        if self.policy == NoiseSharing::Mixed {
            self.split.validate(shape)?;
        }

        let base = match base {
            Some(base) => {
                if base.dims() != shape.dims() {
                    return Err(AnimateError::NoiseShape {
                        expected: shape.dims(),
                        actual: base.dims(),
                    });
                }
                base
            }
            None => self.base(shape, batch, device),
        };

        let seeds = (first_frame..first_frame + frames)
            .map(|frame| {
                let mut rng = rng::stream(self.seed, Purpose::Residual, batch as u64, frame as u64);
                let residual = rng::gaussian(&mut rng, shape.dims(), device);
                NoiseSeed::new(frame, self.combine(base.clone(), residual, device))
            })
            .collect();

        Ok(seeds)
    }

    fn combine<B: Backend>(&self, base: Tensor<B, 4>, residual: Tensor<B, 4>, device: &B::Device) -> Tensor<B, 4> {
        match self.policy {
            NoiseSharing::Independent => residual,
            NoiseSharing::SharedBase => blend(base, residual, self.epsilon),
            NoiseSharing::Mixed => match &self.split {
                MixedSplit::Channels(channels) => {
                    let [_, c, _, _] = base.dims();
                    let mask: Vec<f32> = (0..c)
                        .map(|i| if channels.contains(&i) { 1.0 } else { 0.0 })
                        .collect();
                    let mask = Tensor::<B, 4>::from_data(TensorData::new(mask, [1, c, 1, 1]), device);
                    let shared = blend(base, residual.clone(), self.epsilon);
                    shared * mask.clone() + residual * (mask.neg() + 1.0)
                }
                MixedSplit::LowFrequency { factor } => {
                    let shared = blend(base, residual.clone(), self.epsilon);
                    low_pass(shared, *factor) + residual.clone() - low_pass(residual, *factor)
                }
            },
        }
    }
}

/// `sqrt(1-ε)·base + sqrt(ε)·residual`, exact at both ends
fn blend<B: Backend>(base: Tensor<B, 4>, residual: Tensor<B, 4>, epsilon: f32) -> Tensor<B, 4> {
    if epsilon == 0.0 {
        base
    } else if epsilon == 1.0 {
        residual
    } else {
        base * (1.0 - epsilon).sqrt() + residual * epsilon.sqrt()
    }
}

/// Replace each `factor × factor` patch by its mean
pub fn low_pass<B: Backend>(x: Tensor<B, 4>, factor: usize) -> Tensor<B, 4> {
    if factor <= 1 {
        return x;
    }
    let [n, c, h, w] = x.dims();
    x.reshape([n, c, h / factor, factor, w / factor, factor])
        .mean_dim(5)
        .mean_dim(3)
        .repeat_dim(3, factor)
        .repeat_dim(5, factor)
        .reshape([n, c, h, w])
}
