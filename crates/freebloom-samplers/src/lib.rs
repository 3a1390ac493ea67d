//! Diffusion samplers for per-frame latent updates
//!
//! Every sampler exposes the same [`DiffusionSampler`] interface so a
//! multi-frame driver can advance many latents through one shared schedule
//! without knowing which update rule is in use. Stochastic samplers never draw
//! their own randomness: the caller passes the noise for each step, which keeps
//! sampling reproducible under any seed and thread schedule.

pub mod ddim;
pub mod euler;
pub mod guidance;
pub mod scheduler;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

pub use ddim::{DdimConfig, DdimSampler};
pub use euler::{EulerAncestralSampler, EulerConfig, EulerSampler};
pub use guidance::{apply_guidance, guidance_enabled};
pub use scheduler::{
    compute_sigmas, get_ancestral_step, sampler_timesteps, NoiseSchedule, SD1X_TRAIN_STEPS,
};

/// A per-latent update rule over a fixed, descending timestep schedule
pub trait DiffusionSampler<B: Backend>: Send + Sync {
    /// Timesteps visited, highest noise first
    fn timesteps(&self) -> &[usize];

    /// Number of update steps
    fn num_steps(&self) -> usize {
        self.timesteps().len()
    }

    /// Scale applied to unit-variance initial noise
    fn init_noise_sigma(&self) -> f32;

    /// Rescale a latent before it is fed to the noise-prediction network
    fn scale_model_input(&self, latent: Tensor<B, 4>, _step_index: usize) -> Tensor<B, 4> {
        latent
    }

    /// Whether [`DiffusionSampler::step`] consumes fresh noise
    fn is_stochastic(&self) -> bool;

    /// Advance one latent from `timesteps()[step_index]` to the next timestep
    ///
    /// `noise` is unit Gaussian noise of the latent's shape; it is ignored by
    /// deterministic samplers and treated as zero when absent.
    fn step(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step_index: usize,
        noise: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4>;
}

/// Sampler algorithm selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplerKind {
    /// DDIM - deterministic at eta = 0
    #[default]
    Ddim,
    /// Euler - first-order ODE solver
    Euler,
    /// Euler Ancestral - Euler with noise injection
    EulerAncestral,
}

impl SamplerKind {
    /// Build a sampler over the Stable Diffusion 1.x training schedule
    pub fn build<B: Backend>(self, steps: usize, eta: f32) -> Box<dyn DiffusionSampler<B>> {
        let schedule = NoiseSchedule::sd1x();
        match self {
            SamplerKind::Ddim => Box::new(DdimSampler::new(
                schedule,
                DdimConfig {
                    num_inference_steps: steps,
                    eta,
                },
            )),
            SamplerKind::Euler => Box::new(EulerSampler::new(
                &schedule,
                &EulerConfig {
                    num_inference_steps: steps,
                    eta: 0.0,
                    ..Default::default()
                },
            )),
            SamplerKind::EulerAncestral => Box::new(EulerAncestralSampler::new(
                &schedule,
                &EulerConfig {
                    num_inference_steps: steps,
                    eta,
                    ..Default::default()
                },
            )),
        }
    }
}
