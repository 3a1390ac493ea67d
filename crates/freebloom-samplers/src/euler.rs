//! Euler samplers for diffusion models
//!
//! Implements the Euler method for ODE-based sampling and its ancestral
//! variant. Uses the k-diffusion formulation: latents live at scale
//! `sqrt(sigma² + 1)` and model inputs are rescaled back to unit variance.

use burn::prelude::*;

use crate::scheduler::{compute_sigmas, get_ancestral_step, sampler_timesteps, NoiseSchedule};
use crate::DiffusionSampler;

/// Euler sampler configuration
#[derive(Debug, Clone)]
pub struct EulerConfig {
    /// Number of inference steps
    pub num_inference_steps: usize,
    /// Eta for ancestral sampling (0 = deterministic, 1 = full noise)
    pub eta: f32,
    /// Noise scale multiplier
    pub s_noise: f32,
}

impl Default for EulerConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 30,
            eta: 1.0,
            s_noise: 1.0,
        }
    }
}

/// Euler Sampler
///
/// Deterministic first-order solver of the probability-flow ODE.
pub struct EulerSampler {
    timesteps: Vec<usize>,
    sigmas: Vec<f32>,
}

impl EulerSampler {
    pub fn new(schedule: &NoiseSchedule, config: &EulerConfig) -> Self {
        let timesteps = sampler_timesteps(config.num_inference_steps, schedule.num_train_steps());
        let sigmas = compute_sigmas(schedule, &timesteps);
        Self { timesteps, sigmas }
    }

    /// Sigma values, one per timestep plus a trailing 0.0
    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }
}

impl<B: Backend> DiffusionSampler<B> for EulerSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        (self.sigmas[0].powi(2) + 1.0).sqrt()
    }

    fn scale_model_input(&self, latent: Tensor<B, 4>, step_index: usize) -> Tensor<B, 4> {
        let sigma = self.sigmas[step_index];
        latent / (sigma * sigma + 1.0).sqrt()
    }

    fn is_stochastic(&self) -> bool {
        false
    }

    fn step(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step_index: usize,
        _noise: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let sigma = self.sigmas[step_index];
        let sigma_next = self.sigmas[step_index + 1];

        // denoised = x - sigma * eps, so dx/dsigma = (x - denoised) / sigma = eps
        latent + noise_pred * (sigma_next - sigma)
    }
}

/// Euler Ancestral sampler
///
/// Steps down to `sigma_down` and re-injects noise up to `sigma_next`.
pub struct EulerAncestralSampler {
    timesteps: Vec<usize>,
    sigmas: Vec<f32>,
    eta: f32,
    s_noise: f32,
}

impl EulerAncestralSampler {
    pub fn new(schedule: &NoiseSchedule, config: &EulerConfig) -> Self {
        let timesteps = sampler_timesteps(config.num_inference_steps, schedule.num_train_steps());
        let sigmas = compute_sigmas(schedule, &timesteps);
        Self {
            timesteps,
            sigmas,
            eta: config.eta,
            s_noise: config.s_noise,
        }
    }
}

impl<B: Backend> DiffusionSampler<B> for EulerAncestralSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        (self.sigmas[0].powi(2) + 1.0).sqrt()
    }

    fn scale_model_input(&self, latent: Tensor<B, 4>, step_index: usize) -> Tensor<B, 4> {
        let sigma = self.sigmas[step_index];
        latent / (sigma * sigma + 1.0).sqrt()
    }

    fn is_stochastic(&self) -> bool {
        self.eta > 0.0
    }

    fn step(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step_index: usize,
        noise: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let sigma = self.sigmas[step_index];
        let sigma_next = self.sigmas[step_index + 1];

        if sigma_next == 0.0 {
            // Last step: return the denoised estimate
            return latent - noise_pred * sigma;
        }

        let (sigma_down, sigma_up) = get_ancestral_step(sigma, sigma_next, self.eta);
        let result = latent + noise_pred * (sigma_down - sigma);

        match noise {
            Some(noise) if sigma_up > 0.0 => result + noise * (sigma_up * self.s_noise),
            _ => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_euler_config_default() {
        let config = EulerConfig::default();
        assert_eq!(config.num_inference_steps, 30);
    }

    #[test]
    fn test_euler_init_sigma_exceeds_one() {
        let sampler = EulerSampler::new(&NoiseSchedule::sd1x(), &EulerConfig::default());
        let sigma = DiffusionSampler::<TestBackend>::init_noise_sigma(&sampler);
        assert!(sigma > 1.0);
        assert_eq!(sampler.sigmas().len(), 31);
    }

    #[test]
    fn test_euler_last_step_removes_predicted_noise() {
        let sampler = EulerSampler::new(
            &NoiseSchedule::sd1x(),
            &EulerConfig {
                num_inference_steps: 5,
                ..Default::default()
            },
        );
        let device = Default::default();
        let sigma = sampler.sigmas()[4];
        let eps = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let latent = eps.clone() * sigma;

        let out: Vec<f32> = sampler.step(latent, eps, 4, None).into_data().to_vec().unwrap();
        assert!(out.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_ancestral_uses_supplied_noise() {
        let sampler = EulerAncestralSampler::new(
            &NoiseSchedule::sd1x(),
            &EulerConfig {
                num_inference_steps: 5,
                ..Default::default()
            },
        );
        let device = Default::default();
        let latent = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let eps = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device);
        let noise = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);

        let quiet: Vec<f32> = sampler
            .step(latent.clone(), eps.clone(), 0, None)
            .into_data()
            .to_vec()
            .unwrap();
        let noisy: Vec<f32> = sampler.step(latent, eps, 0, Some(noise)).into_data().to_vec().unwrap();

        assert!(quiet.iter().all(|v| *v == 0.0));
        assert!(noisy.iter().all(|v| *v > 0.0));
    }
}
