//! DDIM (Denoising Diffusion Implicit Models) Sampler
//!
//! Deterministic at η = 0; η > 0 blends in DDPM-style stochasticity using
//! noise supplied by the caller.

use burn::prelude::*;

use crate::scheduler::{sampler_timesteps, NoiseSchedule};
use crate::DiffusionSampler;

/// DDIM sampler configuration
#[derive(Debug, Clone)]
pub struct DdimConfig {
    /// Number of inference steps
    pub num_inference_steps: usize,
    /// Eta parameter (0.0 = deterministic DDIM, 1.0 = DDPM)
    pub eta: f32,
}

impl Default for DdimConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 50,
            eta: 0.0,
        }
    }
}

/// DDIM Sampler
pub struct DdimSampler {
    schedule: NoiseSchedule,
    eta: f32,
    timesteps: Vec<usize>,
}

/// Scalar coefficients of one DDIM update
#[derive(Debug, Clone, Copy, PartialEq)]
struct DdimCoefficients {
    sqrt_alpha_t: f32,
    sqrt_one_minus_alpha_t: f32,
    sqrt_alpha_prev: f32,
    dir_coeff: f32,
    sigma: f32,
}

impl DdimSampler {
    /// Create a new DDIM sampler
    pub fn new(schedule: NoiseSchedule, config: DdimConfig) -> Self {
        let timesteps = sampler_timesteps(config.num_inference_steps, schedule.num_train_steps());
        Self {
            schedule,
            eta: config.eta,
            timesteps,
        }
    }

    fn coefficients(&self, step_index: usize) -> DdimCoefficients {
        let t = self.timesteps[step_index];
        let alpha_t = self.schedule.alpha_cumprod(t);
        // Final step lands on the clean sample: alpha = 1.0
        let alpha_prev = self
            .timesteps
            .get(step_index + 1)
            .map_or(1.0, |&prev| self.schedule.alpha_cumprod(prev));

        let sigma = if self.eta > 0.0 {
            let variance = (1.0 - alpha_prev) / (1.0 - alpha_t) * (1.0 - alpha_t / alpha_prev);
            self.eta * variance.max(0.0).sqrt()
        } else {
            0.0
        };

        DdimCoefficients {
            sqrt_alpha_t: alpha_t.sqrt(),
            sqrt_one_minus_alpha_t: (1.0 - alpha_t).sqrt(),
            sqrt_alpha_prev: alpha_prev.sqrt(),
            dir_coeff: (1.0 - alpha_prev - sigma * sigma).max(0.0).sqrt(),
            sigma,
        }
    }
}

impl<B: Backend> DiffusionSampler<B> for DdimSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    fn is_stochastic(&self) -> bool {
        self.eta > 0.0
    }

    /// Perform one DDIM step
    ///
    /// * `latent` - Current noisy latent [batch, channels, height, width]
    /// * `noise_pred` - Predicted noise [batch, channels, height, width]
    /// * `step_index` - Current step index (0 = highest noise)
    /// * `noise` - Fresh unit Gaussian noise, used only when η > 0
    fn step(
        &self,
        latent: Tensor<B, 4>,
        noise_pred: Tensor<B, 4>,
        step_index: usize,
        noise: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let c = self.coefficients(step_index);

        // pred_x0 = (latent - sqrt(1-alpha_t) * noise_pred) / sqrt(alpha_t)
        let pred_x0 = (latent - noise_pred.clone() * c.sqrt_one_minus_alpha_t) / c.sqrt_alpha_t;
        let prev = pred_x0 * c.sqrt_alpha_prev + noise_pred * c.dir_coeff;

        match noise {
            Some(noise) if c.sigma > 0.0 => prev + noise * c.sigma,
            _ => prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_ddim_config_default() {
        let config = DdimConfig::default();
        assert_eq!(config.num_inference_steps, 50);
        assert_eq!(config.eta, 0.0);
    }

    #[test]
    fn test_final_step_returns_predicted_sample() {
        let sampler = DdimSampler::new(
            NoiseSchedule::sd1x(),
            DdimConfig {
                num_inference_steps: 4,
                eta: 0.0,
            },
        );
        let device = Default::default();
        let last = 3;
        let c = sampler.coefficients(last);
        assert_eq!(c.sqrt_alpha_prev, 1.0);
        assert_eq!(c.dir_coeff, 0.0);

        let latent = Tensor::<TestBackend, 4>::full([1, 4, 2, 2], 1.0, &device);
        let eps = Tensor::<TestBackend, 4>::zeros([1, 4, 2, 2], &device);
        let out: Vec<f32> = DiffusionSampler::<TestBackend>::step(&sampler, latent, eps, last, None)
            .into_data()
            .to_vec()
            .unwrap();

        let expected = 1.0 / c.sqrt_alpha_t;
        assert!(out.iter().all(|v| (v - expected).abs() < 1e-5));
    }

    #[test]
    fn test_deterministic_sampler_ignores_noise() {
        let sampler = DdimSampler::new(NoiseSchedule::sd1x(), DdimConfig::default());
        let device = Default::default();
        let latent = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let eps = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 0.5;
        let noise = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 100.0;

        assert!(!DiffusionSampler::<TestBackend>::is_stochastic(&sampler));
        let with: Vec<f32> = sampler
            .step(latent.clone(), eps.clone(), 0, Some(noise))
            .into_data()
            .to_vec()
            .unwrap();
        let without: Vec<f32> = sampler.step(latent, eps, 0, None).into_data().to_vec().unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn test_eta_adds_noise_before_final_step() {
        let sampler = DdimSampler::new(
            NoiseSchedule::sd1x(),
            DdimConfig {
                num_inference_steps: 10,
                eta: 1.0,
            },
        );
        assert!(DiffusionSampler::<TestBackend>::is_stochastic(&sampler));
        assert!(sampler.coefficients(0).sigma > 0.0);
        assert_eq!(sampler.coefficients(9).sigma, 0.0);
    }
}
