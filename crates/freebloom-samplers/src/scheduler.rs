//! Noise schedules for diffusion models
//!
//! This module provides noise schedule utilities shared across all samplers.
//! Schedules are stored as plain `f32` tables: every sampler step reads a
//! handful of scalars and there is nothing to gain from keeping them on device.

/// Training timesteps of the Stable Diffusion 1.x schedule
pub const SD1X_TRAIN_STEPS: usize = 1000;

/// Precomputed noise schedule values
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Cumulative product of alphas: ᾱₜ
    alphas_cumprod: Vec<f32>,
}

impl NoiseSchedule {
    fn from_betas(betas: impl Iterator<Item = f64>) -> Self {
        let mut cumprod = 1.0f64;
        let alphas_cumprod = betas
            .map(|beta| {
                cumprod *= 1.0 - beta;
                cumprod as f32
            })
            .collect();
        Self { alphas_cumprod }
    }

    /// Scaled linear schedule: linear in sqrt(beta)
    pub fn scaled_linear(num_steps: usize, beta_start: f64, beta_end: f64) -> Self {
        let denom = (num_steps.max(2) - 1) as f64;
        let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
        Self::from_betas((0..num_steps).map(move |i| {
            let t = i as f64 / denom;
            (start + t * (end - start)).powi(2)
        }))
    }

    /// The schedule Stable Diffusion 1.x was trained with
    pub fn sd1x() -> Self {
        Self::scaled_linear(SD1X_TRAIN_STEPS, 0.00085, 0.012)
    }

    /// Number of training timesteps
    pub fn num_train_steps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// ᾱ at timestep `t`
    pub fn alpha_cumprod(&self, t: usize) -> f32 {
        self.alphas_cumprod[t]
    }

    /// sigma = sqrt((1 - ᾱ) / ᾱ) at timestep `t`
    pub fn sigma(&self, t: usize) -> f32 {
        let alpha = self.alpha_cumprod(t);
        ((1.0 - alpha) / alpha).sqrt()
    }
}

/// Generate timesteps for a sampler
///
/// Spreads the steps evenly over the whole training range, from the last
/// training timestep down to 0. Requests beyond the training range are
/// clamped to one step per training timestep, so every entry is a valid
/// index and the sequence strictly descends.
pub fn sampler_timesteps(num_inference_steps: usize, num_train_steps: usize) -> Vec<usize> {
    let last = num_train_steps.saturating_sub(1);
    let n = num_inference_steps.min(num_train_steps);
    if n <= 1 {
        return vec![last; n];
    }
    let spacing = last as f64 / (n - 1) as f64;
    (0..n)
        .rev()
        .map(|i| (i as f64 * spacing).round() as usize)
        .collect()
}

/// Sigmas for a timestep sequence, with sigma=0.0 appended for the final step
pub fn compute_sigmas(schedule: &NoiseSchedule, timesteps: &[usize]) -> Vec<f32> {
    let mut sigmas: Vec<f32> = timesteps.iter().map(|&t| schedule.sigma(t)).collect();
    sigmas.push(0.0);
    sigmas
}

/// Compute ancestral sampling step parameters
///
/// For stochastic samplers, computes:
/// - sigma_down: the deterministic step target
/// - sigma_up: the noise injection level
///
/// The eta parameter controls stochasticity (0 = ODE, 1 = full SDE)
pub fn get_ancestral_step(sigma: f32, sigma_next: f32, eta: f32) -> (f32, f32) {
    if sigma_next == 0.0 {
        return (0.0, 0.0);
    }

    let sigma_up = (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
        .sqrt()
        .min(sigma_next)
        * eta;
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).sqrt();

    (sigma_down, sigma_up)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_timesteps() {
        let steps = sampler_timesteps(50, 1000);
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[0], 999); // First step (pure noise)
        assert_eq!(steps[49], 0); // Last step (lowest noise)
        assert!(steps.windows(2).all(|w| w[0] > w[1]));

        assert_eq!(sampler_timesteps(4, 1000), vec![999, 666, 333, 0]);
        assert_eq!(sampler_timesteps(1, 1000), vec![999]);
    }

    #[test]
    fn test_sampler_timesteps_cover_range_for_long_schedules() {
        for n in [501, 750, 999, 1000] {
            let steps = sampler_timesteps(n, 1000);
            assert_eq!(steps.len(), n);
            assert_eq!(steps[0], 999, "n = {n}");
            assert_eq!(steps[n - 1], 0);
            assert!(steps.windows(2).all(|w| w[0] > w[1]), "n = {n}");
        }
    }

    #[test]
    fn test_sampler_timesteps_clamped_to_train_steps() {
        let steps = sampler_timesteps(1500, 1000);
        assert_eq!(steps.len(), 1000);
        assert!(steps.iter().all(|&t| t < 1000));
        assert!(steps.windows(2).all(|w| w[0] > w[1]));

        assert_eq!(sampler_timesteps(8, 4), vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_sd1x_schedule_is_decreasing() {
        let schedule = NoiseSchedule::sd1x();
        assert_eq!(schedule.num_train_steps(), 1000);
        assert!(schedule.alpha_cumprod(0) > 0.99);
        assert!(schedule.alpha_cumprod(999) < 0.01);
        assert!(schedule.sigma(999) > schedule.sigma(0));
    }

    #[test]
    fn test_compute_sigmas_appends_zero() {
        let schedule = NoiseSchedule::sd1x();
        let sigmas = compute_sigmas(&schedule, &[900, 500, 100]);
        assert_eq!(sigmas.len(), 4);
        assert_eq!(sigmas[3], 0.0);
        assert!(sigmas[0] > sigmas[1] && sigmas[1] > sigmas[2]);
    }

    #[test]
    fn test_ancestral_step_final_and_deterministic() {
        assert_eq!(get_ancestral_step(1.0, 0.0, 1.0), (0.0, 0.0));
        let (down, up) = get_ancestral_step(2.0, 1.0, 0.0);
        assert_eq!(up, 0.0);
        assert!((down - 1.0).abs() < 1e-6);
    }
}
