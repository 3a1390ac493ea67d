//! Seeded noise streams
//!
//! Every random draw belongs to a stream keyed by `(seed, purpose, a, b)`, so
//! the values a frame receives never depend on how many other draws happened
//! before it or on which thread made them.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// What a stream is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Purpose {
    /// Shared base noise of a batch
    Base = 1,
    /// Independent per-frame noise
    Residual = 2,
    /// Stochastic sampler noise at one step
    Step = 3,
    /// Fresh noise for interpolated frames
    Interpolation = 4,
    /// Initial weights of the reference denoiser
    Weights = 5,
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Open the stream for `(seed, purpose, a, b)`
pub fn stream(seed: u64, purpose: Purpose, a: u64, b: u64) -> StdRng {
    let mut key = splitmix64(seed);
    for part in [purpose as u64, a, b] {
        key = splitmix64(key ^ part);
    }
    StdRng::seed_from_u64(key)
}

/// Draw `n` standard normal values
pub fn normal_values(rng: &mut StdRng, n: usize) -> Vec<f32> {
    rng.sample_iter(StandardNormal).take(n).collect()
}

/// Standard normal tensor of the given shape drawn from `rng`
pub fn gaussian<B: Backend>(rng: &mut StdRng, shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
    let n = shape.iter().product();
    Tensor::from_data(TensorData::new(normal_values(rng, n), shape), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_same_key_same_values() {
        let a = normal_values(&mut stream(42, Purpose::Residual, 3, 0), 64);
        let b = normal_values(&mut stream(42, Purpose::Residual, 3, 0), 64);
        assert_eq!(a, b);
    }

    #[test]
    fn test_keys_are_independent() {
        let base = normal_values(&mut stream(42, Purpose::Residual, 3, 0), 16);
        assert_ne!(base, normal_values(&mut stream(43, Purpose::Residual, 3, 0), 16));
        assert_ne!(base, normal_values(&mut stream(42, Purpose::Base, 3, 0), 16));
        assert_ne!(base, normal_values(&mut stream(42, Purpose::Residual, 4, 0), 16));
        assert_ne!(base, normal_values(&mut stream(42, Purpose::Residual, 3, 1), 16));
    }

    #[test]
    fn test_normal_moments() {
        let values = normal_values(&mut stream(0, Purpose::Base, 0, 0), 20_001);
        assert_eq!(values.len(), 20_001);

        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
    }

    #[test]
    fn test_gaussian_tensor_shape() {
        let device = Default::default();
        let t: Tensor<TestBackend, 4> = gaussian(&mut stream(1, Purpose::Step, 0, 0), [1, 4, 3, 5], &device);
        assert_eq!(t.dims(), [1, 4, 3, 5]);
    }
}
