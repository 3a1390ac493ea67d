//! Latent interpolation and frame distance helpers
//!
//! Used to blend noise tensors and text embeddings between frames, and to
//! locate the roughest transition in a sampled clip.
//!
//! # Methods
//!
//! - **Linear**: weighted average `(1-t)·a + t·b`
//! - **Energy mix**: `cos(r·π/2)·a + sin(r·π/2)·b`, variance preserving for
//!   independent unit-variance inputs

use burn::prelude::*;

/// Linear interpolation between two tensors
///
/// `t` should be in [0, 1] where t=0 returns `a` and t=1 returns `b`
pub fn lerp<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>, t: f32) -> Tensor<B, D> {
    a * (1.0 - t) + b * t
}

/// Variance-preserving mix of two independent unit-variance tensors
///
/// `ratio = 0` returns `base`, `ratio = 1` returns `fresh`.
pub fn energy_mix<B: Backend, const D: usize>(
    base: Tensor<B, D>,
    fresh: Tensor<B, D>,
    ratio: f32,
) -> Tensor<B, D> {
    let angle = ratio * std::f32::consts::FRAC_PI_2;
    base * angle.cos() + fresh * angle.sin()
}

/// Mean squared difference between two tensors of equal shape
pub fn mean_squared_distance<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> f32 {
    (a - b).powi_scalar(2).mean().into_scalar().elem()
}

/// Index `i` of the adjacent pair `(i, i+1)` with the largest mean squared distance
///
/// Returns `None` for fewer than two frames. Ties resolve to the earliest pair.
pub fn largest_gap<B: Backend, const D: usize>(frames: &[Tensor<B, D>]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, pair) in frames.windows(2).enumerate() {
        let dist = mean_squared_distance(pair[0].clone(), pair[1].clone());
        match best {
            Some((_, d)) if d >= dist => {}
            _ => best = Some((i, dist)),
        }
    }
    best.map(|(i, _)| i)
}
