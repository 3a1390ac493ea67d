//! Inter-frame latent smoothing
//!
//! After each step every frame is pulled slightly toward the mean of its
//! immediate neighbours: `(1-α)·x_i + α·mean(x_{i-1}, x_{i+1})`. All reads use
//! the latents as they were before smoothing started.
//!
//! During the first steps of a batch every frame can also be pulled toward
//! the batch's first frame with [`anchor_blend`].

use burn::prelude::*;

/// Smooth `latents` in place
///
/// Frames marked in `frozen` are read as neighbours but never written.
/// `blend = 0` or fewer than two frames leaves everything untouched.
pub fn smooth_frames<B: Backend>(latents: &mut [Tensor<B, 4>], blend: f32, frozen: &[bool]) {
    if blend <= 0.0 || latents.len() < 2 {
        return;
    }

    let snapshot = latents.to_vec();
    let last = snapshot.len() - 1;

    for (i, latent) in latents.iter_mut().enumerate() {
        if frozen.get(i).copied().unwrap_or(false) {
            continue;
        }
        let neighbours = match i {
            0 => snapshot[1].clone(),
            i if i == last => snapshot[last - 1].clone(),
            i => (snapshot[i - 1].clone() + snapshot[i + 1].clone()) * 0.5,
        };
        *latent = snapshot[i].clone() * (1.0 - blend) + neighbours * blend;
    }
}

/// Pull every frame after the first toward frame 0: `(1-w)·x_i + w·x_0`
///
/// Frames marked in `frozen` are left untouched, as is everything when
/// `weight = 0`.
pub fn anchor_blend<B: Backend>(latents: &mut [Tensor<B, 4>], weight: f32, frozen: &[bool]) {
    let Some((anchor, rest)) = latents.split_first_mut() else {
        return;
    };
    if weight <= 0.0 {
        return;
    }
    for (i, latent) in rest.iter_mut().enumerate() {
        if frozen.get(i + 1).copied().unwrap_or(false) {
            continue;
        }
        *latent = latent.clone() * (1.0 - weight) + anchor.clone() * weight;
    }
}
