//! Frame interpolation refinement
//!
//! Inserts frames into a finished batch where the motion jumps the most. Each
//! pass finds the adjacent pair with the largest latent distance, inserts a
//! frame between them and re-samples the batch with every existing frame
//! pinned to its recorded trajectory, so only the new frame is denoised while
//! attending to the others.

use burn::prelude::*;
use freebloom_core::frame_interpolation::{energy_mix, largest_gap, lerp};
use tracing::info;

use crate::error::AnimateError;
use crate::noise::NoiseSeed;
use crate::prompt::Prompt;
use crate::rng::{self, Purpose};
use crate::sampler::{
    BatchOutput, BatchRequest, ConsistentAttentionSampler, FrameSlot, RecordPolicy, SlotInit,
};
use crate::topology::{AttentionLinkSet, AttentionTopology};

/// Inserts in-between frames into a single batch
#[derive(Debug, Clone)]
pub struct FrameInterpolator {
    topology: AttentionTopology,
    /// Share of fresh noise in an inserted frame's seed
    noise_ratio: f32,
    seed: u64,
}

impl FrameInterpolator {
    pub fn new(topology: AttentionTopology, noise_ratio: f32, seed: u64) -> Self {
        Self {
            topology,
            noise_ratio,
            seed,
        }
    }

    /// Run `passes` insertion passes over `output`
    ///
    /// Every frame of `output` needs a recorded trajectory. `base_noise` is the
    /// batch's shared base noise; inserted frames start from an
    /// energy-preserving mix of it and fresh noise.
    pub fn refine<B: Backend>(
        &self,
        sampler: &ConsistentAttentionSampler<B>,
        mut output: BatchOutput<B>,
        base_noise: &Tensor<B, 4>,
        uncond: Option<Tensor<B, 3>>,
        passes: usize,
    ) -> Result<BatchOutput<B>, AnimateError> {
        for pass in 0..passes {
            let latents: Vec<Tensor<B, 4>> = output.frames.iter().map(|f| f.latent.clone()).collect();
            let Some(gap) = largest_gap(&latents) else {
                return Ok(output);
            };

            let left = &output.frames[gap];
            let right = &output.frames[gap + 1];
            if left.text.dims() != right.text.dims() {
                return Err(AnimateError::InvalidBatch(format!(
                    "cannot blend text embeddings of shapes {:?} and {:?}",
                    left.text.dims(),
                    right.text.dims()
                )));
            }
            let text = lerp(left.text.clone(), right.text.clone(), 0.5);

            let device = base_noise.device();
            let mut rng = rng::stream(
                self.seed,
                Purpose::Interpolation,
                output.batch_index as u64,
                pass as u64,
            );
            let fresh = rng::gaussian(&mut rng, base_noise.dims(), &device);
            let noise = energy_mix(base_noise.clone(), fresh, self.noise_ratio);

            info!(pass, after_frame = gap, "inserting interpolated frame");

            let mut slots = Vec::with_capacity(output.frames.len() + 1);
            for (i, frame) in output.frames.iter().enumerate() {
                let trajectory = frame.trajectory.clone().ok_or_else(|| {
                    AnimateError::InvalidBatch(format!("frame {i} has no recorded trajectory"))
                })?;
                let index = if i > gap { i + 1 } else { i };
                slots.push(FrameSlot {
                    prompt: Prompt::new(index, frame.prompt.text()),
                    text: frame.text.clone(),
                    init: SlotInit::Pinned(trajectory),
                });
            }
            slots.insert(
                gap + 1,
                FrameSlot {
                    prompt: Prompt::new(gap + 1, ""),
                    text,
                    init: SlotInit::Seed(NoiseSeed::new(gap + 1, noise)),
                },
            );

            let frames = slots.len();
            let seeds: Vec<_> = output.frames.iter().map(|f| f.seed.clone()).collect();

            let mut refined = sampler.run(BatchRequest {
                batch_index: output.batch_index,
                slots,
                links: AttentionLinkSet::build(self.topology, frames, 0),
                carried: Vec::new(),
                uncond: uncond.clone(),
                record: RecordPolicy::All,
            })?;

            // Pinned originals keep their own seeds and count as produced frames
            let mut originals = seeds.into_iter();
            for (i, frame) in refined.frames.iter_mut().enumerate() {
                if i != gap + 1 {
                    frame.seed = originals.next().flatten();
                    frame.pinned = false;
                }
            }
            output = refined;
        }
        Ok(output)
    }
}
