//! Chaining batches into long clips
//!
//! A clip longer than one batch is sampled as a series of segments. Segment
//! `k > 0` takes the tail of segment `k - 1` as its base noise and as its
//! attention anchor:
//!
//! - `overlap ≥ 1`: the last `overlap` frames of the previous segment are
//!   repeated at the start of the next one as pinned slots, replaying their
//!   recorded trajectories
//! - `overlap = 0`: the previous segment's last frame is carried as an anchor
//!   every frame of the next segment attends to, with no frame repeated
//!
//! More overlap ties the seam tighter at the cost of `overlap` extra frame
//! slots per segment.

use std::sync::Arc;

use burn::prelude::*;
use freebloom_samplers::guidance_enabled;
use tracing::{info, warn};

use crate::config::AnimatorConfig;
use crate::control::SamplerEvent;
use crate::error::AnimateError;
use crate::frames::DecodedFrame;
use crate::model::FrameDecoder;
use crate::noise::{LatentShape, NoiseInitializer};
use crate::prompt::Prompt;
use crate::sampler::{
    BatchOutput, BatchRequest, ConsistentAttentionSampler, FrameSlot, RecordPolicy, SlotInit,
};
use crate::topology::{AttentionLinkSet, AttentionTopology};

/// One batch of a chained clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub index: usize,
    /// Global index of the first new frame
    pub first_frame: usize,
    /// Frames produced by this segment
    pub new_frames: usize,
    /// Frames repeated from the previous segment
    pub overlap: usize,
}

impl SegmentPlan {
    /// Frame slots sampled together
    pub fn batch_size(&self) -> usize {
        self.overlap + self.new_frames
    }
}

/// Split `total` frames into segments of at most `batch_size` slots
///
/// The final segment is truncated to the frames that remain.
pub fn plan_segments(total: usize, batch_size: usize, overlap: usize) -> Vec<SegmentPlan> {
    if total == 0 || batch_size == 0 || overlap >= batch_size {
        return Vec::new();
    }

    let first = batch_size.min(total);
    let mut plans = vec![SegmentPlan {
        index: 0,
        first_frame: 0,
        new_frames: first,
        overlap: 0,
    }];

    let mut produced = first;
    while produced < total {
        let overlap = overlap.min(produced);
        let new_frames = (batch_size - overlap).min(total - produced);
        plans.push(SegmentPlan {
            index: plans.len(),
            first_frame: produced,
            new_frames,
            overlap,
        });
        produced += new_frames;
    }
    plans
}

/// Result of a chained run: every completed segment, plus the failure that
/// stopped chaining, if any
#[derive(Debug)]
pub struct ChainReport<B: Backend> {
    pub frames: Vec<DecodedFrame<B>>,
    pub completed_batches: usize,
    pub failure: Option<AnimateError>,
}

impl<B: Backend> ChainReport<B> {
    pub(crate) fn failed(error: AnimateError) -> Self {
        Self {
            frames: Vec::new(),
            completed_batches: 0,
            failure: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<Vec<DecodedFrame<B>>, AnimateError> {
        match self.failure {
            Some(error) => Err(error),
            None => Ok(self.frames),
        }
    }
}

/// Samples and decodes a prompt sequence segment by segment
pub struct ClipChainer<B: Backend> {
    sampler: ConsistentAttentionSampler<B>,
    decoder: Arc<dyn FrameDecoder<B>>,
    noise: NoiseInitializer,
    topology: AttentionTopology,
    batch_size: usize,
    overlap: usize,
    shape: LatentShape,
    negative_prompt: String,
    device: B::Device,
}

impl<B: Backend> ClipChainer<B> {
    pub fn new(
        sampler: ConsistentAttentionSampler<B>,
        decoder: Arc<dyn FrameDecoder<B>>,
        config: &AnimatorConfig,
        device: &B::Device,
    ) -> Result<Self, AnimateError> {
        config.validate()?;
        Ok(Self {
            sampler,
            decoder,
            noise: NoiseInitializer::from_config(config)?,
            topology: config.attention_topology,
            batch_size: config.batch_size,
            overlap: config.overlap_size,
            shape: config.latent_shape(),
            negative_prompt: config.negative_prompt.clone(),
            device: device.clone(),
        })
    }

    pub fn sampler(&self) -> &ConsistentAttentionSampler<B> {
        &self.sampler
    }

    pub fn noise(&self) -> &NoiseInitializer {
        &self.noise
    }

    pub fn topology(&self) -> AttentionTopology {
        self.topology
    }

    pub fn shape(&self) -> LatentShape {
        self.shape
    }

    pub fn plan(&self, total: usize) -> Vec<SegmentPlan> {
        plan_segments(total, self.batch_size, self.overlap)
    }

    /// Negative prompt embedding when guidance needs one
    pub fn encode_uncond(&self, batch: usize) -> Result<Option<Tensor<B, 3>>, AnimateError> {
        if !guidance_enabled(self.sampler.settings().guidance_scale) {
            return Ok(None);
        }
        self.sampler
            .model()
            .encode_text(&self.negative_prompt)
            .map(Some)
            .map_err(|source| AnimateError::ModelInference {
                batch,
                frame: 0,
                step: None,
                timestep: None,
                source,
            })
    }

    /// Sample one segment
    ///
    /// `previous` must be the output of segment `plan.index - 1` when
    /// `plan.index > 0`, sampled with its tail recorded.
    pub fn sample_segment(
        &self,
        plan: &SegmentPlan,
        prompts: &[Prompt],
        previous: Option<&BatchOutput<B>>,
        uncond: Option<Tensor<B, 3>>,
        record: RecordPolicy,
    ) -> Result<BatchOutput<B>, AnimateError> {
        let batch = plan.index;
        let new_prompts = prompts
            .get(plan.first_frame..plan.first_frame + plan.new_frames)
            .ok_or_else(|| AnimateError::InvalidBatch(format!("segment {batch} runs past the prompt list")))?;

        let tail = match (plan.index, previous) {
            (0, _) => None,
            (_, Some(previous)) => Some(previous),
            (_, None) => {
                return Err(AnimateError::InvalidBatch(format!(
                    "segment {batch} needs the previous segment's output"
                )))
            }
        };

        let base = tail
            .and_then(|tail| tail.frames.last())
            .and_then(|frame| frame.seed.as_ref())
            .map(|seed| seed.tensor().clone());
        let seeds = self.noise.generate_with_base(
            plan.first_frame,
            plan.new_frames,
            self.shape,
            base,
            batch,
            &self.device,
        )?;

        let mut slots = Vec::with_capacity(plan.batch_size());
        let mut carried = Vec::new();

        if let Some(tail) = tail {
            let wanted = plan.overlap.max(1);
            let start = tail.frames.len().saturating_sub(wanted);
            let mut repeated = Vec::with_capacity(wanted);
            for frame in &tail.frames[start..] {
                let trajectory = frame.trajectory.clone().ok_or_else(|| {
                    AnimateError::InvalidBatch(format!(
                        "frame {} of segment {} has no recorded trajectory",
                        frame.prompt.index(),
                        batch - 1
                    ))
                })?;
                repeated.push((frame, trajectory));
            }

            if plan.overlap == 0 {
                carried.extend(repeated.into_iter().map(|(_, trajectory)| trajectory));
            } else {
                slots.extend(repeated.into_iter().map(|(frame, trajectory)| FrameSlot {
                    prompt: frame.prompt.clone(),
                    text: frame.text.clone(),
                    init: SlotInit::Pinned(trajectory),
                }));
            }
        }

        for (prompt, seed) in new_prompts.iter().zip(seeds) {
            let text = self
                .sampler
                .model()
                .encode_text(prompt.text())
                .map_err(|source| AnimateError::ModelInference {
                    batch,
                    frame: prompt.index(),
                    step: None,
                    timestep: None,
                    source,
                })?;
            slots.push(FrameSlot {
                prompt: prompt.clone(),
                text,
                init: SlotInit::Seed(seed),
            });
        }

        let links = AttentionLinkSet::build(self.topology, slots.len(), carried.len());
        info!(
            batch,
            first_frame = plan.first_frame,
            new_frames = plan.new_frames,
            overlap = plan.overlap,
            carried = carried.len(),
            "sampling segment"
        );

        self.sampler.run(BatchRequest {
            batch_index: batch,
            slots,
            links,
            carried,
            uncond,
            record,
        })
    }

    /// Decode the frames a segment produced, skipping pinned repeats
    ///
    /// Either every frame decodes or none is returned.
    pub fn decode(&self, output: &BatchOutput<B>) -> Result<Vec<DecodedFrame<B>>, AnimateError> {
        output
            .frames
            .iter()
            .filter(|frame| !frame.pinned)
            .map(|frame| {
                let image = self
                    .decoder
                    .decode(frame.latent.clone())
                    .map_err(|source| AnimateError::Decode {
                        batch: output.batch_index,
                        frame: frame.prompt.index(),
                        source,
                    })?;
                self.sampler.emit(SamplerEvent::FrameDecoded {
                    batch: output.batch_index,
                    frame: frame.prompt.index(),
                });
                Ok(DecodedFrame {
                    prompt: frame.prompt.clone(),
                    image,
                })
            })
            .collect()
    }

    /// Record policy that keeps what the next segment will need
    fn tail_record(&self, plan: &SegmentPlan, has_next: bool) -> RecordPolicy {
        if !has_next {
            return RecordPolicy::None;
        }
        let size = plan.batch_size();
        let keep = self.overlap.max(1).min(size);
        RecordPolicy::Frames((size - keep..size).collect())
    }

    /// Sample and decode every segment of `prompts`
    ///
    /// Stops at the first failing segment and returns the frames of every
    /// segment completed before it.
    pub fn run(&self, prompts: &[Prompt]) -> ChainReport<B> {
        let plans = self.plan(prompts.len());
        info!(frames = prompts.len(), segments = plans.len(), "chaining clip");

        let mut report = ChainReport {
            frames: Vec::with_capacity(prompts.len()),
            completed_batches: 0,
            failure: None,
        };

        let uncond = match self.encode_uncond(0) {
            Ok(uncond) => uncond,
            Err(error) => {
                report.failure = Some(error);
                return report;
            }
        };

        let mut previous: Option<BatchOutput<B>> = None;
        for plan in &plans {
            let has_next = plan.index + 1 < plans.len();
            let record = self.tail_record(plan, has_next);
            let segment = self
                .sample_segment(plan, prompts, previous.as_ref(), uncond.clone(), record)
                .and_then(|output| self.decode(&output).map(|frames| (output, frames)));

            match segment {
                Ok((output, frames)) => {
                    report.frames.extend(frames);
                    report.completed_batches += 1;
                    previous = Some(output);
                }
                Err(error) => {
                    warn!(batch = plan.index, %error, "segment failed, chaining stopped");
                    report.failure = Some(error);
                    break;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_length_without_overlap() {
        let plans = plan_segments(16, 8, 0);
        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|p| p.batch_size() == 8 && p.overlap == 0));
        assert_eq!(plans[1].first_frame, 8);
    }

    #[test]
    fn test_one_and_a_half_length_truncates_last() {
        let plans = plan_segments(12, 8, 0);
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].new_frames, 8);
        assert_eq!(plans[1].new_frames, 4);
        assert_eq!(plans[1].batch_size(), 4);
    }

    #[test]
    fn test_overlap_repeats_frames() {
        let plans = plan_segments(20, 8, 2);
        let new: Vec<usize> = plans.iter().map(|p| p.new_frames).collect();
        assert_eq!(new, vec![8, 6, 6]);
        assert_eq!(plans[1].overlap, 2);
        assert_eq!(plans[2].first_frame, 14);
        assert_eq!(plans[2].batch_size(), 8);
        assert_eq!(new.iter().sum::<usize>(), 20);
    }

    #[test]
    fn test_short_clip_single_segment() {
        let plans = plan_segments(5, 8, 1);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].new_frames, 5);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(plan_segments(0, 8, 0).is_empty());
        assert!(plan_segments(8, 0, 0).is_empty());
        assert!(plan_segments(8, 4, 4).is_empty());
    }

    #[test]
    fn test_segments_cover_every_frame_once() {
        for (total, batch, overlap) in [(17, 4, 1), (9, 3, 0), (30, 8, 3)] {
            let plans = plan_segments(total, batch, overlap);
            let mut next = 0;
            for plan in &plans {
                assert_eq!(plan.first_frame, next);
                assert!(plan.batch_size() <= batch);
                next += plan.new_frames;
            }
            assert_eq!(next, total);
        }
    }
}
