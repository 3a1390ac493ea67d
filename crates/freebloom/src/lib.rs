//! Zero-shot text-to-video animation over a frozen latent diffusion model
//!
//! An image diffusion model knows nothing about time. This crate makes a
//! frozen one produce temporally consistent frames by:
//!
//! - drawing correlated initial noise across frames ([`noise`])
//! - letting each frame's self-attention read keys/values captured from
//!   anchor or neighbouring frames ([`topology`], [`model`])
//! - denoising every frame of a batch in lockstep so all cross-frame reads see
//!   the same timestep ([`sampler`])
//! - chaining batches into clips of any length ([`chain`])
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use freebloom::{Animator, AnimatorConfig, PreviewDecoder, ReferenceDenoiserConfig, StagedSequencer};
//!
//! let device = Default::default();
//! let model = Arc::new(ReferenceDenoiserConfig::default().init::<NdArray>(&device).weights());
//! let animator = Animator::new(model, Arc::new(PreviewDecoder::default()), AnimatorConfig::default(), &device)?;
//!
//! let sequencer = StagedSequencer::new(["closed bud", "opening petals", "full bloom"]);
//! let frames = animator.animate(&sequencer, "a flower blooms")?;
//! ```

pub mod animator;
pub mod chain;
pub mod config;
pub mod control;
pub mod decoder;
pub mod error;
pub mod frames;
pub mod interpolate;
pub mod model;
pub mod noise;
pub mod prompt;
pub mod reference;
pub mod rng;
pub mod sampler;
pub mod smoothing;
pub mod topology;

pub use animator::Animator;
pub use chain::{plan_segments, ChainReport, ClipChainer, SegmentPlan};
pub use config::AnimatorConfig;
pub use control::{GenerationControl, SamplerEvent, SamplerObserver};
pub use decoder::PreviewDecoder;
pub use error::{AnimateError, ConfigError, ModelError, SequencerError};
pub use frames::{mean_frame_difference, DecodedFrame};
pub use interpolate::FrameInterpolator;
pub use model::{ContextKv, DenoisingModel, FrameDecoder, LayerKv};
pub use noise::{LatentShape, MixedSplit, NoiseInitializer, NoiseSeed, NoiseSharing};
pub use prompt::{check_sequence, Prompt, PromptSequencer, ScriptedSequencer, StagedSequencer};
pub use reference::{Norm, ReferenceDenoiser, ReferenceDenoiserConfig, ReferenceWeights};
pub use sampler::{
    BatchOutput, BatchRequest, ConsistentAttentionSampler, FrameSlot, RecordPolicy, SampledFrame,
    SamplerSettings, Schedule, SlotInit, Trajectory,
};
pub use topology::{AttentionLinkSet, AttentionSource, AttentionTopology};

pub use freebloom_core::KvMode;
pub use freebloom_samplers::SamplerKind;
