//! Top-level animation pipeline
//!
//! prompt sequencing → noise initialization → lockstep sampling → decoding,
//! repeated per segment by the [`ClipChainer`] for clips longer than a batch.

use std::sync::Arc;

use burn::prelude::*;
use freebloom_samplers::DiffusionSampler;
use tracing::info;

use crate::chain::{ChainReport, ClipChainer};
use crate::config::AnimatorConfig;
use crate::control::{GenerationControl, SamplerObserver};
use crate::error::{AnimateError, ConfigError};
use crate::frames::DecodedFrame;
use crate::interpolate::FrameInterpolator;
use crate::model::{DenoisingModel, FrameDecoder};
use crate::prompt::{check_sequence, Prompt, PromptSequencer};
use crate::sampler::{ConsistentAttentionSampler, RecordPolicy, SamplerSettings};

/// Turns a prompt into a temporally consistent frame sequence
///
/// The model and decoder are shared read-only; one animator can serve
/// many requests, and several animators can share one model.
pub struct Animator<B: Backend> {
    model: Arc<dyn DenoisingModel<B>>,
    decoder: Arc<dyn FrameDecoder<B>>,
    config: AnimatorConfig,
    control: GenerationControl,
    observer: Option<Arc<dyn SamplerObserver>>,
    device: B::Device,
}

impl<B: Backend> Animator<B> {
    /// Validate `config` against itself and the model
    pub fn new(
        model: Arc<dyn DenoisingModel<B>>,
        decoder: Arc<dyn FrameDecoder<B>>,
        config: AnimatorConfig,
        device: &B::Device,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if model.latent_channels() != config.latent_channels {
            return Err(ConfigError::LatentChannelMismatch {
                model: model.latent_channels(),
                config: config.latent_channels,
            });
        }
        Ok(Self {
            model,
            decoder,
            config,
            control: GenerationControl::new(),
            observer: None,
            device: device.clone(),
        })
    }

    pub fn with_control(mut self, control: GenerationControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SamplerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &AnimatorConfig {
        &self.config
    }

    pub fn control(&self) -> &GenerationControl {
        &self.control
    }

    fn chainer(&self) -> Result<ClipChainer<B>, AnimateError> {
        let sampler: Arc<dyn DiffusionSampler<B>> = Arc::from(
            self.config
                .sampler
                .build::<B>(self.config.schedule_length, self.config.eta),
        );
        let mut consistent = ConsistentAttentionSampler::new(
            self.model.clone(),
            sampler,
            SamplerSettings::from_config(&self.config),
            &self.device,
        )
        .with_control(self.control.clone());
        if let Some(observer) = &self.observer {
            consistent = consistent.with_observer(observer.clone());
        }
        ClipChainer::new(consistent, self.decoder.clone(), &self.config, &self.device)
    }

    /// Sequence, sample and decode `frame_count` frames
    ///
    /// Returns every frame or the first failure.
    pub fn animate(
        &self,
        sequencer: &dyn PromptSequencer,
        base_prompt: &str,
    ) -> Result<Vec<DecodedFrame<B>>, AnimateError> {
        self.animate_report(sequencer, base_prompt).into_result()
    }

    /// Like [`Animator::animate`], but keeps the frames of segments that
    /// completed before a failure
    pub fn animate_report(&self, sequencer: &dyn PromptSequencer, base_prompt: &str) -> ChainReport<B> {
        let prompts = sequencer
            .sequence(base_prompt, self.config.frame_count)
            .map_err(AnimateError::from)
            .and_then(|texts| check_sequence(texts, self.config.frame_count));

        match prompts {
            Ok(prompts) => self.animate_prompts(&prompts),
            Err(error) => ChainReport::failed(error),
        }
    }

    /// Sample and decode an already sequenced prompt list
    pub fn animate_prompts(&self, prompts: &[Prompt]) -> ChainReport<B> {
        if prompts.len() != self.config.frame_count {
            return ChainReport::failed(AnimateError::Sequencing {
                expected: self.config.frame_count,
                actual: prompts.len(),
            });
        }
        let chainer = match self.chainer() {
            Ok(chainer) => chainer,
            Err(error) => return ChainReport::failed(error),
        };

        info!(
            frames = prompts.len(),
            batch_size = self.config.batch_size,
            steps = self.config.schedule_length,
            "animating"
        );

        if self.config.interpolation_passes == 0 {
            return chainer.run(prompts);
        }

        match self.interpolated(&chainer, prompts) {
            Ok(frames) => ChainReport {
                frames,
                completed_batches: 1,
                failure: None,
            },
            Err(error) => ChainReport::failed(error),
        }
    }

    /// Single-batch clip with interpolation passes
    fn interpolated(
        &self,
        chainer: &ClipChainer<B>,
        prompts: &[Prompt],
    ) -> Result<Vec<DecodedFrame<B>>, AnimateError> {
        let plans = chainer.plan(prompts.len());
        let [plan] = plans.as_slice() else {
            return Err(ConfigError::InterpolationNeedsSingleBatch {
                frame_count: self.config.frame_count,
                batch_size: self.config.batch_size,
            }
            .into());
        };

        let uncond = chainer.encode_uncond(0)?;
        let output = chainer.sample_segment(plan, prompts, None, uncond.clone(), RecordPolicy::All)?;

        let base = chainer.noise().base::<B>(chainer.shape(), 0, &self.device);
        let interpolator = FrameInterpolator::new(
            chainer.topology(),
            self.config.interpolation_noise_ratio,
            self.config.seed,
        );
        let refined = interpolator.refine(
            chainer.sampler(),
            output,
            &base,
            uncond,
            self.config.interpolation_passes,
        )?;
        chainer.decode(&refined)
    }
}
