//! Lockstep multi-frame denoising
//!
//! [`ConsistentAttentionSampler`] advances every frame of a batch through one
//! shared schedule. Each timestep runs three fork-join phases over a snapshot
//! of the latents taken when the step begins:
//!
//! 1. **capture**: keys/values of every frame some other frame reads, plus
//!    those of anchors carried over from the previous batch
//! 2. **predict**: noise prediction for every free frame, with the keys/values
//!    of its linked frames injected into its attention layers
//! 3. **advance**: the sampler's update rule applied to every free frame
//!
//! No frame reaches phase 3 until all predictions of the step exist, and no
//! phase reads a latent written in the same step. Pinned frames follow a
//! recorded trajectory instead of being predicted, yet still serve as context.

use std::sync::Arc;

use burn::prelude::*;
use freebloom_core::KvMode;
use freebloom_samplers::{apply_guidance, guidance_enabled, DiffusionSampler};
use rayon::prelude::*;
use tracing::{debug, debug_span, info_span, warn};

use crate::config::AnimatorConfig;
use crate::control::{GenerationControl, SamplerEvent, SamplerObserver};
use crate::error::{AnimateError, ModelError};
use crate::model::{ContextKv, DenoisingModel, LayerKv};
use crate::noise::NoiseSeed;
use crate::prompt::Prompt;
use crate::rng::{self, Purpose};
use crate::smoothing::{anchor_blend, smooth_frames};
use crate::topology::{AttentionLinkSet, AttentionSource};

/// Timesteps shared by every frame of a batch, highest noise first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    timesteps: Vec<usize>,
}

impl Schedule {
    pub fn new(timesteps: Vec<usize>) -> Self {
        Self { timesteps }
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }
}

/// Latents of one frame at the start of every step, plus the final latent
#[derive(Debug, Clone)]
pub struct Trajectory<B: Backend> {
    frame: usize,
    text: Tensor<B, 3>,
    latents: Vec<Tensor<B, 4>>,
}

impl<B: Backend> Trajectory<B> {
    pub fn new(frame: usize, text: Tensor<B, 3>, latents: Vec<Tensor<B, 4>>) -> Self {
        Self {
            frame,
            text,
            latents,
        }
    }

    /// Global frame index the trajectory was sampled for
    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn text(&self) -> &Tensor<B, 3> {
        &self.text
    }

    /// Latent before step `step`; `step == steps` gives the final latent
    pub fn latent_at(&self, step: usize) -> Option<&Tensor<B, 4>> {
        self.latents.get(step)
    }

    /// Number of recorded states, `steps + 1` for a complete run
    pub fn len(&self) -> usize {
        self.latents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latents.is_empty()
    }
}

/// Where a frame slot starts
#[derive(Debug, Clone)]
pub enum SlotInit<B: Backend> {
    /// Sampled from this noise
    Seed(NoiseSeed<B>),
    /// Replays a recorded trajectory
    Pinned(Arc<Trajectory<B>>),
}

/// One frame of a batch
#[derive(Debug, Clone)]
pub struct FrameSlot<B: Backend> {
    pub prompt: Prompt,
    /// Text embedding `[1, tokens, dim]`
    pub text: Tensor<B, 3>,
    pub init: SlotInit<B>,
}

impl<B: Backend> FrameSlot<B> {
    pub fn is_pinned(&self) -> bool {
        matches!(self.init, SlotInit::Pinned(_))
    }
}

/// Which frames keep their latent trajectory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RecordPolicy {
    #[default]
    None,
    /// In-batch frame indices
    Frames(Vec<usize>),
    All,
}

impl RecordPolicy {
    fn records(&self, frame: usize) -> bool {
        match self {
            RecordPolicy::None => false,
            RecordPolicy::Frames(frames) => frames.contains(&frame),
            RecordPolicy::All => true,
        }
    }
}

/// Everything needed to sample one batch
pub struct BatchRequest<B: Backend> {
    pub batch_index: usize,
    pub slots: Vec<FrameSlot<B>>,
    pub links: AttentionLinkSet,
    /// Anchors from an earlier batch, read as [`AttentionSource::Carried`]
    pub carried: Vec<Arc<Trajectory<B>>>,
    /// Negative prompt embedding used for classifier-free guidance
    pub uncond: Option<Tensor<B, 3>>,
    pub record: RecordPolicy,
}

/// A finalized frame
#[derive(Debug, Clone)]
pub struct SampledFrame<B: Backend> {
    pub prompt: Prompt,
    pub text: Tensor<B, 3>,
    pub latent: Tensor<B, 4>,
    /// Initial noise, absent for pinned slots
    pub seed: Option<NoiseSeed<B>>,
    pub trajectory: Option<Arc<Trajectory<B>>>,
    pub pinned: bool,
}

/// Finalized frames of a batch, in slot order
#[derive(Debug, Clone)]
pub struct BatchOutput<B: Backend> {
    pub batch_index: usize,
    pub frames: Vec<SampledFrame<B>>,
}

/// Per-batch sampling options
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerSettings {
    pub guidance_scale: f32,
    pub kv_mode: KvMode,
    pub smoothing_blend_factor: f32,
    /// Pull toward the batch's first frame, applied while `step < anchor_blend_steps`
    pub anchor_blend_weight: f32,
    pub anchor_blend_steps: usize,
    pub parallel_frames: bool,
    pub seed: u64,
}

impl SamplerSettings {
    pub fn from_config(config: &AnimatorConfig) -> Self {
        Self {
            guidance_scale: config.guidance_scale,
            kv_mode: config.kv_mode,
            smoothing_blend_factor: config.smoothing_blend_factor,
            anchor_blend_weight: config.anchor_blend_weight,
            anchor_blend_steps: config.anchor_blend_steps,
            parallel_frames: config.parallel_frames,
            seed: config.seed,
        }
    }
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self::from_config(&AnimatorConfig::default())
    }
}

/// Run `f` for `0..n`, in parallel when asked, collecting in index order
fn fork_join<T, F>(parallel: bool, n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Send + Sync,
{
    if parallel {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

/// First error in index order, or all values
fn first_error<T>(results: Vec<Result<T, AnimateError>>) -> Result<Vec<T>, AnimateError> {
    results.into_iter().collect()
}

/// Synchronized denoising loop over a frozen model
pub struct ConsistentAttentionSampler<B: Backend> {
    model: Arc<dyn DenoisingModel<B>>,
    sampler: Arc<dyn DiffusionSampler<B>>,
    settings: SamplerSettings,
    control: GenerationControl,
    observer: Option<Arc<dyn SamplerObserver>>,
    device: B::Device,
}

impl<B: Backend> ConsistentAttentionSampler<B> {
    pub fn new(
        model: Arc<dyn DenoisingModel<B>>,
        sampler: Arc<dyn DiffusionSampler<B>>,
        settings: SamplerSettings,
        device: &B::Device,
    ) -> Self {
        Self {
            model,
            sampler,
            settings,
            control: GenerationControl::new(),
            observer: None,
            device: device.clone(),
        }
    }

    pub fn with_control(mut self, control: GenerationControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SamplerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn schedule(&self) -> Schedule {
        Schedule::new(self.sampler.timesteps().to_vec())
    }

    pub fn model(&self) -> &dyn DenoisingModel<B> {
        self.model.as_ref()
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn control(&self) -> &GenerationControl {
        &self.control
    }

    pub(crate) fn emit(&self, event: SamplerEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }

    fn validate(&self, request: &BatchRequest<B>, steps: usize) -> Result<(), AnimateError> {
        let n = request.slots.len();
        if n == 0 {
            return Err(AnimateError::InvalidBatch("batch has no frames".into()));
        }
        if request.links.len() != n {
            return Err(AnimateError::InvalidBatch(format!(
                "link set covers {} frames, batch has {n}",
                request.links.len()
            )));
        }
        for i in 0..n {
            for source in request.links.sources(i) {
                let valid = match *source {
                    AttentionSource::Frame(j) => j < n && j != i,
                    AttentionSource::Carried(k) => k < request.carried.len(),
                };
                if !valid {
                    return Err(AnimateError::InvalidBatch(format!(
                        "frame {i} links to unknown source {source:?}"
                    )));
                }
            }
        }

        let pinned = request.slots.iter().filter_map(|slot| match &slot.init {
            SlotInit::Pinned(trajectory) => Some(trajectory),
            SlotInit::Seed(_) => None,
        });
        for trajectory in pinned.chain(&request.carried) {
            if trajectory.len() != steps + 1 {
                return Err(AnimateError::InvalidBatch(format!(
                    "trajectory of frame {} has {} states, schedule needs {}",
                    trajectory.frame(),
                    trajectory.len(),
                    steps + 1
                )));
            }
        }
        Ok(())
    }

    fn inference_error(
        &self,
        batch: usize,
        frame: usize,
        step: usize,
        timestep: usize,
        source: ModelError,
    ) -> AnimateError {
        AnimateError::ModelInference {
            batch,
            frame,
            step: Some(step),
            timestep: Some(timestep),
            source,
        }
    }

    fn capture(
        &self,
        latent: &Tensor<B, 4>,
        text: &Tensor<B, 3>,
        step: usize,
        timestep: usize,
    ) -> Result<LayerKv<B>, ModelError> {
        let input = self.sampler.scale_model_input(latent.clone(), step);
        self.model.attention_kv(input, timestep, text)
    }

    fn predict(
        &self,
        latent: &Tensor<B, 4>,
        text: &Tensor<B, 3>,
        uncond: Option<&Tensor<B, 3>>,
        context: Option<&ContextKv<B>>,
        step: usize,
        timestep: usize,
    ) -> Result<Tensor<B, 4>, ModelError> {
        let input = self.sampler.scale_model_input(latent.clone(), step);
        let cond = self.model.predict_noise(input.clone(), timestep, text, context)?;

        match uncond {
            Some(uncond) if guidance_enabled(self.settings.guidance_scale) => {
                let uncond = self.model.predict_noise(input, timestep, uncond, context)?;
                Ok(apply_guidance(uncond, cond, self.settings.guidance_scale))
            }
            _ => Ok(cond),
        }
    }

    /// Sample one batch to completion
    ///
    /// Any model failure aborts the whole batch. Cancellation is checked once
    /// per step, before any work of that step starts.
    pub fn run(&self, request: BatchRequest<B>) -> Result<BatchOutput<B>, AnimateError> {
        let schedule = self.schedule();
        let steps = schedule.len();
        self.validate(&request, steps)?;

        let batch = request.batch_index;
        let n = request.slots.len();
        let span = info_span!("batch", batch, frames = n, steps);
        let _guard = span.enter();

        self.emit(SamplerEvent::BatchStarted {
            batch,
            frames: n,
            steps,
        });
        self.control.add_planned_steps(steps);

        let slots = &request.slots;
        let pinned: Vec<bool> = slots.iter().map(FrameSlot::is_pinned).collect();
        let active: Vec<usize> = (0..n).filter(|&i| !pinned[i]).collect();
        let context_frames = request.links.referenced_frames();
        let init_sigma = self.sampler.init_noise_sigma();

        let mut latents: Vec<Tensor<B, 4>> = slots
            .iter()
            .map(|slot| match &slot.init {
                SlotInit::Seed(seed) => seed.tensor().clone() * init_sigma,
                SlotInit::Pinned(trajectory) => trajectory.latents[0].clone(),
            })
            .collect();

        let mut recorded: Vec<Option<Vec<Tensor<B, 4>>>> = (0..n)
            .map(|i| {
                (request.record.records(i) && !pinned[i]).then(|| {
                    let mut states = Vec::with_capacity(steps + 1);
                    states.push(latents[i].clone());
                    states
                })
            })
            .collect();

        debug!(active = active.len(), context = context_frames.len(), "batch initialized");

        for (step, &timestep) in schedule.timesteps().iter().enumerate() {
            if self.control.is_cancelled() {
                warn!(step, "cancelled at timestep barrier");
                return Err(AnimateError::Cancelled { batch, step });
            }
            let _step_span = debug_span!("step", step, timestep).entered();

            // Phase 1: keys/values of context frames, from the step's snapshot
            let captured = fork_join(self.settings.parallel_frames, context_frames.len(), |k| {
                let j = context_frames[k];
                self.capture(&latents[j], &slots[j].text, step, timestep)
                    .map_err(|e| self.inference_error(batch, slots[j].prompt.index(), step, timestep, e))
            });
            let mut frame_kv: Vec<Option<LayerKv<B>>> = (0..n).map(|_| None).collect();
            for (&j, kv) in context_frames.iter().zip(first_error(captured)?) {
                frame_kv[j] = Some(kv);
            }

            let carried_kv = request
                .carried
                .iter()
                .map(|trajectory| {
                    let latent = &trajectory.latents[step];
                    self.capture(latent, trajectory.text(), step, timestep)
                        .map_err(|e| self.inference_error(batch, trajectory.frame(), step, timestep, e))
                })
                .collect::<Result<Vec<_>, _>>()?;

            // Phase 2: noise predictions of free frames
            let predictions = fork_join(self.settings.parallel_frames, active.len(), |k| {
                let i = active[k];
                let frame = slots[i].prompt.index();
                self.emit(SamplerEvent::PredictionStarted { batch, step, frame: i });

                let sources: Vec<&LayerKv<B>> = request
                    .links
                    .sources(i)
                    .iter()
                    .filter_map(|source| match *source {
                        AttentionSource::Frame(j) => frame_kv[j].as_ref(),
                        AttentionSource::Carried(c) => carried_kv.get(c),
                    })
                    .collect();

                let result = ContextKv::from_sources(&sources, self.settings.kv_mode)
                    .and_then(|context| {
                        self.predict(
                            &latents[i],
                            &slots[i].text,
                            request.uncond.as_ref(),
                            context.as_ref(),
                            step,
                            timestep,
                        )
                    })
                    .map_err(|e| self.inference_error(batch, frame, step, timestep, e));

                self.emit(SamplerEvent::PredictionFinished { batch, step, frame: i });
                result
            });
            let predictions = first_error(predictions)?;

            self.emit(SamplerEvent::Barrier { batch, step });

            // Phase 3: advance free frames from their pre-step latents
            let stochastic = self.sampler.is_stochastic();
            let inputs: Vec<(usize, Tensor<B, 4>)> = active.iter().copied().zip(predictions).collect();
            let advanced = fork_join(self.settings.parallel_frames, inputs.len(), |k| {
                let (i, pred) = &inputs[k];
                let noise = stochastic.then(|| {
                    let frame = slots[*i].prompt.index() as u64;
                    let mut rng = rng::stream(
                        self.settings.seed,
                        Purpose::Step,
                        batch as u64,
                        (frame << 32) | step as u64,
                    );
                    rng::gaussian(&mut rng, latents[*i].dims(), &self.device)
                });
                self.sampler.step(latents[*i].clone(), pred.clone(), step, noise)
            });

            for ((i, _), latent) in inputs.iter().zip(advanced) {
                latents[*i] = latent;
            }
            for (i, slot) in slots.iter().enumerate() {
                if let SlotInit::Pinned(trajectory) = &slot.init {
                    latents[i] = trajectory.latents[step + 1].clone();
                }
            }

            if step < self.settings.anchor_blend_steps {
                anchor_blend(&mut latents, self.settings.anchor_blend_weight, &pinned);
            }
            smooth_frames(&mut latents, self.settings.smoothing_blend_factor, &pinned);

            for i in 0..n {
                if let Some(states) = recorded[i].as_mut() {
                    states.push(latents[i].clone());
                }
                self.emit(SamplerEvent::FrameAdvanced { batch, step, frame: i });
            }

            self.control.step_completed();
            self.emit(SamplerEvent::StepCompleted {
                batch,
                step,
                timestep,
            });
        }

        self.emit(SamplerEvent::BatchFinalized { batch });
        debug!("batch finalized");

        let frames = request
            .slots
            .into_iter()
            .zip(latents)
            .zip(recorded)
            .map(|((slot, latent), states)| {
                let frame = slot.prompt.index();
                let (seed, trajectory, pinned) = match slot.init {
                    SlotInit::Seed(seed) => (
                        Some(seed),
                        states.map(|states| Arc::new(Trajectory::new(frame, slot.text.clone(), states))),
                        false,
                    ),
                    SlotInit::Pinned(trajectory) => (None, Some(trajectory), true),
                };
                SampledFrame {
                    prompt: slot.prompt,
                    text: slot.text,
                    latent,
                    seed,
                    trajectory,
                    pinned,
                }
            })
            .collect();

        Ok(BatchOutput {
            batch_index: batch,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::AttentionTopology;
    use burn_ndarray::NdArray;
    use freebloom_core::FrameKv;
    use freebloom_samplers::SamplerKind;
    use std::sync::Mutex;

    type TestBackend = NdArray<f32>;

    /// Predicts a fixed fraction of the latent plus the mean of any injected values
    struct EchoModel;

    impl DenoisingModel<TestBackend> for EchoModel {
        fn latent_channels(&self) -> usize {
            2
        }

        fn encode_text(&self, prompt: &str) -> Result<Tensor<TestBackend, 3>, ModelError> {
            Ok(Tensor::full([1, 1, 2], prompt.len() as f32, &Default::default()))
        }

        fn attention_kv(
            &self,
            latent: Tensor<TestBackend, 4>,
            _timestep: usize,
            _text: &Tensor<TestBackend, 3>,
        ) -> Result<LayerKv<TestBackend>, ModelError> {
            let [_, c, h, w] = latent.dims();
            let tokens = latent.reshape([1, 1, c, h * w]).swap_dims(2, 3);
            Ok(vec![FrameKv::new(tokens.clone(), tokens)])
        }

        fn predict_noise(
            &self,
            latent: Tensor<TestBackend, 4>,
            _timestep: usize,
            _text: &Tensor<TestBackend, 3>,
            context: Option<&ContextKv<TestBackend>>,
        ) -> Result<Tensor<TestBackend, 4>, ModelError> {
            let shift: f32 = context
                .map(|ctx| ctx.layers[0].value.clone().mean().into_scalar())
                .unwrap_or(0.0);
            Ok(latent * 0.1 + shift * 0.05)
        }
    }

    fn sampler(steps: usize, parallel: bool) -> ConsistentAttentionSampler<TestBackend> {
        let settings = SamplerSettings {
            guidance_scale: 1.0,
            smoothing_blend_factor: 0.0,
            parallel_frames: parallel,
            ..Default::default()
        };
        ConsistentAttentionSampler::new(
            Arc::new(EchoModel),
            Arc::from(SamplerKind::Ddim.build::<TestBackend>(steps, 0.0)),
            settings,
            &Default::default(),
        )
    }

    fn request(values: &[f32], topology: AttentionTopology) -> BatchRequest<TestBackend> {
        let device = Default::default();
        let slots = values
            .iter()
            .enumerate()
            .map(|(i, &v)| FrameSlot {
                prompt: Prompt::new(i, "frame"),
                text: Tensor::zeros([1, 1, 2], &device),
                init: SlotInit::Seed(NoiseSeed::new(i, Tensor::full([1, 2, 2, 2], v, &device))),
            })
            .collect();
        BatchRequest {
            batch_index: 0,
            slots,
            links: AttentionLinkSet::build(topology, values.len(), 0),
            carried: vec![],
            uncond: None,
            record: RecordPolicy::All,
        }
    }

    fn anchored_sampler(steps: usize, weight: f32, active_steps: usize) -> ConsistentAttentionSampler<TestBackend> {
        let settings = SamplerSettings {
            guidance_scale: 1.0,
            smoothing_blend_factor: 0.0,
            anchor_blend_weight: weight,
            anchor_blend_steps: active_steps,
            parallel_frames: false,
            ..Default::default()
        };
        ConsistentAttentionSampler::new(
            Arc::new(EchoModel),
            Arc::from(SamplerKind::Ddim.build::<TestBackend>(steps, 0.0)),
            settings,
            &Default::default(),
        )
    }

    fn first(t: &Tensor<TestBackend, 4>) -> f32 {
        t.clone().into_data().to_vec::<f32>().unwrap()[0]
    }

    #[test]
    fn test_records_full_trajectory() {
        let out = sampler(4, false)
            .run(request(&[1.0, 1.0], AttentionTopology::AnchorFirst))
            .unwrap();

        assert_eq!(out.frames.len(), 2);
        let trajectory = out.frames[1].trajectory.as_ref().unwrap();
        assert_eq!(trajectory.len(), 5);
        assert_eq!(first(trajectory.latent_at(4).unwrap()), first(&out.frames[1].latent));
    }

    #[test]
    fn test_anchor_blend_pulls_early_steps_toward_first_frame() {
        let values = [0.0, 4.0, -2.0];
        let plain = anchored_sampler(4, 0.0, 10)
            .run(request(&values, AttentionTopology::AnchorFirst))
            .unwrap();
        let anchored = anchored_sampler(4, 0.5, 2)
            .run(request(&values, AttentionTopology::AnchorFirst))
            .unwrap();

        let state = |out: &BatchOutput<TestBackend>, frame: usize, step: usize| {
            first(out.frames[frame].trajectory.as_ref().unwrap().latent_at(step).unwrap())
        };
        for frame in 1..3 {
            let plain_gap = (state(&plain, frame, 1) - state(&plain, 0, 1)).abs();
            let anchored_gap = (state(&anchored, frame, 1) - state(&anchored, 0, 1)).abs();
            assert!((anchored_gap - 0.5 * plain_gap).abs() < 1e-4, "frame {frame}");
        }
        assert_eq!(state(&plain, 0, 4), state(&anchored, 0, 4));
    }

    #[test]
    fn test_anchor_blend_inactive_outside_its_steps() {
        let values = [0.5, -1.5];
        let plain = anchored_sampler(3, 0.0, 10)
            .run(request(&values, AttentionTopology::AnchorFirst))
            .unwrap();
        let late = anchored_sampler(3, 0.9, 0)
            .run(request(&values, AttentionTopology::AnchorFirst))
            .unwrap();

        for (a, b) in plain.frames.iter().zip(&late.frames) {
            assert_eq!(first(&a.latent), first(&b.latent));
        }
    }

    #[test]
    fn test_run_follows_schedule() {
        let sampler = sampler(6, false);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sampler = sampler.with_observer(Arc::new(move |event: &SamplerEvent| {
            if let SamplerEvent::StepCompleted { timestep, .. } = event {
                sink.lock().unwrap().push(*timestep);
            }
        }));
        sampler
            .run(request(&[1.0, 2.0], AttentionTopology::AnchorFirst))
            .unwrap();

        assert_eq!(sampler.schedule().len(), 6);
        assert_eq!(*events.lock().unwrap(), sampler.schedule().timesteps());
        assert_eq!(sampler.schedule().timesteps()[0], 999);
    }

    #[test]
    fn test_context_changes_linked_frames_only() {
        let plain = sampler(3, false)
            .run(request(&[1.0, 1.0], AttentionTopology::AnchorFirst))
            .unwrap();
        let shifted = sampler(3, false)
            .run(request(&[5.0, 1.0], AttentionTopology::AnchorFirst))
            .unwrap();

        // Frame 1 reads frame 0, so its result depends on frame 0's noise
        assert_ne!(first(&plain.frames[1].latent), first(&shifted.frames[1].latent));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let seq = sampler(5, false)
            .run(request(&[0.3, -0.7, 1.1, 0.2], AttentionTopology::Full))
            .unwrap();
        let par = sampler(5, true)
            .run(request(&[0.3, -0.7, 1.1, 0.2], AttentionTopology::Full))
            .unwrap();

        for (a, b) in seq.frames.iter().zip(&par.frames) {
            let a: Vec<f32> = a.latent.clone().into_data().to_vec().unwrap();
            let b: Vec<f32> = b.latent.clone().into_data().to_vec().unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_pinned_slot_replays_trajectory() {
        let first_run = sampler(3, false)
            .run(request(&[0.4, 0.9], AttentionTopology::Chain))
            .unwrap();
        let recorded = first_run.frames[0].trajectory.clone().unwrap();

        let mut req = request(&[0.0, 0.9], AttentionTopology::Chain);
        req.slots[0].init = SlotInit::Pinned(recorded.clone());
        let second = sampler(3, false).run(req).unwrap();

        assert!(second.frames[0].pinned);
        assert!(second.frames[0].seed.is_none());
        assert_eq!(first(&second.frames[0].latent), first(recorded.latent_at(3).unwrap()));
        // Frame 1 saw the same context both times
        assert_eq!(first(&second.frames[1].latent), first(&first_run.frames[1].latent));
    }

    #[test]
    fn test_short_trajectory_rejected() {
        let device = Default::default();
        let short = Arc::new(Trajectory::new(
            0,
            Tensor::zeros([1, 1, 2], &device),
            vec![Tensor::zeros([1, 2, 2, 2], &device)],
        ));
        let mut req = request(&[0.0, 0.0], AttentionTopology::AnchorFirst);
        req.carried.push(short);

        assert!(matches!(
            sampler(3, false).run(req),
            Err(AnimateError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_link_to_missing_carried_anchor_rejected() {
        let mut req = request(&[0.0, 0.0], AttentionTopology::AnchorFirst);
        req.links = AttentionLinkSet::build(AttentionTopology::AnchorFirst, 2, 1);

        assert!(matches!(
            sampler(2, false).run(req),
            Err(AnimateError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_barrier_events_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let sampler = sampler(2, true).with_observer(Arc::new(move |e: &SamplerEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        sampler
            .run(request(&[0.1, 0.2, 0.3], AttentionTopology::AnchorFirst))
            .unwrap();

        let events = events.lock().unwrap();
        for step in 0..2 {
            let barrier = events
                .iter()
                .position(|e| *e == SamplerEvent::Barrier { batch: 0, step })
                .unwrap();
            assert!(events.iter().enumerate().all(|(pos, e)| match e {
                SamplerEvent::PredictionFinished { step: s, .. } if *s == step => pos < barrier,
                SamplerEvent::FrameAdvanced { step: s, .. } if *s == step => pos > barrier,
                _ => true,
            }));
        }
        assert_eq!(events.last(), Some(&SamplerEvent::BatchFinalized { batch: 0 }));
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let control = GenerationControl::new();
        control.cancel();
        let sampler = sampler(3, false).with_control(control);

        assert!(matches!(
            sampler.run(request(&[0.0], AttentionTopology::AnchorFirst)),
            Err(AnimateError::Cancelled { batch: 0, step: 0 })
        ));
    }
}
