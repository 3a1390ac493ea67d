//! Cancellation and progress reporting
//!
//! [`GenerationControl`] is a cloneable handle shared between the caller and a
//! running animation. Cancellation is only honoured at timestep barriers, so a
//! cancelled batch never stops half advanced.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Control handle for a running animation
#[derive(Clone, Debug)]
pub struct GenerationControl {
    /// Set to true to request cancellation
    cancelled: Arc<AtomicBool>,
    /// Steps completed across all batches
    completed_steps: Arc<AtomicUsize>,
    /// Steps planned across all batches
    total_steps: Arc<AtomicUsize>,
}

impl GenerationControl {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            completed_steps: Arc::new(AtomicUsize::new(0)),
            total_steps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Request cancellation at the next timestep barrier
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn completed_steps(&self) -> usize {
        self.completed_steps.load(Ordering::SeqCst)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps.load(Ordering::SeqCst)
    }

    /// Progress as a fraction (0.0 - 1.0)
    pub fn progress(&self) -> f32 {
        let total = self.total_steps();
        if total == 0 {
            return 0.0;
        }
        self.completed_steps() as f32 / total as f32
    }

    pub(crate) fn add_planned_steps(&self, steps: usize) {
        self.total_steps.fetch_add(steps, Ordering::SeqCst);
    }

    pub(crate) fn step_completed(&self) {
        self.completed_steps.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for GenerationControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress of a batch through its schedule
///
/// Within one batch, events of step `s` are ordered: every
/// `PredictionFinished` precedes `Barrier`, which precedes every
/// `FrameAdvanced`, which precede `StepCompleted`. Prediction events of
/// different frames may interleave when frames run in parallel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerEvent {
    BatchStarted { batch: usize, frames: usize, steps: usize },
    PredictionStarted { batch: usize, step: usize, frame: usize },
    PredictionFinished { batch: usize, step: usize, frame: usize },
    /// All predictions of `step` are done
    Barrier { batch: usize, step: usize },
    FrameAdvanced { batch: usize, step: usize, frame: usize },
    StepCompleted { batch: usize, step: usize, timestep: usize },
    BatchFinalized { batch: usize },
    FrameDecoded { batch: usize, frame: usize },
}

/// Receives sampler events, possibly from several threads at once
pub trait SamplerObserver: Send + Sync {
    fn on_event(&self, event: &SamplerEvent);
}

impl<F> SamplerObserver for F
where
    F: Fn(&SamplerEvent) + Send + Sync,
{
    fn on_event(&self, event: &SamplerEvent) {
        self(event)
    }
}
