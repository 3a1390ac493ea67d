//! Error types for the animator
//!
//! Configuration problems are detected before any model call. Everything that
//! goes wrong during sampling aborts the whole batch and names the batch, frame
//! and step where it happened.

use std::path::PathBuf;

/// Invalid animator configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("frame count must be at least 1")]
    InvalidFrameCount,

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("epsilon must lie in [0, 1], got {0}")]
    EpsilonOutOfRange(f32),

    #[error("overlap {overlap} must be smaller than batch size {batch_size}")]
    OverlapTooLarge { overlap: usize, batch_size: usize },

    #[error("schedule length must be at least 1")]
    InvalidScheduleLength,

    #[error("schedule length {length} exceeds the {max} training timesteps")]
    ScheduleTooLong { length: usize, max: usize },

    #[error("{name} must lie in [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },

    #[error("guidance scale must be at least 1.0 when a negative prompt is set, got {0}")]
    GuidanceTooLow(f32),

    #[error("invalid mixed noise split: {0}")]
    InvalidMixedSplit(String),

    #[error("latent shape must be non-zero, got {channels}x{height}x{width}")]
    InvalidLatentShape {
        channels: usize,
        height: usize,
        width: usize,
    },

    #[error("model expects {model} latent channels, configuration has {config}")]
    LatentChannelMismatch { model: usize, config: usize },

    #[error("frame interpolation needs a single-batch clip ({frame_count} frames > batch size {batch_size})")]
    InterpolationNeedsSingleBatch {
        frame_count: usize,
        batch_size: usize,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reported by a [`DenoisingModel`](crate::model::DenoisingModel) or
/// [`FrameDecoder`](crate::model::FrameDecoder) implementation
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("text encoding failed: {0}")]
    TextEncoding(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("failed to load weights: {0}")]
    Weights(#[from] burn::record::RecorderError),
}

/// Failure of a [`PromptSequencer`](crate::prompt::PromptSequencer)
#[derive(Debug, thiserror::Error)]
pub enum SequencerError {
    #[error("failed to read prompt script {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid prompt script: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors produced while animating a prompt sequence
#[derive(Debug, thiserror::Error)]
pub enum AnimateError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("model failed on batch {batch}, frame {frame}{}: {source}", describe_step(.step, .timestep))]
    ModelInference {
        batch: usize,
        frame: usize,
        step: Option<usize>,
        timestep: Option<usize>,
        #[source]
        source: ModelError,
    },

    #[error("decoder failed on batch {batch}, frame {frame}: {source}")]
    Decode {
        batch: usize,
        frame: usize,
        #[source]
        source: ModelError,
    },

    #[error("prompt sequencer returned {actual} prompts, expected {expected}")]
    Sequencing { expected: usize, actual: usize },

    #[error("prompt sequencer failed: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("noise shape mismatch: expected {expected:?}, got {actual:?}")]
    NoiseShape {
        expected: [usize; 4],
        actual: [usize; 4],
    },

    #[error("batch {batch} cancelled before step {step}")]
    Cancelled { batch: usize, step: usize },

    #[error("invalid batch request: {0}")]
    InvalidBatch(String),
}

fn describe_step(step: &Option<usize>, timestep: &Option<usize>) -> String {
    match (*step, *timestep) {
        (Some(step), Some(t)) => format!(", step {step} (t={t})"),
        (Some(step), None) => format!(", step {step}"),
        _ => String::new(),
    }
}

impl AnimateError {
    /// Batch index the failure belongs to, when it happened inside a batch
    pub fn batch(&self) -> Option<usize> {
        match self {
            AnimateError::ModelInference { batch, .. }
            | AnimateError::Decode { batch, .. }
            | AnimateError::Cancelled { batch, .. } => Some(*batch),
            _ => None,
        }
    }

    /// Whether the error was raised before any model call
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            AnimateError::Configuration(_)
                | AnimateError::Sequencing { .. }
                | AnimateError::Sequencer(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_inference_names_location() {
        let err = AnimateError::ModelInference {
            batch: 1,
            frame: 3,
            step: Some(4),
            timestep: Some(760),
            source: ModelError::Inference("nan in attention".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("batch 1"));
        assert!(msg.contains("frame 3"));
        assert!(msg.contains("step 4 (t=760)"));
        assert_eq!(err.batch(), Some(1));
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_text_encoding_failure_has_no_step() {
        let err = AnimateError::ModelInference {
            batch: 0,
            frame: 2,
            step: None,
            timestep: None,
            source: ModelError::TextEncoding("empty vocabulary".into()),
        };
        assert!(!err.to_string().contains("step"));
    }

    #[test]
    fn test_sequencing_is_precondition() {
        let err = AnimateError::Sequencing {
            expected: 8,
            actual: 7,
        };
        assert!(err.is_precondition());
        assert!(err.to_string().contains("returned 7 prompts, expected 8"));
    }

    #[test]
    fn test_config_error_converts() {
        let err: AnimateError = ConfigError::EpsilonOutOfRange(1.5).into();
        assert!(err.to_string().contains("1.5"));
    }
}
