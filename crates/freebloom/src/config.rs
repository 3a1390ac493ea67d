//! Animator configuration
//!
//! Loaded from TOML with every field optional:
//!
//! ```toml
//! frame-count = 16
//! batch-size = 8
//! noise-sharing = "shared-base"
//! epsilon = 0.2
//! attention-topology = "anchor-first"
//! overlap-size = 1
//! schedule-length = 25
//! smoothing-blend-factor = 0.05
//! seed = 42
//! ```

use std::path::Path;

use freebloom_core::KvMode;
use freebloom_samplers::{SamplerKind, SD1X_TRAIN_STEPS};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::noise::{LatentShape, MixedSplit, NoiseSharing};
use crate::topology::AttentionTopology;

/// All recognized animator options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct AnimatorConfig {
    /// Total frames to produce (M)
    pub frame_count: usize,
    /// Frames sampled together under one schedule (N)
    pub batch_size: usize,
    /// How initial noise is correlated across frames
    pub noise_sharing: NoiseSharing,
    /// Per-frame residual share in `[0, 1]`
    pub epsilon: f32,
    /// Which frames each frame attends to
    pub attention_topology: AttentionTopology,
    /// How injected keys/values combine with a frame's own
    pub kv_mode: KvMode,
    /// Frames repeated across a batch boundary
    pub overlap_size: usize,
    /// Number of diffusion steps
    pub schedule_length: usize,
    pub sampler: SamplerKind,
    /// Sampler stochasticity (DDIM η, ancestral η)
    pub eta: f32,
    /// Classifier-free guidance scale, 1.0 disables the unconditional pass
    pub guidance_scale: f32,
    pub negative_prompt: String,
    /// Neighbour blend applied after each step, 0.0 disables smoothing
    pub smoothing_blend_factor: f32,
    /// Pull of every frame towards frame 0 during the first steps, 0.0 disables it
    pub anchor_blend_weight: f32,
    /// Steps the anchor blend stays active
    pub anchor_blend_steps: usize,
    pub seed: u64,
    /// Run per-frame work on the rayon pool
    pub parallel_frames: bool,
    /// Frames inserted by interpolation refinement (single-batch clips only)
    pub interpolation_passes: usize,
    /// Fresh noise share of interpolated frames
    pub interpolation_noise_ratio: f32,
    pub latent_channels: usize,
    pub latent_height: usize,
    pub latent_width: usize,
    /// Which components are shared under [`NoiseSharing::Mixed`]
    pub mixed_split: MixedSplit,
}

impl Default for AnimatorConfig {
    fn default() -> Self {
        Self {
            frame_count: 16,
            batch_size: 8,
            noise_sharing: NoiseSharing::SharedBase,
            epsilon: 0.2,
            mixed_split: MixedSplit::default(),
            attention_topology: AttentionTopology::AnchorFirst,
            kv_mode: KvMode::Augment,
            overlap_size: 1,
            schedule_length: 25,
            sampler: SamplerKind::Ddim,
            eta: 0.0,
            guidance_scale: 7.5,
            negative_prompt: String::new(),
            smoothing_blend_factor: 0.05,
            anchor_blend_weight: 0.0,
            anchor_blend_steps: 10,
            seed: 0,
            parallel_frames: true,
            interpolation_passes: 0,
            interpolation_noise_ratio: 0.2,
            latent_channels: 4,
            latent_height: 8,
            latent_width: 8,
        }
    }
}

fn unit_range(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfUnitRange { name, value })
    }
}

impl AnimatorConfig {
    /// Parse a TOML document, then validate it
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn latent_shape(&self) -> LatentShape {
        LatentShape::new(self.latent_channels, self.latent_height, self.latent_width)
    }

    /// Whether the clip spans more than one batch
    pub fn is_chained(&self) -> bool {
        self.frame_count > self.batch_size
    }

    /// Reject any option outside its valid range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_count == 0 {
            return Err(ConfigError::InvalidFrameCount);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if !(0.0..=1.0).contains(&self.epsilon) {
            return Err(ConfigError::EpsilonOutOfRange(self.epsilon));
        }
        if self.overlap_size >= self.batch_size {
            return Err(ConfigError::OverlapTooLarge {
                overlap: self.overlap_size,
                batch_size: self.batch_size,
            });
        }
        if self.schedule_length == 0 {
            return Err(ConfigError::InvalidScheduleLength);
        }
        if self.schedule_length > SD1X_TRAIN_STEPS {
            return Err(ConfigError::ScheduleTooLong {
                length: self.schedule_length,
                max: SD1X_TRAIN_STEPS,
            });
        }
        unit_range("smoothing-blend-factor", self.smoothing_blend_factor)?;
        unit_range("anchor-blend-weight", self.anchor_blend_weight)?;
        unit_range("interpolation-noise-ratio", self.interpolation_noise_ratio)?;
        unit_range("eta", self.eta)?;

        if !self.negative_prompt.is_empty() && self.guidance_scale < 1.0 {
            return Err(ConfigError::GuidanceTooLow(self.guidance_scale));
        }

        let shape = self.latent_shape();
        if shape.channels == 0 || shape.height == 0 || shape.width == 0 {
            return Err(ConfigError::InvalidLatentShape {
                channels: shape.channels,
                height: shape.height,
                width: shape.width,
            });
        }
        if self.noise_sharing == NoiseSharing::Mixed {
            self.mixed_split.validate(shape)?;
        }

        if self.interpolation_passes > 0 && self.is_chained() {
            return Err(ConfigError::InterpolationNeedsSingleBatch {
                frame_count: self.frame_count,
                batch_size: self.batch_size,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AnimatorConfig::default();
        config.validate().unwrap();
        assert!(config.is_chained());
        assert_eq!(config.latent_shape().dims(), [1, 4, 8, 8]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AnimatorConfig::from_toml_str(
            r#"
            frame-count = 8
            noise-sharing = "independent"
            attention-topology = "chain"
            kv-mode = "replace"
            sampler = "euler-ancestral"
            eta = 1.0
            "#,
        )
        .unwrap();

        assert_eq!(config.frame_count, 8);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.noise_sharing, NoiseSharing::Independent);
        assert_eq!(config.attention_topology, AttentionTopology::Chain);
        assert_eq!(config.kv_mode, KvMode::Replace);
        assert_eq!(config.sampler, SamplerKind::EulerAncestral);
        assert!(!config.is_chained());
    }

    #[test]
    fn test_mixed_split_from_toml() {
        let config = AnimatorConfig::from_toml_str(
            r#"
            noise-sharing = "mixed"
            mixed-split = { channels = [0, 1] }
            "#,
        )
        .unwrap();
        assert_eq!(config.mixed_split, MixedSplit::Channels(vec![0, 1]));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = AnimatorConfig::from_toml_str("frames = 8").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_epsilon_out_of_range() {
        let config = AnimatorConfig {
            epsilon: 1.2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EpsilonOutOfRange(_))
        ));
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let no_frames = AnimatorConfig {
            frame_count: 0,
            ..Default::default()
        };
        assert!(matches!(no_frames.validate(), Err(ConfigError::InvalidFrameCount)));

        let no_batch = AnimatorConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(no_batch.validate(), Err(ConfigError::InvalidBatchSize)));

        let no_steps = AnimatorConfig {
            schedule_length: 0,
            ..Default::default()
        };
        assert!(matches!(no_steps.validate(), Err(ConfigError::InvalidScheduleLength)));
    }

    #[test]
    fn test_schedule_longer_than_training_rejected() {
        let longest = AnimatorConfig {
            schedule_length: 1000,
            ..Default::default()
        };
        longest.validate().unwrap();

        let too_long = AnimatorConfig {
            schedule_length: 1001,
            ..Default::default()
        };
        assert!(matches!(
            too_long.validate(),
            Err(ConfigError::ScheduleTooLong { length: 1001, max: 1000 })
        ));
    }

    #[test]
    fn test_anchor_blend_from_toml() {
        let config = AnimatorConfig::from_toml_str(
            r#"
            anchor-blend-weight = 0.3
            anchor-blend-steps = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.anchor_blend_weight, 0.3);
        assert_eq!(config.anchor_blend_steps, 5);

        let err = AnimatorConfig::from_toml_str("anchor-blend-weight = 1.5").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfUnitRange { name: "anchor-blend-weight", .. }
        ));
    }

    #[test]
    fn test_overlap_must_leave_room_for_new_frames() {
        let config = AnimatorConfig {
            batch_size: 4,
            overlap_size: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OverlapTooLarge { overlap: 4, batch_size: 4 })
        ));
    }

    #[test]
    fn test_interpolation_requires_single_batch() {
        let config = AnimatorConfig {
            frame_count: 12,
            batch_size: 8,
            interpolation_passes: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InterpolationNeedsSingleBatch { .. })
        ));
    }

    #[test]
    fn test_mixed_split_must_divide_latent() {
        let config = AnimatorConfig {
            noise_sharing: NoiseSharing::Mixed,
            mixed_split: MixedSplit::LowFrequency { factor: 3 },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMixedSplit(_))
        ));
    }

    #[test]
    fn test_negative_prompt_needs_guidance() {
        let config = AnimatorConfig {
            negative_prompt: "blurry".into(),
            guidance_scale: 0.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::GuidanceTooLow(_))));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let config = AnimatorConfig {
            seed: 7,
            frame_count: 8,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("animator.toml");
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        assert_eq!(AnimatorConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = AnimatorConfig::from_file("/nonexistent/animator.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/animator.toml"));
    }
}
