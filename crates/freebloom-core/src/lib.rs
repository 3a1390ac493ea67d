//! Core Building Blocks for Consistent Multi-Frame Diffusion
//!
//! Shared tensor components used by the freebloom animator.
//!
//! # Modules
//!
//! - [`attention`] - Multi-head scaled dot-product attention
//! - [`frame_attention`] - Attention with key/value capture and cross-frame injection
//! - [`frame_interpolation`] - Latent blending and frame distance utilities
//!
//! # Example
//!
//! ```ignore
//! use freebloom_core::frame_attention::{FrameAttentionConfig, FrameKv, KvMode};
//!
//! let attn = FrameAttentionConfig::new(320, 8).init(&device);
//!
//! // Capture the anchor frame's keys/values, then let another frame read them
//! let anchor_kv = attn.project_kv(anchor_tokens);
//! let out = attn.forward(frame_tokens, Some(&anchor_kv), KvMode::Augment);
//! ```

pub mod attention;
pub mod frame_attention;
pub mod frame_interpolation;

pub use frame_attention::{
    FrameAttention, FrameAttentionConfig, FrameAttentionOutput, FrameAttentionWeights, FrameKv, KvMode,
    Projection,
};
