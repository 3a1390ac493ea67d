//! Latent preview decoder
//!
//! Projects 4-channel latents to RGB with a fixed linear map, then upscales by
//! pixel repetition. Good enough to inspect motion and consistency without a
//! VAE.

use burn::prelude::*;

use crate::error::ModelError;
use crate::model::FrameDecoder;

/// Latent-to-RGB coefficients `[channels, 3]` of the SD 1.x latent space
const SD15_RGB_COEFS: [f32; 12] = [
    0.3512, 0.2297, 0.3227, //
    0.3250, 0.4974, 0.2350, //
    -0.2829, 0.1762, 0.2721, //
    -0.2120, -0.2616, -0.7177,
];

/// Linear latent-space preview
#[derive(Debug, Clone, Copy)]
pub struct PreviewDecoder {
    /// Output pixels per latent pixel along each axis
    pub scale: usize,
}

impl Default for PreviewDecoder {
    fn default() -> Self {
        Self { scale: 8 }
    }
}

impl PreviewDecoder {
    pub fn new(scale: usize) -> Self {
        Self { scale: scale.max(1) }
    }
}

impl<B: Backend> FrameDecoder<B> for PreviewDecoder {
    fn decode(&self, latent: Tensor<B, 4>) -> Result<Tensor<B, 4>, ModelError> {
        let [b, c, h, w] = latent.dims();
        if c != 4 {
            return Err(ModelError::ShapeMismatch {
                expected: vec![b, 4, h, w],
                actual: vec![b, c, h, w],
            });
        }
        let device = latent.device();

        let coefs: Tensor<B, 3> =
            Tensor::<B, 2>::from_data(TensorData::new(SD15_RGB_COEFS.to_vec(), [4, 3]), &device)
                .unsqueeze::<3>()
                .repeat_dim(0, b);

        // einsum "cxy,cr -> rxy"
        let flat = latent.reshape([b, c, h * w]).swap_dims(1, 2); // [B, H*W, C]
        let rgb = flat.matmul(coefs).swap_dims(1, 2).reshape([b, 3, h, w]);
        let rgb = (rgb + 0.5).clamp(0.0, 1.0);

        if self.scale == 1 {
            return Ok(rgb);
        }
        let s = self.scale;
        Ok(rgb
            .reshape([b, 3, h, 1, w, 1])
            .repeat_dim(3, s)
            .repeat_dim(5, s)
            .reshape([b, 3, h * s, w * s]))
    }
}
