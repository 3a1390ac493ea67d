//! Decoded output frames

use burn::prelude::*;

use crate::error::ModelError;
use crate::prompt::Prompt;

/// One decoded frame of the output video
#[derive(Debug, Clone)]
pub struct DecodedFrame<B: Backend> {
    pub prompt: Prompt,
    /// RGB image `[1, 3, H, W]` in `[0, 1]`
    pub image: Tensor<B, 4>,
}

impl<B: Backend> DecodedFrame<B> {
    /// Global frame index
    pub fn index(&self) -> usize {
        self.prompt.index()
    }

    /// Image size as `(width, height)`
    pub fn size(&self) -> (usize, usize) {
        let [_, _, h, w] = self.image.dims();
        (w, h)
    }

    /// Interleaved 8-bit RGB pixels, row major
    pub fn to_rgb8(&self) -> Result<Vec<u8>, ModelError> {
        let [_, c, h, w] = self.image.dims();
        if c != 3 {
            return Err(ModelError::ShapeMismatch {
                expected: vec![1, 3, h, w],
                actual: self.image.dims().to_vec(),
            });
        }

        let floats: Vec<f32> = (self.image.clone().clamp(0.0, 1.0) * 255.0)
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| ModelError::Decode(format!("{e:?}")))?;

        let mut rgb = Vec::with_capacity(h * w * 3);
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    rgb.push(floats[c * h * w + y * w + x].round() as u8);
                }
            }
        }
        Ok(rgb)
    }
}

/// Mean absolute pixel difference between consecutive frames
///
/// Returns 0.0 for fewer than two frames.
pub fn mean_frame_difference<B: Backend>(frames: &[DecodedFrame<B>]) -> f32 {
    if frames.len() < 2 {
        return 0.0;
    }
    let total: f32 = frames
        .windows(2)
        .map(|pair| {
            let diff = (pair[0].image.clone() - pair[1].image.clone()).abs().mean();
            diff.into_scalar().elem::<f32>()
        })
        .sum();
    total / (frames.len() - 1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn frame(index: usize, value: f32) -> DecodedFrame<TestBackend> {
        DecodedFrame {
            prompt: Prompt::new(index, "test"),
            image: Tensor::full([1, 3, 2, 4], value, &Default::default()),
        }
    }

    #[test]
    fn test_rgb8_layout() {
        let device = Default::default();
        let image = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 0.5], &device).reshape([1, 3, 1, 1]);
        let frame = DecodedFrame {
            prompt: Prompt::new(0, "px"),
            image,
        };
        assert_eq!(frame.to_rgb8().unwrap(), vec![255, 0, 128]);
        assert_eq!(frame.size(), (1, 1));
    }

    #[test]
    fn test_rgb8_clamps() {
        let rgb = frame(0, 2.0).to_rgb8().unwrap();
        assert_eq!(rgb.len(), 2 * 4 * 3);
        assert!(rgb.iter().all(|&v| v == 255));
    }

    #[test]
    fn test_mean_frame_difference() {
        let frames = vec![frame(0, 0.0), frame(1, 0.5), frame(2, 0.5)];
        assert!((mean_frame_difference(&frames) - 0.25).abs() < 1e-6);
        assert_eq!(mean_frame_difference(&frames[..1]), 0.0);
    }
}
