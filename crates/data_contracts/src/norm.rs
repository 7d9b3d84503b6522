//! Per-channel pixel normalization and the metadata that travels with each image.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormError {
    #[error("std[{channel}] must be finite and non-zero, got {value}")]
    InvalidStd { channel: usize, value: f32 },
    #[error("mean[{channel}] must be finite, got {value}")]
    InvalidMean { channel: usize, value: f32 },
}

/// Mean/std per channel, expressed on the 0..255 pixel scale and in the
/// channel order the model consumes (BGR).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageNormConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for ImageNormConfig {
    fn default() -> Self {
        Self {
            mean: [103.53, 116.28, 123.675],
            std: [57.375, 57.12, 58.395],
        }
    }
}

impl ImageNormConfig {
    pub fn validate(&self) -> Result<(), NormError> {
        for (channel, value) in self.mean.iter().copied().enumerate() {
            if !value.is_finite() {
                return Err(NormError::InvalidMean { channel, value });
            }
        }
        for (channel, value) in self.std.iter().copied().enumerate() {
            if !value.is_finite() || value == 0.0 {
                return Err(NormError::InvalidStd { channel, value });
            }
        }
        Ok(())
    }

    #[inline]
    pub fn normalize(&self, channel: usize, pixel: f32) -> f32 {
        (pixel - self.mean[channel]) / self.std[channel]
    }

    #[inline]
    pub fn denormalize(&self, channel: usize, value: f32) -> f32 {
        value * self.std[channel] + self.mean[channel]
    }

    /// Pack interleaved RGB(A) 8-bit pixels into a normalized planar BGR buffer
    /// (CHW, channel 0 = blue). `stride` is 3 for RGB and 4 for RGBA input.
    pub fn pack_bgr_chw(
        &self,
        interleaved: &[u8],
        width: usize,
        height: usize,
        stride: usize,
    ) -> Vec<f32> {
        let plane = width * height;
        let mut out = vec![0.0f32; plane * 3];
        for (idx, px) in interleaved.chunks_exact(stride).take(plane).enumerate() {
            // BGR plane c reads RGB component 2 - c.
            for c in 0..3 {
                out[c * plane + idx] = self.normalize(c, px[2 - c] as f32);
            }
        }
        out
    }
}

/// Metadata for one image in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMeta {
    /// Source file the image was decoded from.
    pub filename: PathBuf,
    pub height: usize,
    pub width: usize,
    pub norm: ImageNormConfig,
}

impl ImageMeta {
    /// Final path component of `filename`, used to name rendered outputs.
    pub fn file_name(&self) -> Option<String> {
        self.filename
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}
