//! Host-side conversion of model-space image tensors back into display images.
//!
//! Model tensors are planar (CHW), BGR and normalized; display images are
//! interleaved (HWC), RGB and on the 0..255 scale.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::ImageNormConfig;
use vision_core::display::DisplayImage;

use crate::error::{AttackError, AttackResult};

/// Channel order mapping model (BGR) planes to display (RGB) planes.
pub const DISPLAY_ORDER: [usize; 3] = [2, 1, 0];

/// Undo normalization in place: `pixel * std[c] + mean[c]` per plane.
pub fn denormalize_chw(chw: &mut [f32], plane: usize, norm: &ImageNormConfig) {
    for (c, values) in chw.chunks_mut(plane).take(3).enumerate() {
        for v in values {
            *v = norm.denormalize(c, *v);
        }
    }
}

/// New planar buffer whose plane `i` is input plane `order[i]`.
pub fn reorder_channels(chw: &[f32], plane: usize, order: [usize; 3]) -> Vec<f32> {
    let mut out = Vec::with_capacity(plane * order.len());
    for src in order {
        out.extend_from_slice(&chw[src * plane..(src + 1) * plane]);
    }
    out
}

/// Planar CHW to interleaved HWC.
pub fn chw_to_hwc(chw: &[f32], channels: usize, height: usize, width: usize) -> Vec<f32> {
    let plane = height * width;
    let mut out = vec![0.0f32; plane * channels];
    for c in 0..channels {
        for (idx, v) in chw[c * plane..(c + 1) * plane].iter().enumerate() {
            out[idx * channels + c] = *v;
        }
    }
    out
}

/// Render the first image of a `[N, 3, H, W]` batch for display.
pub fn render_display_image<B: Backend>(
    images: Tensor<B, 4>,
    norm: &ImageNormConfig,
) -> AttackResult<DisplayImage> {
    let [_, channels, height, width] = images.dims();
    if channels != 3 {
        return Err(AttackError::ChannelCount(channels));
    }
    let first = images.slice([0..1, 0..channels, 0..height, 0..width]);
    let mut chw = first
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| AttackError::TensorData(format!("{e:?}")))?;

    let plane = height * width;
    denormalize_chw(&mut chw, plane, norm);
    let rgb = reorder_channels(&chw, plane, DISPLAY_ORDER);
    let hwc = chw_to_hwc(&rgb, channels, height, width);
    Ok(DisplayImage::new(width as u32, height as u32, hwc)?)
}
