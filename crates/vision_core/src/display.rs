use image::{Rgb, RgbImage, Rgba, RgbaImage};

use crate::interfaces::{Frame, VisualizationError};

/// Host-side image in display layout: HWC, RGB, 0..255 floats.
///
/// Values may fall outside 0..255 (e.g. after an adversarial perturbation);
/// they are clamped only when converted to 8-bit.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<f32>,
}

impl DisplayImage {
    pub fn new(width: u32, height: u32, pixels: Vec<f32>) -> Result<Self, VisualizationError> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(VisualizationError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let base = (y as usize * self.width as usize + x as usize) * 3;
        [
            self.pixels[base],
            self.pixels[base + 1],
            self.pixels[base + 2],
        ]
    }

    pub fn to_rgb8(&self) -> RgbImage {
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let [r, g, b] = self.pixel(x, y);
            Rgb([to_u8(r), to_u8(g), to_u8(b)])
        })
    }

    pub fn to_rgba8(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            let [r, g, b] = self.pixel(x, y);
            Rgba([to_u8(r), to_u8(g), to_u8(b), 255])
        })
    }

    pub fn to_frame(&self, id: u64) -> Frame {
        Frame {
            id,
            rgba: Some(self.to_rgba8().into_raw()),
            size: (self.width, self.height),
            path: None,
        }
    }
}

fn to_u8(v: f32) -> u8 {
    if v.is_nan() {
        return 0;
    }
    v.round().clamp(0.0, 255.0) as u8
}
