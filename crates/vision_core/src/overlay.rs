use image::{ImageFormat, Rgb, RgbImage};
use std::path::Path;

use crate::display::DisplayImage;
use crate::interfaces::{DetectionResult, Detector, VisualizationError, VisualizationSink};

const BOX_COLORS: [Rgb<u8>; 3] = [Rgb([255, 64, 192]), Rgb([64, 192, 255]), Rgb([255, 208, 64])];

/// Normalize a box from 0..1 space into pixel coordinates, clamped to image bounds.
pub fn normalize_box(bbox_norm: [f32; 4], dims: (u32, u32)) -> Option<[u32; 4]> {
    let (w, h) = dims;
    if w == 0 || h == 0 || bbox_norm.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let to_px = |v: f32, max: u32| -> u32 { (v * max as f32).clamp(0.0, (max - 1) as f32) as u32 };
    let x0 = to_px(bbox_norm[0], w);
    let y0 = to_px(bbox_norm[1], h);
    let x1 = to_px(bbox_norm[2], w);
    let y1 = to_px(bbox_norm[3], h);
    if x0 > x1 || y0 > y1 {
        return None;
    }
    Some([x0, y0, x1, y1])
}

/// Draw a rectangle border with given thickness; rings that collapse are skipped.
pub fn draw_rect(img: &mut RgbImage, bbox_px: [u32; 4], color: Rgb<u8>, thickness: u32) {
    let (w, h) = img.dimensions();
    let [x0, y0, x1, y1] = bbox_px;
    for t in 0..thickness {
        let (left, top) = (x0.saturating_add(t), y0.saturating_add(t));
        let (right, bottom) = (x1.saturating_sub(t), y1.saturating_sub(t));
        if left > right || top > bottom || right >= w || bottom >= h {
            continue;
        }
        for x in left..=right {
            img.put_pixel(x, top, color);
            img.put_pixel(x, bottom, color);
        }
        for y in top..=bottom {
            img.put_pixel(left, y, color);
            img.put_pixel(right, y, color);
        }
    }
}

/// Draw every detection box, colored by class id.
pub fn draw_detections(img: &mut RgbImage, result: &DetectionResult, thickness: u32) {
    let dims = img.dimensions();
    for (i, bbox) in result.boxes.iter().enumerate() {
        let class_id = result.classes.get(i).copied().unwrap_or(0) as usize;
        if let Some(px) = normalize_box(*bbox, dims) {
            draw_rect(img, px, BOX_COLORS[class_id % BOX_COLORS.len()], thickness);
        }
    }
}

/// Write an RGB image, picking the format from the extension and falling back to PNG.
pub fn save_rgb(img: &RgbImage, path: &Path) -> Result<(), VisualizationError> {
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Png);
    img.save_with_format(path, format)
        .map_err(|source| VisualizationError::Encode {
            path: path.to_path_buf(),
            source,
        })
}

/// Sink that optionally runs an auxiliary detector and draws its boxes before saving.
pub struct OverlaySink {
    detector: Option<Box<dyn Detector + Send>>,
    thickness: u32,
    next_frame_id: u64,
}

impl OverlaySink {
    pub fn new(detector: Box<dyn Detector + Send>) -> Self {
        Self {
            detector: Some(detector),
            thickness: 2,
            next_frame_id: 0,
        }
    }

    /// Save images as-is, without detections.
    pub fn plain() -> Self {
        Self {
            detector: None,
            thickness: 2,
            next_frame_id: 0,
        }
    }

    pub fn with_thickness(mut self, thickness: u32) -> Self {
        self.thickness = thickness;
        self
    }
}

impl VisualizationSink for OverlaySink {
    fn visualize(&mut self, image: &DisplayImage, path: &Path) -> Result<(), VisualizationError> {
        let mut rgb = image.to_rgb8();
        if let Some(detector) = self.detector.as_mut() {
            let frame = image.to_frame(self.next_frame_id);
            self.next_frame_id += 1;
            let result = detector.detect(&frame);
            tracing::debug!(
                path = %path.display(),
                boxes = result.boxes.len(),
                "overlaying detections"
            );
            draw_detections(&mut rgb, &result, self.thickness);
        }
        save_rgb(&rgb, path)
    }
}
