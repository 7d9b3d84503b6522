use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::display::DisplayImage;

/// A frame of image data handed to a detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    /// Raw RGBA8 data, row-major; `None` for frames that only carry a path.
    pub rgba: Option<Vec<u8>>,
    /// Image dimensions (width, height).
    pub size: (u32, u32),
    pub path: Option<PathBuf>,
}

/// Result of running a detector on a frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_id: u64,
    /// Normalized boxes \[x0,y0,x1,y1\] in 0..1.
    pub boxes: Vec<[f32; 4]>,
    /// Per-box scores aligned with `boxes`.
    pub scores: Vec<f32>,
    /// Per-box class ids aligned with `boxes`.
    pub classes: Vec<u32>,
}

/// Runs inference on a frame.
pub trait Detector {
    fn detect(&mut self, frame: &Frame) -> DetectionResult;
    /// Optional: adjust thresholds at runtime.
    fn set_thresholds(&mut self, _obj: f32, _iou: f32) {}
}

#[derive(Debug, Error)]
pub enum VisualizationError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode image {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("display buffer has {actual} values, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

/// Writes a display-ready image to `path`.
pub trait VisualizationSink {
    fn visualize(&mut self, image: &DisplayImage, path: &Path) -> Result<(), VisualizationError>;
}
