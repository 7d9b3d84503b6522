use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Class id reserved for "no object" slots.
pub const BACKGROUND_CLASS: u32 = 0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectLabel {
    pub bbox_px: Option<[f32; 4]>,
    pub bbox_norm: Option<[f32; 4]>,
    /// Foreground class id, starting at 1.
    pub class_id: u32,
}

/// One annotated image as stored on disk (one JSON file per image).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationRecord {
    /// Image path relative to the dataset image directory.
    pub image: String,
    #[serde(default)]
    pub labels: Vec<ObjectLabel>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("bbox_px invalid order or negative: {0:?}")]
    InvalidBboxPx([f32; 4]),
    #[error("bbox_norm out of range: {0:?}")]
    InvalidBboxNorm([f32; 4]),
    #[error("class id {0} is reserved for background")]
    BackgroundClass(u32),
    #[error("missing image path")]
    MissingImage,
}

impl ObjectLabel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(px) = self.bbox_px {
            if px.iter().any(|v| v.is_nan() || *v < 0.0) || px[0] > px[2] || px[1] > px[3] {
                return Err(ValidationError::InvalidBboxPx(px));
            }
        }
        if let Some(norm) = self.bbox_norm {
            let in_range = norm.iter().all(|v| !v.is_nan() && (0.0..=1.0).contains(v));
            if !in_range || norm[0] > norm[2] || norm[1] > norm[3] {
                return Err(ValidationError::InvalidBboxNorm(norm));
            }
        }
        if self.class_id == BACKGROUND_CLASS {
            return Err(ValidationError::BackgroundClass(self.class_id));
        }
        Ok(())
    }

    /// Box in normalized 0..1 coordinates, preferring `bbox_norm` over `bbox_px`.
    pub fn normalized_box(&self, width: u32, height: u32) -> Option<[f32; 4]> {
        if let Some(norm) = self.bbox_norm {
            return Some(norm);
        }
        let px = self.bbox_px?;
        if width == 0 || height == 0 {
            return None;
        }
        let (w, h) = (width as f32, height as f32);
        Some([
            (px[0] / w).clamp(0.0, 1.0),
            (px[1] / h).clamp(0.0, 1.0),
            (px[2] / w).clamp(0.0, 1.0),
            (px[3] / h).clamp(0.0, 1.0),
        ])
    }
}

impl AnnotationRecord {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::MissingImage);
        }
        for label in &self.labels {
            label.validate()?;
        }
        Ok(())
    }
}
