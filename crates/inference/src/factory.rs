use crate::{InferenceBackend, InferenceModel, InferenceModelConfig};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, RecorderError};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use data_contracts::ImageNormConfig;
use std::path::Path;
use vision_core::interfaces::{DetectionResult, Detector, Frame};

/// Thresholds for inference (objectness + IoU).
#[derive(Debug, Clone, Copy)]
pub struct InferenceThresholds {
    pub obj_thresh: f32,
    pub iou_thresh: f32,
}

impl Default for InferenceThresholds {
    fn default() -> Self {
        Self {
            obj_thresh: 0.3,
            iou_thresh: 0.5,
        }
    }
}

/// Load detector weights written with `BinFileRecorder<FullPrecisionSettings>`.
pub fn load_detector<B: Backend>(
    path: &Path,
    cfg: InferenceModelConfig,
    device: &B::Device,
) -> Result<InferenceModel<B>, RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    InferenceModel::<B>::new(cfg, device).load_file(path, &recorder, device)
}

/// Used when no weights are available; reports no detections.
struct EmptyDetector;

impl Detector for EmptyDetector {
    fn detect(&mut self, frame: &Frame) -> DetectionResult {
        DetectionResult {
            frame_id: frame.id,
            ..Default::default()
        }
    }
}

struct BurnDetector {
    model: InferenceModel<InferenceBackend>,
    norm: ImageNormConfig,
    obj_thresh: f32,
    iou_thresh: f32,
}

impl BurnDetector {
    fn frame_to_tensor(&self, frame: &Frame) -> Option<Tensor<InferenceBackend, 4>> {
        let rgba = frame.rgba.as_ref()?;
        let (w, h) = (frame.size.0 as usize, frame.size.1 as usize);
        if w == 0 || h == 0 || rgba.len() < w * h * 4 {
            return None;
        }
        let chw = self.norm.pack_bgr_chw(rgba, w, h, 4);
        let device = <InferenceBackend as Backend>::Device::default();
        Some(Tensor::from_data(TensorData::new(chw, [1, 3, h, w]), &device))
    }
}

impl Detector for BurnDetector {
    fn detect(&mut self, frame: &Frame) -> DetectionResult {
        let Some(input) = self.frame_to_tensor(frame) else {
            return DetectionResult {
                frame_id: frame.id,
                ..Default::default()
            };
        };
        let (boxes, scores, classes) = self.model.forward_detect(input);
        let boxes = boxes.into_data().to_vec::<f32>().unwrap_or_default();
        let scores = scores.into_data().to_vec::<f32>().unwrap_or_default();
        let classes = classes
            .float()
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();

        let candidates: Vec<Candidate> = scores
            .iter()
            .enumerate()
            .filter(|(_, score)| **score >= self.obj_thresh)
            .filter_map(|(slot, score)| {
                let b = boxes.get(slot * 4..slot * 4 + 4)?;
                Some(Candidate {
                    bbox: [b[0], b[1], b[2], b[3]],
                    score: *score,
                    class_id: classes.get(slot).copied().unwrap_or(1.0) as u32,
                })
            })
            .collect();
        let kept = nms(candidates, self.iou_thresh);

        DetectionResult {
            frame_id: frame.id,
            boxes: kept.iter().map(|c| c.bbox).collect(),
            scores: kept.iter().map(|c| c.score).collect(),
            classes: kept.iter().map(|c| c.class_id).collect(),
        }
    }

    fn set_thresholds(&mut self, obj: f32, iou: f32) {
        self.obj_thresh = obj;
        self.iou_thresh = iou;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: u32,
}

/// Greedy non-maximum suppression: highest score first, drop any candidate
/// whose IoU with an already kept box exceeds `iou_thresh`.
pub fn nms(mut candidates: Vec<Candidate>, iou_thresh: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for cand in candidates {
        if kept.iter().all(|k| iou_xyxy(k.bbox, cand.bbox) <= iou_thresh) {
            kept.push(cand);
        }
    }
    kept
}

pub fn iou_xyxy(a: [f32; 4], b: [f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    let area = |r: [f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let denom = area(a) + area(b) - inter;
    if denom <= 0.0 {
        0.0
    } else {
        inter / denom
    }
}

/// Builds the auxiliary detector used when rendering images; falls back to a
/// detector with no output when weights are missing or fail to load.
pub struct InferenceFactory;

impl InferenceFactory {
    pub fn build(
        &self,
        thresh: InferenceThresholds,
        weights: Option<&Path>,
        model_cfg: InferenceModelConfig,
        norm: ImageNormConfig,
    ) -> Box<dyn Detector + Send> {
        if let Some(det) = self.try_load_burn_detector(thresh, weights, model_cfg, norm) {
            return det;
        }
        tracing::warn!("no valid detector checkpoint provided; rendered images will carry no boxes");
        Box::new(EmptyDetector)
    }

    fn try_load_burn_detector(
        &self,
        thresh: InferenceThresholds,
        weights: Option<&Path>,
        model_cfg: InferenceModelConfig,
        norm: ImageNormConfig,
    ) -> Option<Box<dyn Detector + Send>> {
        let path = weights?;
        if !path.exists() {
            tracing::warn!(path = %path.display(), "detector checkpoint not found");
            return None;
        }
        let device = <InferenceBackend as Backend>::Device::default();
        match load_detector::<InferenceBackend>(path, model_cfg, &device) {
            Ok(model) => Some(Box::new(BurnDetector {
                model,
                norm,
                obj_thresh: thresh.obj_thresh,
                iou_thresh: thresh.iou_thresh,
            })),
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to load detector checkpoint");
                None
            }
        }
    }
}
