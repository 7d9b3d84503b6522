use burn::tensor::TensorData;
use burn::tensor::{backend::Backend, Tensor};
use data_contracts::{AnnotationRecord, ImageMeta, ImageNormConfig};
use models::DetectionTargets;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DatasetError, DatasetResult};

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetPathConfig {
    pub root: PathBuf,
    pub labels_subdir: String,
    pub images_subdir: String,
}

#[derive(Debug, Clone)]
pub struct RunSample {
    pub image: PathBuf,
    pub label_path: PathBuf,
    pub annotation: AnnotationRecord,
}

/// One image ready for the model: normalized BGR tensor [1, 3, H, W], its
/// metadata, and padded ground truth.
#[derive(Debug, Clone)]
pub struct AttackBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub metas: Vec<ImageMeta>,
    pub targets: DetectionTargets<B>,
}

/// Sequential supplier of batches with a known length.
pub trait BatchSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next batch, or `None` once the source is exhausted.
    fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<AttackBatch<B>>>;
}

impl DatasetPathConfig {
    /// Read and validate every `*.json` annotation under the labels directory,
    /// ordered by file name.
    pub fn load(&self) -> DatasetResult<Vec<RunSample>> {
        let labels_dir = self.root.join(&self.labels_subdir);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| DatasetError::Io { path, source }
        };
        let mut label_paths = Vec::new();
        for entry in fs::read_dir(&labels_dir).map_err(io_err(&labels_dir))? {
            let path = entry.map_err(io_err(&labels_dir))?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                label_paths.push(path);
            }
        }
        label_paths.sort();

        let mut samples = Vec::with_capacity(label_paths.len());
        for path in label_paths {
            let raw = fs::read(&path).map_err(io_err(&path))?;
            let annotation: AnnotationRecord =
                serde_json::from_slice(&raw).map_err(|source| DatasetError::Json {
                    path: path.clone(),
                    source,
                })?;
            annotation
                .validate()
                .map_err(|source| DatasetError::Validation {
                    path: path.clone(),
                    source,
                })?;
            let image = self.root.join(&self.images_subdir).join(&annotation.image);
            samples.push(RunSample {
                image,
                label_path: path,
                annotation,
            });
        }
        Ok(samples)
    }
}

/// File-backed source yielding one image per batch.
pub struct SampleLoader {
    samples: Vec<RunSample>,
    cursor: usize,
    norm: ImageNormConfig,
    max_boxes: usize,
    num_classes: usize,
}

impl SampleLoader {
    pub fn new(
        samples: Vec<RunSample>,
        norm: ImageNormConfig,
        max_boxes: usize,
        num_classes: usize,
    ) -> DatasetResult<Self> {
        norm.validate()?;
        Ok(Self {
            samples,
            cursor: 0,
            norm,
            max_boxes: max_boxes.max(1),
            num_classes,
        })
    }

    /// Rewind to the first sample (start of a new epoch).
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn load_sample<B: Backend>(
        &self,
        sample: &RunSample,
        device: &B::Device,
    ) -> DatasetResult<AttackBatch<B>> {
        let img = image::open(&sample.image)
            .map_err(|source| DatasetError::Image {
                path: sample.image.clone(),
                source,
            })?
            .to_rgb8();
        let (width, height) = img.dimensions();

        let mut objects = Vec::with_capacity(sample.annotation.labels.len());
        for label in &sample.annotation.labels {
            if label.class_id as usize >= self.num_classes {
                return Err(DatasetError::ClassOutOfRange {
                    path: sample.label_path.clone(),
                    class_id: label.class_id,
                    num_classes: self.num_classes,
                });
            }
            if let Some(bbox) = label.normalized_box(width, height) {
                objects.push((bbox, label.class_id));
            }
        }

        let (w, h) = (width as usize, height as usize);
        let chw = self.norm.pack_bgr_chw(img.as_raw(), w, h, 3);
        let images = Tensor::<B, 4>::from_data(TensorData::new(chw, [1, 3, h, w]), device);
        let targets = DetectionTargets::from_objects(&[objects], self.max_boxes, device);
        let meta = ImageMeta {
            filename: sample.image.clone(),
            height: h,
            width: w,
            norm: self.norm,
        };
        Ok(AttackBatch {
            images,
            metas: vec![meta],
            targets,
        })
    }
}

impl BatchSource for SampleLoader {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<AttackBatch<B>>> {
        let Some(sample) = self.samples.get(self.cursor) else {
            return Ok(None);
        };
        let batch = self.load_sample(sample, device)?;
        self.cursor += 1;
        Ok(Some(batch))
    }
}
