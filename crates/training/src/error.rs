//! Error types for dataset loading and the attack loop.

use data_contracts::{NormError, ValidationError};
use std::path::PathBuf;
use thiserror::Error;
use vision_core::interfaces::VisualizationError;

pub type DatasetResult<T> = Result<T, DatasetError>;
pub type AttackResult<T> = Result<T, AttackError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("label validation failed at {path}: {source}")]
    Validation {
        path: PathBuf,
        #[source]
        source: ValidationError,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("class id {class_id} in {path} is outside the model's {num_classes} classes")]
    ClassOutOfRange {
        path: PathBuf,
        class_id: u32,
        num_classes: usize,
    },
    #[error(transparent)]
    Norm(#[from] NormError),
}

#[derive(Debug, Error)]
pub enum AttackError {
    #[error("invalid attack config: {0}")]
    InvalidConfig(String),
    #[error("model output has no `acc` entry at step {step}")]
    MissingAccuracy { step: usize },
    #[error("model output has no loss entries besides `acc` at step {step}")]
    NoLossTerms { step: usize },
    #[error("no gradient reached the input image at step {step}")]
    MissingGradient { step: usize },
    #[error("gradient max |g| is {max_abs} at step {step}; cannot scale the perturbation")]
    DegenerateGradient { step: usize, max_abs: f32 },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load batch {index}: {source}")]
    Data {
        index: usize,
        #[source]
        source: DatasetError,
    },
    #[error("batch {index} carries no image metadata")]
    EmptyBatch { index: usize },
    #[error("image path has no file name: {0}")]
    MissingFileName(PathBuf),
    #[error("expected a 3-channel image, got {0} channels")]
    ChannelCount(usize),
    #[error("failed to read tensor data: {0}")]
    TensorData(String),
    #[error(transparent)]
    Render(#[from] VisualizationError),
    #[error("data source produced no batches")]
    NoBatches,
}
