//! Shared data contracts for annotations, per-image metadata, and pixel normalization.

pub mod annotation;
pub mod norm;

pub use annotation::{AnnotationRecord, ObjectLabel, ValidationError};
pub use norm::{ImageMeta, ImageNormConfig, NormError};
