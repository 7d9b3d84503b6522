//! Burn ML models for object detection.
//!
//! This crate defines the detector architecture used for training, inference and
//! adversarial evaluation:
//! - `ConvolutionalDetector`: two-level convolutional detector with a slot
//!   classification head and one box-regression head per feature level.
//! - `LossOutputs`: the ordered loss/accuracy breakdown a detector returns in
//!   loss mode (`loss_cls`, `acc`, `loss_bbox`).
//!
//! These are pure Burn Modules with no awareness of the `Detector` trait. The
//! `inference` crate wraps them into `Detector` implementations for rendering.

pub mod detector;
pub mod outputs;

pub use detector::{
    ConvolutionalDetector, ConvolutionalDetectorConfig, DetectionTargets, DetectorHeads,
};
pub use outputs::{scalar_f32, LossOutputs, LossTerm, ReadbackError, ACCURACY_KEY};

pub mod prelude {
    pub use super::{
        ConvolutionalDetector, ConvolutionalDetectorConfig, DetectionTargets, LossOutputs,
        LossTerm, ACCURACY_KEY,
    };
}
