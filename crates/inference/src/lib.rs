#![recursion_limit = "256"]

pub mod factory;

#[cfg(feature = "backend-wgpu")]
pub type InferenceBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type InferenceBackend = burn_ndarray::NdArray<f32>;

pub type InferenceModel<B> = models::ConvolutionalDetector<B>;
pub type InferenceModelConfig = models::ConvolutionalDetectorConfig;

pub use factory::{load_detector, InferenceFactory, InferenceThresholds};

pub mod prelude {
    pub use crate::factory::{load_detector, InferenceFactory, InferenceThresholds};
    pub use crate::{InferenceBackend, InferenceModel, InferenceModelConfig};
}
