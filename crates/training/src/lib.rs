#![recursion_limit = "256"]

pub mod attack;
pub mod config;
pub mod dataset;
pub mod error;
pub mod render;
pub mod util;

pub use attack::{
    attack_detector, attack_step, perturb_batch, prepare_output_dir, AccuracyTrace, AttackConfig,
    AttackSummary, LossModel, ATTACK_PREFIX,
};
pub use config::{AttackArgs, AttackConfigFile, AttackRunConfig};
pub use dataset::{AttackBatch, BatchSource, DatasetPathConfig, RunSample, SampleLoader};
pub use error::{AttackError, DatasetError};
pub use models::{ConvolutionalDetector, ConvolutionalDetectorConfig};
pub use util::{init_tracing, parse_losses, run_train, ADBackend, BackendKind, LogVars, TrainArgs};
/// Backend alias for training/attack (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
