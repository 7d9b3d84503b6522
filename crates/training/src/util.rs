use burn::backend::Autodiff;
use burn::module::Module;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use data_contracts::ImageNormConfig;
use models::{scalar_f32, ConvolutionalDetector, ConvolutionalDetectorConfig, LossOutputs};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::dataset::{BatchSource, DatasetPathConfig, SampleLoader};
use crate::TrainBackend;
use clap::{Parser, ValueEnum};

pub type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[value(name = "ndarray")]
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the convolutional detector on an annotated image set")]
pub struct TrainArgs {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Dataset root containing the labels and images subdirectories.
    #[arg(long, default_value = "assets/datasets/train")]
    pub dataset_root: String,
    /// Labels subdirectory relative to dataset root.
    #[arg(long, default_value = "labels")]
    pub labels_subdir: String,
    /// Images subdirectory relative to dataset root.
    #[arg(long, default_value = "images")]
    pub images_subdir: String,
    /// Detector hidden width.
    #[arg(long, default_value_t = 16)]
    pub hidden: usize,
    /// Number of classes including background.
    #[arg(long, default_value_t = 2)]
    pub num_classes: usize,
    /// Box slots per image (pads/truncates ground truth to this).
    #[arg(long, default_value_t = 8)]
    pub max_boxes: usize,
    /// Number of epochs.
    #[arg(long, default_value_t = 1)]
    pub epochs: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f32,
    /// Checkpoint output path.
    #[arg(long, default_value = "checkpoints/detector.bin")]
    pub checkpoint_out: String,
}

impl TrainArgs {
    pub fn model_config(&self) -> ConvolutionalDetectorConfig {
        ConvolutionalDetectorConfig {
            hidden: self.hidden,
            num_classes: self.num_classes,
            max_boxes: self.max_boxes,
        }
    }
}

/// Scalar log values per output name, in model order, with the summed `loss` last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogVars(pub Vec<(String, f32)>);

impl LogVars {
    pub fn get(&self, name: &str) -> Option<f32> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| *v)
    }

    /// Per-name mean over several steps (names taken from the first entry).
    pub fn mean(history: &[LogVars]) -> LogVars {
        let Some(first) = history.first() else {
            return LogVars::default();
        };
        let n = history.len() as f32;
        LogVars(
            first
                .0
                .iter()
                .map(|(name, _)| {
                    let sum: f32 = history.iter().filter_map(|vars| vars.get(name)).sum();
                    (name.clone(), sum / n)
                })
                .collect(),
        )
    }
}

impl fmt::Display for LogVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value:.4}")?;
        }
        Ok(())
    }
}

/// Reduce detector outputs to the scalar training loss and log values.
///
/// Single terms are averaged, list terms contribute the sum of their means,
/// and the training loss is the sum of every entry whose name contains `loss`.
/// Empty lists are skipped.
pub fn parse_losses<B: Backend>(
    outputs: &LossOutputs<B>,
) -> anyhow::Result<(Tensor<B, 1>, LogVars)> {
    let mut log_vars = Vec::with_capacity(outputs.len() + 1);
    let mut loss: Option<Tensor<B, 1>> = None;
    for (name, term) in outputs.iter() {
        let Some(reduced) = term.reduce() else {
            continue;
        };
        log_vars.push((name.to_string(), scalar_f32(reduced.clone().detach())?));
        if name.contains("loss") {
            loss = Some(match loss {
                Some(total) => total + reduced,
                None => reduced,
            });
        }
    }
    let loss = loss.ok_or_else(|| anyhow::anyhow!("model outputs contain no loss entries"))?;
    log_vars.push(("loss".to_string(), scalar_f32(loss.clone().detach())?));
    Ok((loss, LogVars(log_vars)))
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;

    let cfg = DatasetPathConfig {
        root: args.dataset_root.clone().into(),
        labels_subdir: args.labels_subdir.clone(),
        images_subdir: args.images_subdir.clone(),
    };
    let samples = cfg.load()?;
    if samples.is_empty() {
        println!("No samples found under {}", cfg.root.display());
        return Ok(());
    }

    if let Some(parent) = Path::new(&args.checkpoint_out).parent() {
        fs::create_dir_all(parent)?;
    }

    let device = <ADBackend as Backend>::Device::default();
    let mut model = ConvolutionalDetector::<ADBackend>::new(args.model_config(), &device);
    let mut optim = AdamConfig::new().init();
    let mut loader = SampleLoader::new(
        samples,
        ImageNormConfig::default(),
        args.max_boxes,
        args.num_classes,
    )?;
    info!(samples = loader.len(), epochs = args.epochs, "starting training");

    for epoch in 0..args.epochs {
        loader.reset();
        let mut history = Vec::with_capacity(loader.len());
        while let Some(batch) = loader.next_batch::<ADBackend>(&device)? {
            let outputs = model.forward_loss(batch.images, &batch.targets);
            let (loss, log_vars) = parse_losses(&outputs)?;
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(args.lr as f64, model, grads);
            history.push(log_vars);
        }
        println!("epoch {epoch}: {}", LogVars::mean(&history));
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .save_file(Path::new(&args.checkpoint_out), &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
    println!("Saved checkpoint to {}", args.checkpoint_out);
    Ok(())
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; the WGPU backend is used despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

/// Install the fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
