//! Iterative gradient attack against a detector.
//!
//! Each image is pushed `num_attack_iter` times along its input gradient. A
//! step moves every pixel by at most `epsilon / num_attack_iter` (the gradient
//! is divided by its largest magnitude), so the total L∞ change never exceeds
//! `epsilon`. The image lives on the inner backend between steps and is lifted
//! onto the autodiff backend for exactly one forward/backward pass, so each
//! step starts from a fresh graph and an empty gradient container.

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use data_contracts::ImageMeta;
use models::{scalar_f32, ConvolutionalDetector, DetectionTargets, LossOutputs};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vision_core::interfaces::VisualizationSink;

use crate::dataset::{AttackBatch, BatchSource};
use crate::error::{AttackError, AttackResult};
use crate::render::render_display_image;

/// File name prefix for rendered adversarial images.
pub const ATTACK_PREFIX: &str = "attack_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Total L∞ perturbation budget, in normalized pixel units.
    pub epsilon: f32,
    pub num_attack_iter: usize,
    pub max_attack_batches: usize,
    pub save_path: PathBuf,
    /// Remove every file in `save_path` before the first batch.
    pub clear_output: bool,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            num_attack_iter: 10,
            max_attack_batches: 100,
            save_path: PathBuf::from("outputs/attack"),
            clear_output: false,
        }
    }
}

impl AttackConfig {
    pub fn validate(&self) -> AttackResult<()> {
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(AttackError::InvalidConfig(format!(
                "epsilon must be finite and >= 0, got {}",
                self.epsilon
            )));
        }
        if self.num_attack_iter == 0 {
            return Err(AttackError::InvalidConfig(
                "num_attack_iter must be at least 1".into(),
            ));
        }
        if self.max_attack_batches == 0 {
            return Err(AttackError::InvalidConfig(
                "max_attack_batches must be at least 1".into(),
            ));
        }
        if self.save_path.as_os_str().is_empty() {
            return Err(AttackError::InvalidConfig("save_path is empty".into()));
        }
        Ok(())
    }

    /// Per-step budget.
    pub fn step_size(&self) -> f32 {
        self.epsilon / self.num_attack_iter as f32
    }
}

/// A model that scores a batch in loss mode.
pub trait LossModel<B: Backend> {
    fn loss(
        &self,
        images: Tensor<B, 4>,
        metas: &[ImageMeta],
        targets: &DetectionTargets<B>,
    ) -> LossOutputs<B>;
}

impl<B: Backend> LossModel<B> for ConvolutionalDetector<B> {
    fn loss(
        &self,
        images: Tensor<B, 4>,
        _metas: &[ImageMeta],
        targets: &DetectionTargets<B>,
    ) -> LossOutputs<B> {
        self.forward_loss(images, targets)
    }
}

/// Accuracy per attack step; first = before the attack, last = after it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracyTrace(Vec<f32>);

impl AccuracyTrace {
    pub fn with_capacity(steps: usize) -> Self {
        Self(Vec::with_capacity(steps))
    }

    pub fn push(&mut self, acc: f32) {
        self.0.push(acc);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn before(&self) -> Option<f32> {
        self.0.first().copied()
    }

    pub fn after(&self) -> Option<f32> {
        self.0.last().copied()
    }
}

/// Running pre/post accuracy sums across processed batches.
#[derive(Debug, Clone, Default)]
pub struct AccuracyTotals {
    before_sum: f64,
    under_sum: f64,
    traces: Vec<AccuracyTrace>,
}

impl AccuracyTotals {
    pub fn record(&mut self, trace: AccuracyTrace) {
        if let (Some(before), Some(after)) = (trace.before(), trace.after()) {
            self.before_sum += before as f64;
            self.under_sum += after as f64;
            self.traces.push(trace);
        }
    }

    pub fn count(&self) -> usize {
        self.traces.len()
    }

    /// Means over the batches actually recorded.
    pub fn finish(self) -> AttackResult<AttackSummary> {
        let n = self.traces.len();
        if n == 0 {
            return Err(AttackError::NoBatches);
        }
        Ok(AttackSummary {
            batches: n,
            acc_before: (self.before_sum / n as f64) as f32,
            acc_under: (self.under_sum / n as f64) as f32,
            traces: self.traces,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackSummary {
    pub batches: usize,
    pub acc_before: f32,
    pub acc_under: f32,
    pub traces: Vec<AccuracyTrace>,
}

impl AttackSummary {
    pub fn decrease(&self) -> f32 {
        self.acc_before - self.acc_under
    }
}

impl fmt::Display for AttackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Accuracy before attack = {:.4}", self.acc_before)?;
        writeln!(f, "Accuracy under attack = {:.4}", self.acc_under)?;
        write!(f, "Accuracy decrease = {:+.4}", self.decrease())
    }
}

/// Original and perturbed images (inner backend) plus the accuracy trace.
pub struct PerturbedBatch<B: Backend> {
    pub original: Tensor<B, 4>,
    pub perturbed: Tensor<B, 4>,
    pub trace: AccuracyTrace,
}

/// One attack step: returns the perturbed image and the accuracy measured on
/// the input image.
pub fn attack_step<B, M>(
    model: &M,
    images: Tensor<B::InnerBackend, 4>,
    metas: &[ImageMeta],
    targets: &DetectionTargets<B>,
    step_size: f32,
    step: usize,
) -> AttackResult<(Tensor<B::InnerBackend, 4>, f32)>
where
    B: AutodiffBackend,
    M: LossModel<B>,
{
    let images = Tensor::<B, 4>::from_inner(images).require_grad();
    let outputs = model.loss(images.clone(), metas, targets);
    let acc = outputs
        .accuracy()
        .map_err(|e| AttackError::TensorData(e.to_string()))?
        .ok_or(AttackError::MissingAccuracy { step })?;
    let objective = outputs
        .objective()
        .ok_or(AttackError::NoLossTerms { step })?;

    let grads = objective.backward();
    let grad = images
        .grad(&grads)
        .ok_or(AttackError::MissingGradient { step })?;
    let max_abs = scalar_f32(grad.clone().abs().max())
        .map_err(|e| AttackError::TensorData(e.to_string()))?;
    if !max_abs.is_finite() || max_abs == 0.0 {
        return Err(AttackError::DegenerateGradient { step, max_abs });
    }

    let next = images.inner() + grad.div_scalar(max_abs).mul_scalar(step_size);
    Ok((next, acc))
}

/// Run every attack step on one batch.
pub fn perturb_batch<B, M>(
    model: &M,
    batch: &AttackBatch<B>,
    cfg: &AttackConfig,
) -> AttackResult<PerturbedBatch<B::InnerBackend>>
where
    B: AutodiffBackend,
    M: LossModel<B>,
{
    let original = batch.images.clone().inner();
    let step_size = cfg.step_size();
    let mut current = original.clone();
    let mut trace = AccuracyTrace::with_capacity(cfg.num_attack_iter);
    for step in 0..cfg.num_attack_iter {
        let (next, acc) =
            attack_step::<B, M>(model, current, &batch.metas, &batch.targets, step_size, step)?;
        debug!(step = step + 1, of = cfg.num_attack_iter, acc, "attack step");
        trace.push(acc);
        current = next;
    }
    Ok(PerturbedBatch {
        original,
        perturbed: current,
        trace,
    })
}

/// Create `path` if needed; with `clear`, delete everything inside it so the
/// directory is empty. Returns the number of entries removed.
pub fn prepare_output_dir(path: &Path, clear: bool) -> AttackResult<usize> {
    let io_err = |p: &Path| {
        let path = p.to_path_buf();
        move |source| AttackError::Io { path, source }
    };
    fs::create_dir_all(path).map_err(io_err(path))?;
    if !clear {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(path).map_err(io_err(path))? {
        let entry = entry.map_err(io_err(path))?;
        let entry_path = entry.path();
        let file_type = entry.file_type().map_err(io_err(&entry_path))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&entry_path).map_err(io_err(&entry_path))?;
        } else {
            fs::remove_file(&entry_path).map_err(io_err(&entry_path))?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Attack up to `min(source.len(), max_attack_batches)` batches, render the
/// original and perturbed image of each through `sink`, and return mean
/// accuracy before and under attack.
pub fn attack_detector<B, M, S, V>(
    model: &M,
    source: &mut S,
    sink: &mut V,
    cfg: &AttackConfig,
    device: &B::Device,
) -> AttackResult<AttackSummary>
where
    B: AutodiffBackend,
    M: LossModel<B>,
    S: BatchSource,
    V: VisualizationSink,
{
    cfg.validate()?;
    let removed = prepare_output_dir(&cfg.save_path, cfg.clear_output)?;
    if cfg.clear_output {
        info!(removed, path = %cfg.save_path.display(), "cleared output directory");
    }

    let max_batch = source.len().min(cfg.max_attack_batches);
    info!(
        batches = max_batch,
        epsilon = cfg.epsilon,
        iters = cfg.num_attack_iter,
        "starting attack"
    );

    let mut totals = AccuracyTotals::default();
    for index in 0..max_batch {
        let batch = match source
            .next_batch::<B>(device)
            .map_err(|source| AttackError::Data { index, source })?
        {
            Some(batch) => batch,
            None => {
                warn!(index, "data source ended before its reported length");
                break;
            }
        };
        let meta = batch
            .metas
            .first()
            .cloned()
            .ok_or(AttackError::EmptyBatch { index })?;
        let file_name = meta
            .file_name()
            .ok_or_else(|| AttackError::MissingFileName(meta.filename.clone()))?;

        let PerturbedBatch {
            original,
            perturbed,
            trace,
        } = perturb_batch(model, &batch, cfg)?;
        let (before, after) = (trace.before(), trace.after());
        totals.record(trace);

        let original = render_display_image(original, &meta.norm)?;
        let perturbed = render_display_image(perturbed, &meta.norm)?;
        sink.visualize(&original, &cfg.save_path.join(&file_name))?;
        sink.visualize(
            &perturbed,
            &cfg.save_path.join(format!("{ATTACK_PREFIX}{file_name}")),
        )?;

        info!(
            batch = index + 1,
            of = max_batch,
            before = before.unwrap_or_default(),
            after = after.unwrap_or_default(),
            "attacked {file_name}"
        );
    }

    totals.finish()
}
