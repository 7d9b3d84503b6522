//! Attack command configuration: built-in defaults, then an optional TOML file,
//! then explicit command-line flags.

use anyhow::Context;
use clap::Parser;
use data_contracts::ImageNormConfig;
use inference::InferenceThresholds;
use models::ConvolutionalDetectorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::attack::AttackConfig;
use crate::dataset::DatasetPathConfig;
use crate::util::BackendKind;

#[derive(Parser, Debug, Default)]
#[command(
    name = "attack",
    about = "Run an iterative gradient attack against a detector checkpoint and render before/after images"
)]
pub struct AttackArgs {
    /// TOML config; its tables supply values for flags that are not given.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
    /// Detector checkpoint to attack.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Checkpoint for the detector that annotates rendered images (defaults to --checkpoint).
    #[arg(long)]
    pub infer_checkpoint: Option<PathBuf>,
    /// Dataset root containing the labels and images subdirectories.
    #[arg(long)]
    pub dataset_root: Option<PathBuf>,
    /// Labels subdirectory relative to dataset root.
    #[arg(long)]
    pub labels_subdir: Option<String>,
    /// Images subdirectory relative to dataset root.
    #[arg(long)]
    pub images_subdir: Option<String>,
    /// Total perturbation budget (normalized pixel units).
    #[arg(long)]
    pub epsilon: Option<f32>,
    /// Gradient steps per image.
    #[arg(long)]
    pub num_attack_iter: Option<usize>,
    /// Maximum number of images to attack.
    #[arg(long)]
    pub max_attack_batches: Option<usize>,
    /// Directory receiving original and attack_ renderings.
    #[arg(long)]
    pub save_path: Option<PathBuf>,
    /// Delete every file in --save-path before starting.
    #[arg(long, default_value_t = false)]
    pub clear_output: bool,
    /// Detector hidden width (must match the checkpoint).
    #[arg(long)]
    pub hidden: Option<usize>,
    /// Number of classes including background (must match the checkpoint).
    #[arg(long)]
    pub num_classes: Option<usize>,
    /// Box slots per image (must match the checkpoint).
    #[arg(long)]
    pub max_boxes: Option<usize>,
    /// Objectness threshold for rendered detections.
    #[arg(long)]
    pub infer_obj_thresh: Option<f32>,
    /// IoU threshold for NMS of rendered detections.
    #[arg(long)]
    pub infer_iou_thresh: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AttackConfigFile {
    pub backend: Option<BackendKind>,
    pub attack: Option<AttackSection>,
    pub dataset: Option<DatasetSection>,
    pub model: Option<ModelSection>,
    pub normalization: Option<ImageNormConfig>,
    pub inference: Option<InferenceSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AttackSection {
    pub epsilon: Option<f32>,
    pub num_attack_iter: Option<usize>,
    pub max_attack_batches: Option<usize>,
    pub save_path: Option<String>,
    pub clear_output: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct DatasetSection {
    pub root: Option<String>,
    pub labels_subdir: Option<String>,
    pub images_subdir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelSection {
    pub checkpoint: Option<String>,
    pub infer_checkpoint: Option<String>,
    pub hidden: Option<usize>,
    pub num_classes: Option<usize>,
    pub max_boxes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct InferenceSection {
    pub obj_thresh: Option<f32>,
    pub iou_thresh: Option<f32>,
}

/// Fully resolved settings for one attack run.
#[derive(Debug, Clone)]
pub struct AttackRunConfig {
    pub backend: BackendKind,
    pub attack: AttackConfig,
    pub dataset: DatasetPathConfig,
    pub checkpoint: Option<PathBuf>,
    pub infer_checkpoint: Option<PathBuf>,
    pub model: ConvolutionalDetectorConfig,
    pub norm: ImageNormConfig,
    pub thresholds: InferenceThresholds,
}

impl AttackConfigFile {
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }
}

impl AttackArgs {
    pub fn resolve(self) -> anyhow::Result<AttackRunConfig> {
        let file = match &self.config {
            Some(path) => AttackConfigFile::from_path(path)?,
            None => AttackConfigFile::default(),
        };
        Ok(self.merge(file))
    }

    /// Flags win over file values, file values win over defaults.
    pub fn merge(self, file: AttackConfigFile) -> AttackRunConfig {
        let attack_file = file.attack.unwrap_or_default();
        let dataset_file = file.dataset.unwrap_or_default();
        let model_file = file.model.unwrap_or_default();
        let infer_file = file.inference.unwrap_or_default();
        let attack_defaults = AttackConfig::default();
        let model_defaults = ConvolutionalDetectorConfig::default();
        let thresh_defaults = InferenceThresholds::default();

        let attack = AttackConfig {
            epsilon: self
                .epsilon
                .or(attack_file.epsilon)
                .unwrap_or(attack_defaults.epsilon),
            num_attack_iter: self
                .num_attack_iter
                .or(attack_file.num_attack_iter)
                .unwrap_or(attack_defaults.num_attack_iter),
            max_attack_batches: self
                .max_attack_batches
                .or(attack_file.max_attack_batches)
                .unwrap_or(attack_defaults.max_attack_batches),
            save_path: self
                .save_path
                .or_else(|| attack_file.save_path.map(|v| expand_path(&v)))
                .unwrap_or(attack_defaults.save_path),
            clear_output: self.clear_output || attack_file.clear_output.unwrap_or(false),
        };

        let dataset = DatasetPathConfig {
            root: self
                .dataset_root
                .or_else(|| dataset_file.root.map(|v| expand_path(&v)))
                .unwrap_or_else(|| PathBuf::from("assets/datasets/val")),
            labels_subdir: self
                .labels_subdir
                .or(dataset_file.labels_subdir)
                .unwrap_or_else(|| "labels".to_string()),
            images_subdir: self
                .images_subdir
                .or(dataset_file.images_subdir)
                .unwrap_or_else(|| "images".to_string()),
        };

        let checkpoint = self
            .checkpoint
            .or_else(|| model_file.checkpoint.map(|v| expand_path(&v)));
        let infer_checkpoint = self
            .infer_checkpoint
            .or_else(|| model_file.infer_checkpoint.map(|v| expand_path(&v)))
            .or_else(|| checkpoint.clone());

        let model = ConvolutionalDetectorConfig {
            hidden: self
                .hidden
                .or(model_file.hidden)
                .unwrap_or(model_defaults.hidden),
            num_classes: self
                .num_classes
                .or(model_file.num_classes)
                .unwrap_or(model_defaults.num_classes),
            max_boxes: self
                .max_boxes
                .or(model_file.max_boxes)
                .unwrap_or(model_defaults.max_boxes),
        };

        AttackRunConfig {
            backend: self.backend.or(file.backend).unwrap_or(BackendKind::NdArray),
            attack,
            dataset,
            checkpoint,
            infer_checkpoint,
            model,
            norm: file.normalization.unwrap_or_default(),
            thresholds: InferenceThresholds {
                obj_thresh: self
                    .infer_obj_thresh
                    .or(infer_file.obj_thresh)
                    .unwrap_or(thresh_defaults.obj_thresh),
                iou_thresh: self
                    .infer_iou_thresh
                    .or(infer_file.iou_thresh)
                    .unwrap_or(thresh_defaults.iou_thresh),
            },
        }
    }
}

/// Expand a leading `~` and `${VAR}` references; unknown variables are kept verbatim.
pub fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = raw.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&rest[start..start + end + 3]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_replaces_known_and_keeps_unknown() {
        std::env::set_var("ATTACK_CFG_TEST_DIR", "/data/run");
        assert_eq!(
            expand_env("${ATTACK_CFG_TEST_DIR}/out"),
            "/data/run/out".to_string()
        );
        assert_eq!(
            expand_env("a/${ATTACK_CFG_TEST_MISSING}/b"),
            "a/${ATTACK_CFG_TEST_MISSING}/b".to_string()
        );
        assert_eq!(expand_env("plain/${unterminated"), "plain/${unterminated");
    }

    #[test]
    fn defaults_without_file_or_flags() {
        let run = AttackArgs::default().merge(AttackConfigFile::default());
        assert_eq!(run.attack, AttackConfig::default());
        assert_eq!(run.dataset.labels_subdir, "labels");
        assert!(run.checkpoint.is_none());
        assert_eq!(run.norm, ImageNormConfig::default());
    }
}
