use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::tensor::Tensor;
use data_contracts::{ImageMeta, ImageNormConfig};
use models::{
    scalar_f32, ConvolutionalDetector, ConvolutionalDetectorConfig, DetectionTargets, LossOutputs,
    LossTerm, ACCURACY_KEY,
};
use std::fs;
use std::path::{Path, PathBuf};
use training::dataset::{BatchSource, DatasetPathConfig, SampleLoader};
use training::{
    attack_detector, perturb_batch, AttackConfig, AttackError, LossModel, ATTACK_PREFIX,
};
use vision_core::display::DisplayImage;
use vision_core::interfaces::{VisualizationError, VisualizationSink};
use vision_core::overlay::OverlaySink;

type B = Autodiff<NdArray<f32>>;

fn write_dataset(root: &Path, count: usize) {
    let labels = root.join("labels");
    let images = root.join("images");
    fs::create_dir_all(&labels).unwrap();
    fs::create_dir_all(&images).unwrap();
    for i in 0..count {
        let name = format!("img_{i}.png");
        let img = image::RgbImage::from_fn(8, 8, |x, y| {
            image::Rgb([
                (x * 30 + i as u32 * 17) as u8,
                (y * 25 + 40) as u8,
                ((x + y) * 10 + 90) as u8,
            ])
        });
        img.save(images.join(&name)).unwrap();
        let label = serde_json::json!({
            "image": name,
            "labels": [{ "bbox_px": [1.0, 1.0, 6.0, 5.0], "bbox_norm": null, "class_id": 1 }]
        });
        fs::write(
            labels.join(format!("img_{i}.json")),
            serde_json::to_vec(&label).unwrap(),
        )
        .unwrap();
    }
}

fn loader(root: &Path) -> SampleLoader {
    let samples = DatasetPathConfig {
        root: root.to_path_buf(),
        labels_subdir: "labels".into(),
        images_subdir: "images".into(),
    }
    .load()
    .unwrap();
    SampleLoader::new(samples, ImageNormConfig::default(), 4, 2).unwrap()
}

fn model() -> ConvolutionalDetector<B> {
    ConvolutionalDetector::new(
        ConvolutionalDetectorConfig {
            hidden: 8,
            num_classes: 2,
            max_boxes: 4,
        },
        &Default::default(),
    )
}

fn attack_cfg(save_path: PathBuf) -> AttackConfig {
    AttackConfig {
        epsilon: 0.5,
        num_attack_iter: 3,
        max_attack_batches: 100,
        save_path,
        clear_output: false,
    }
}

/// Records target paths without touching the filesystem.
#[derive(Default)]
struct RecordingSink {
    paths: Vec<PathBuf>,
    sizes: Vec<(u32, u32)>,
}

impl VisualizationSink for RecordingSink {
    fn visualize(&mut self, image: &DisplayImage, path: &Path) -> Result<(), VisualizationError> {
        self.paths.push(path.to_path_buf());
        self.sizes.push((image.width, image.height));
        Ok(())
    }
}

fn max_abs_diff(a: Tensor<NdArray<f32>, 4>, b: Tensor<NdArray<f32>, 4>) -> f32 {
    scalar_f32((a - b).abs().max()).unwrap()
}

#[test]
fn attack_renders_original_and_attack_images() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"), 3);
    let out = dir.path().join("out");
    let cfg = attack_cfg(out.clone());

    let mut source = loader(&dir.path().join("data"));
    let mut sink = OverlaySink::plain();
    let summary = attack_detector::<B, _, _, _>(
        &model(),
        &mut source,
        &mut sink,
        &cfg,
        &Default::default(),
    )
    .expect("attack");

    assert_eq!(summary.batches, 3);
    for i in 0..3 {
        assert!(out.join(format!("img_{i}.png")).exists());
        assert!(out.join(format!("{ATTACK_PREFIX}img_{i}.png")).exists());
    }
    let rendered = image::open(out.join("attack_img_0.png")).unwrap().to_rgb8();
    assert_eq!(rendered.dimensions(), (8, 8));
}

#[test]
fn summary_means_come_from_first_and_last_trace_entries() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 3);
    let cfg = attack_cfg(dir.path().join("out"));
    let mut source = loader(dir.path());
    let mut sink = RecordingSink::default();
    let summary =
        attack_detector::<B, _, _, _>(&model(), &mut source, &mut sink, &cfg, &Default::default())
            .unwrap();

    assert_eq!(summary.traces.len(), 3);
    for trace in &summary.traces {
        assert_eq!(trace.len(), cfg.num_attack_iter);
        assert!(trace.values().iter().all(|acc| (0.0..=100.0).contains(acc)));
    }
    let n = summary.traces.len() as f32;
    let before: f32 = summary.traces.iter().filter_map(|t| t.before()).sum::<f32>() / n;
    let under: f32 = summary.traces.iter().filter_map(|t| t.after()).sum::<f32>() / n;
    assert!((summary.acc_before - before).abs() < 1e-4);
    assert!((summary.acc_under - under).abs() < 1e-4);
    assert!((summary.decrease() - (before - under)).abs() < 1e-4);
}

#[test]
fn max_attack_batches_caps_processing() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 3);
    let cfg = AttackConfig {
        max_attack_batches: 2,
        ..attack_cfg(dir.path().join("out"))
    };
    let mut source = loader(dir.path());
    let mut sink = RecordingSink::default();
    let summary =
        attack_detector::<B, _, _, _>(&model(), &mut source, &mut sink, &cfg, &Default::default())
            .unwrap();

    assert_eq!(summary.batches, 2);
    assert_eq!(
        sink.paths,
        vec![
            cfg.save_path.join("img_0.png"),
            cfg.save_path.join("attack_img_0.png"),
            cfg.save_path.join("img_1.png"),
            cfg.save_path.join("attack_img_1.png"),
        ]
    );
    assert!(sink.sizes.iter().all(|size| *size == (8, 8)));
}

#[test]
fn cap_equal_to_source_length_processes_every_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 3);
    let cfg = AttackConfig {
        max_attack_batches: 3,
        ..attack_cfg(dir.path().join("out"))
    };
    let mut source = loader(dir.path());
    let mut sink = RecordingSink::default();
    let summary =
        attack_detector::<B, _, _, _>(&model(), &mut source, &mut sink, &cfg, &Default::default())
            .unwrap();

    assert_eq!(summary.batches, 3);
    assert_eq!(sink.paths.len(), 6);
    let before: f32 = summary.traces.iter().filter_map(|t| t.before()).sum::<f32>() / 3.0;
    let under: f32 = summary.traces.iter().filter_map(|t| t.after()).sum::<f32>() / 3.0;
    assert!((summary.acc_before - before).abs() < 1e-4);
    assert!((summary.acc_under - under).abs() < 1e-4);
}

#[test]
fn perturbation_stays_within_epsilon() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 1);
    let cfg = attack_cfg(dir.path().join("out"));
    let mut source = loader(dir.path());
    let batch = source
        .next_batch::<B>(&Default::default())
        .unwrap()
        .unwrap();

    let result = perturb_batch(&model(), &batch, &cfg).unwrap();
    let diff = max_abs_diff(result.perturbed, result.original);
    assert!(diff > 0.0);
    assert!(diff <= cfg.epsilon + 1e-5, "L-inf change {diff}");
    assert_eq!(result.trace.len(), 3);
}

#[test]
fn zero_epsilon_leaves_image_and_accuracy_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 2);
    let cfg = AttackConfig {
        epsilon: 0.0,
        ..attack_cfg(dir.path().join("out"))
    };
    let detector = model();
    let mut source = loader(dir.path());
    let batch = source
        .next_batch::<B>(&Default::default())
        .unwrap()
        .unwrap();
    let result = perturb_batch(&detector, &batch, &cfg).unwrap();
    assert_eq!(max_abs_diff(result.perturbed, result.original), 0.0);
    let first = result.trace.values()[0];
    assert!(result.trace.values().iter().all(|acc| *acc == first));

    let mut source = loader(dir.path());
    let mut sink = RecordingSink::default();
    let summary =
        attack_detector::<B, _, _, _>(&detector, &mut source, &mut sink, &cfg, &Default::default())
            .unwrap();
    assert_eq!(summary.acc_before, summary.acc_under);
    assert_eq!(summary.decrease(), 0.0);
}

#[test]
fn single_iteration_reports_the_same_accuracy_twice() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 2);
    let cfg = AttackConfig {
        num_attack_iter: 1,
        ..attack_cfg(dir.path().join("out"))
    };
    let mut source = loader(dir.path());
    let mut sink = RecordingSink::default();
    let summary =
        attack_detector::<B, _, _, _>(&model(), &mut source, &mut sink, &cfg, &Default::default())
            .unwrap();
    assert_eq!(summary.acc_before, summary.acc_under);
}

#[test]
fn clear_output_removes_stale_files() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(&dir.path().join("data"), 1);
    let out = dir.path().join("out");
    fs::create_dir_all(out.join("previous_run")).unwrap();
    fs::write(out.join("stale.png"), b"old").unwrap();
    fs::write(out.join("previous_run/attack_img_9.png"), b"old").unwrap();

    let mut sink = RecordingSink::default();
    let keep = attack_cfg(out.clone());
    attack_detector::<B, _, _, _>(
        &model(),
        &mut loader(&dir.path().join("data")),
        &mut sink,
        &keep,
        &Default::default(),
    )
    .unwrap();
    assert!(out.join("stale.png").exists());

    let clear = AttackConfig {
        clear_output: true,
        ..keep
    };
    attack_detector::<B, _, _, _>(
        &model(),
        &mut loader(&dir.path().join("data")),
        &mut OverlaySink::plain(),
        &clear,
        &Default::default(),
    )
    .unwrap();
    assert!(!out.join("stale.png").exists());
    assert!(!out.join("previous_run").exists());
    let mut left: Vec<_> = fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    left.sort();
    assert_eq!(left, vec!["attack_img_0.png", "img_0.png"]);
}

#[test]
fn empty_source_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 0);
    let cfg = attack_cfg(dir.path().join("out"));
    let mut sink = RecordingSink::default();
    let err = attack_detector::<B, _, _, _>(
        &model(),
        &mut loader(dir.path()),
        &mut sink,
        &cfg,
        &Default::default(),
    )
    .unwrap_err();
    assert!(matches!(err, AttackError::NoBatches));
}

struct WithoutAccuracy(ConvolutionalDetector<B>);

impl LossModel<B> for WithoutAccuracy {
    fn loss(
        &self,
        images: Tensor<B, 4>,
        _metas: &[ImageMeta],
        targets: &DetectionTargets<B>,
    ) -> LossOutputs<B> {
        let mut outputs = self.0.forward_loss(images, targets);
        outputs.remove(ACCURACY_KEY);
        outputs
    }
}

struct DetachedInput(ConvolutionalDetector<B>);

impl LossModel<B> for DetachedInput {
    fn loss(
        &self,
        images: Tensor<B, 4>,
        _metas: &[ImageMeta],
        targets: &DetectionTargets<B>,
    ) -> LossOutputs<B> {
        self.0.forward_loss(images.detach(), targets)
    }
}

/// Loss that depends on the image with zero slope everywhere.
struct FlatLoss;

impl LossModel<B> for FlatLoss {
    fn loss(
        &self,
        images: Tensor<B, 4>,
        _metas: &[ImageMeta],
        _targets: &DetectionTargets<B>,
    ) -> LossOutputs<B> {
        let device = images.device();
        LossOutputs::new()
            .with("loss_flat", LossTerm::Single(images.mul_scalar(0.0).sum()))
            .with(ACCURACY_KEY, LossTerm::Single(Tensor::<B, 1>::ones([1], &device)))
    }
}

/// Reports an accuracy entry holding no values.
struct EmptyAccuracy(ConvolutionalDetector<B>);

impl LossModel<B> for EmptyAccuracy {
    fn loss(
        &self,
        images: Tensor<B, 4>,
        _metas: &[ImageMeta],
        targets: &DetectionTargets<B>,
    ) -> LossOutputs<B> {
        let device = images.device();
        let mut outputs = self.0.forward_loss(images, targets);
        outputs.insert(
            ACCURACY_KEY,
            LossTerm::Single(Tensor::<B, 1>::zeros([0], &device)),
        );
        outputs
    }
}

fn run_with<M: LossModel<B>>(model: &M) -> AttackError {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), 1);
    let cfg = attack_cfg(dir.path().join("out"));
    let mut sink = RecordingSink::default();
    attack_detector::<B, _, _, _>(
        model,
        &mut loader(dir.path()),
        &mut sink,
        &cfg,
        &Default::default(),
    )
    .unwrap_err()
}

#[test]
fn missing_accuracy_is_fatal() {
    assert!(matches!(
        run_with(&WithoutAccuracy(model())),
        AttackError::MissingAccuracy { step: 0 }
    ));
}

#[test]
fn missing_input_gradient_is_fatal() {
    assert!(matches!(
        run_with(&DetachedInput(model())),
        AttackError::MissingGradient { step: 0 }
    ));
}

#[test]
fn zero_gradient_is_fatal() {
    match run_with(&FlatLoss) {
        AttackError::DegenerateGradient { step, max_abs } => {
            assert_eq!(step, 0);
            assert_eq!(max_abs, 0.0);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unreadable_accuracy_is_fatal() {
    assert!(matches!(
        run_with(&EmptyAccuracy(model())),
        AttackError::TensorData(_)
    ));
}
