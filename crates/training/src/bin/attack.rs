use anyhow::Context;
use burn::tensor::backend::Backend;
use clap::Parser;
use inference::{load_detector, InferenceFactory};
use training::attack_detector;
use training::config::AttackArgs;
use training::dataset::SampleLoader;
use training::util::{init_tracing, validate_backend_choice, ADBackend};
use vision_core::overlay::OverlaySink;

fn main() -> anyhow::Result<()> {
    init_tracing();
    let run = AttackArgs::parse().resolve()?;
    validate_backend_choice(run.backend)?;
    run.attack.validate()?;

    let checkpoint = run
        .checkpoint
        .clone()
        .context("a detector checkpoint is required (--checkpoint or [model].checkpoint)")?;
    let device = <ADBackend as Backend>::Device::default();
    let model = load_detector::<ADBackend>(&checkpoint, run.model.clone(), &device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", checkpoint.display()))?;
    tracing::info!(path = %checkpoint.display(), "loaded detector");

    let samples = run.dataset.load()?;
    if samples.is_empty() {
        println!("No samples found under {}", run.dataset.root.display());
        return Ok(());
    }
    let mut loader = SampleLoader::new(
        samples,
        run.norm,
        run.model.max_boxes,
        run.model.num_classes,
    )?;

    let detector = InferenceFactory.build(
        run.thresholds,
        run.infer_checkpoint.as_deref(),
        run.model.clone(),
        run.norm,
    );
    let mut sink = OverlaySink::new(detector);

    let summary = attack_detector::<ADBackend, _, _, _>(
        &model,
        &mut loader,
        &mut sink,
        &run.attack,
        &device,
    )?;
    println!("{summary}");
    Ok(())
}
