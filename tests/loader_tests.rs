//! Background loader feeding the pipelined training loop

mod common;

use std::sync::Arc;

use common::*;
use recpipe::backend::{Device, DeviceRuntime, HostRuntime};
use recpipe::config::{LoaderConfig, PipelineConfig};
use recpipe::pipeline::{train_pipeline_stages, BackgroundLoader, SparseDataDist, StagedPipeline};
use recpipe::value::Value;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_loader_feeds_manual_loop() -> anyhow::Result<()> {
    let rt = runtime();
    let fx = TwoTableModel::new();
    let sdd = SparseDataDist::builder(Arc::clone(&fx.model))
        .config(PipelineConfig::new().with_context_assertions(true))
        .build()?;
    let batches = synthetic_batches(6);

    let mut loader: BackgroundLoader<Value> = BackgroundLoader::spawn(
        rt.handle(),
        batches.clone(),
        Device::Cpu,
        Arc::clone(sdd.runtime()),
        &LoaderConfig::new().with_prefetch_depth(2),
    )?;

    let mut received = Vec::new();
    while let Some(batch) = loader.get_next_batch()? {
        received.push(batch);
    }
    assert!(loader.take_error().is_none());

    let outputs = run_pipelined(&sdd, received)?;
    assert_eq!(outputs.len(), 6);
    for (piped, expected) in outputs.iter().zip(eager_outputs(&batches)) {
        assert!(bit_identical(piped, &expected));
    }
    Ok(())
}

#[test]
fn test_loader_as_staged_source_on_accelerator() -> anyhow::Result<()> {
    let rt = runtime();
    let device = Device::Accelerator(0);
    let host = Arc::new(HostRuntime::with_trace());
    let runtime: Arc<dyn DeviceRuntime> = host.clone();
    let fx = TwoTableModel::on_device(device);
    let sdd = SparseDataDist::builder(Arc::clone(&fx.model))
        .runtime(Arc::clone(&runtime))
        .device(device)
        .config(PipelineConfig::new().with_context_assertions(true))
        .build()?;
    let batches = synthetic_batches(4);

    let loader: BackgroundLoader<Value> = BackgroundLoader::spawn(
        rt.handle(),
        batches.clone(),
        device,
        Arc::clone(&runtime),
        &LoaderConfig::new(),
    )?;
    let memcpy = loader.memcpy_stream().cloned().unwrap();

    // the loader already copied to the device, so the copy stage is a no-op move
    let stages = train_pipeline_stages(&sdd, device, true, None);
    let mut pipeline = StagedPipeline::new(stages, loader, Arc::clone(&runtime))?;
    let mut outputs = Vec::new();
    while let Some(batch) = pipeline.progress()? {
        outputs.push(sdd.model().forward(&[batch])?);
    }

    assert_eq!(outputs.len(), 4);
    assert_eq!(fx.user.contexts_created(), 4);
    let main = runtime.current_stream(device);
    assert!(host.trace().waits_of(main.id()).contains(&memcpy.id()));
    for (piped, expected) in outputs.iter().zip(eager_outputs(&batches)) {
        assert!(bit_identical(piped, &expected));
    }
    Ok(())
}
