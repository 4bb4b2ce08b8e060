//! batchgen - Main Entry Point
//!
//! Runs one batch generation pass over the configured input directory.
//! Ctrl-C lets in-flight work items finish and stops orchestrators before
//! they fetch another one.

use anyhow::{bail, Context, Result};
use batchgen_common::logging::init_logging;
use batchgen_common::{Settings, METRICS};
use batchgen_coordinator::Pipeline;
use std::sync::atomic::Ordering;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("BATCHGEN_CONFIG").unwrap_or_else(|_| "configs/batchgen.yaml".to_string());

    let settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    init_logging(&settings.observability)?;

    info!(
        config = %config_path,
        input = %settings.pipeline.input_file_dir.display(),
        output = %settings.pipeline.output_file_dir.display(),
        dummy_mode = settings.dummy_mode,
        "Starting batchgen"
    );

    let metrics_path = settings.observability.metrics_path.clone();

    // Loading tokenizers and spawning pool threads blocks
    let pipeline = tokio::task::spawn_blocking(move || Pipeline::builder(settings).build())
        .await
        .context("Pipeline setup panicked")??;
    let shutdown = pipeline.shutdown_handle();

    let run = pipeline.run();
    tokio::pin!(run);

    let report = tokio::select! {
        report = &mut run => report?,
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal, finishing in-flight work items");
            shutdown.store(true, Ordering::SeqCst);
            run.await?
        }
    };

    if let Some(path) = metrics_path {
        std::fs::write(&path, METRICS.gather())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    if report.has_fatal_failure() {
        bail!(
            "Generation stopped early after {} work items: an orchestrator crashed or a worker pool or the queue became unusable",
            report.processed()
        );
    }

    info!(processed = report.processed(), "batchgen finished");
    Ok(())
}
