//! Pipeline assembly and execution
//!
//! A [`Pipeline`] is the explicit wiring of one run: the work queue, the codec
//! pool, the predictor pool, and `num_workers` orchestrators sharing them.
//! Orchestrators run on blocking threads; [`Pipeline::run`] waits for all of
//! them and then shuts both pools down.

use batchgen_common::{BatchGenError, Result, Settings};
use batchgen_worker::codec::{CodecPool, TextCodec, TokenizerCodec};
use batchgen_worker::predictor::{DummyPredictor, Predictor, PredictorPool};
use batchgen_worker::{
    ActorPool, InMemoryQueue, Orchestrator, RestartPolicy, RunSummary, TerminationReason, WorkQueue,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Builds the codec for a codec worker slot
pub type CodecFactory = Box<dyn Fn(usize) -> Result<Box<dyn TextCodec>> + Send + Sync>;

/// Builds the predictor for a predictor worker slot
pub type PredictorFactory = Box<dyn Fn(usize) -> Result<Box<dyn Predictor>> + Send + Sync>;

/// Builder for [`Pipeline`]
///
/// Anything not provided falls back to the settings: an [`InMemoryQueue`] over
/// the input directory, [`TokenizerCodec`]s loaded from the model directory,
/// and, in dummy mode only, [`DummyPredictor`]s.
pub struct PipelineBuilder {
    settings: Settings,
    queue: Option<Arc<dyn WorkQueue>>,
    codec: Option<CodecFactory>,
    predictor: Option<PredictorFactory>,
    shutdown: Arc<AtomicBool>,
}

impl PipelineBuilder {
    pub fn queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn codec<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> Result<Box<dyn TextCodec>> + Send + Sync + 'static,
    {
        self.codec = Some(Box::new(factory));
        self
    }

    /// Predictor factory; the slot can be used to pin an engine to a device
    pub fn predictor<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> Result<Box<dyn Predictor>> + Send + Sync + 'static,
    {
        self.predictor = Some(Box::new(factory));
        self
    }

    pub fn shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Validate the settings, create the queue and start both pools
    pub fn build(self) -> Result<Pipeline> {
        self.settings.validate()?;
        let settings = Arc::new(self.settings);
        let pipeline = &settings.pipeline;

        let queue: Arc<dyn WorkQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(InMemoryQueue::from_dirs(
                &pipeline.input_file_dir,
                &pipeline.output_file_dir,
            )?),
        };

        let codec = match self.codec {
            Some(codec) => codec,
            None => {
                let model = settings.model.clone();
                let format = settings.format.clone();
                Box::new(move |_: usize| {
                    Ok(Box::new(TokenizerCodec::load(&model, &format)?) as Box<dyn TextCodec>)
                }) as CodecFactory
            }
        };

        let predictor = match (self.predictor, settings.dummy_mode) {
            (Some(predictor), _) => predictor,
            (None, true) => {
                Box::new(|_: usize| Ok(Box::new(DummyPredictor) as Box<dyn Predictor>)) as PredictorFactory
            }
            (None, false) => {
                return Err(BatchGenError::config(
                    "A generation engine must be provided when not running in dummy_mode",
                ))
            }
        };

        let codecs: CodecPool =
            ActorPool::spawn("codec", pipeline.num_tokenizers, RestartPolicy::NEVER, codec)?;

        let restart_policy = RestartPolicy::new(
            pipeline.allowed_restarts_per_predictor,
            pipeline.max_task_retries(),
        );
        let predictors: PredictorPool = ActorPool::spawn(
            "predictor",
            settings.num_predictors(),
            restart_policy,
            predictor,
        )?;

        info!(
            orchestrators = pipeline.num_workers,
            codecs = codecs.size(),
            predictors = predictors.size(),
            gpus_per_predictor = settings.gpus_per_predictor(),
            "Pipeline assembled"
        );

        Ok(Pipeline {
            settings: settings.clone(),
            queue,
            codecs: Arc::new(codecs),
            predictors: Arc::new(predictors),
            shutdown: self.shutdown,
        })
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub orchestrators: Vec<RunSummary>,
}

impl PipelineReport {
    /// Work items taken off the queue across all orchestrators
    pub fn processed(&self) -> usize {
        self.orchestrators.iter().map(|summary| summary.processed).sum()
    }

    /// Whether any orchestrator crashed or stopped because a pool or the queue became unusable
    pub fn has_fatal_failure(&self) -> bool {
        self.orchestrators.iter().any(|summary| {
            matches!(
                summary.reason,
                TerminationReason::PoolDependencyFatal
                    | TerminationReason::QueueUnavailable
                    | TerminationReason::Crashed
            )
        })
    }
}

/// Queue, pools and orchestrators of one run
pub struct Pipeline {
    settings: Arc<Settings>,
    queue: Arc<dyn WorkQueue>,
    codecs: Arc<CodecPool>,
    predictors: Arc<PredictorPool>,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn builder(settings: Settings) -> PipelineBuilder {
        PipelineBuilder {
            settings,
            queue: None,
            codec: None,
            predictor: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that asks every orchestrator to stop before its next work item
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run all orchestrators to completion, then shut the pools down
    pub async fn run(self) -> Result<PipelineReport> {
        let mut orchestrators = JoinSet::new();
        for _ in 0..self.settings.pipeline.num_workers {
            let mut orchestrator = Orchestrator::new(
                self.settings.clone(),
                self.queue.clone(),
                self.codecs.clone(),
                self.predictors.clone(),
            )
            .with_shutdown(self.shutdown.clone());
            orchestrators.spawn_blocking(move || orchestrator.run());
        }

        let mut report = PipelineReport::default();
        while let Some(joined) = orchestrators.join_next().await {
            match joined {
                Ok(summary) => report.orchestrators.push(summary),
                Err(e) => {
                    error!("Orchestrator thread failed: {}", e);
                    // Work done before the crash is not recoverable from a JoinError
                    report.orchestrators.push(RunSummary {
                        processed: 0,
                        reason: TerminationReason::Crashed,
                    });
                }
            }
        }

        let Pipeline {
            codecs, predictors, ..
        } = self;
        // Joining worker threads blocks
        tokio::task::spawn_blocking(move || {
            drop(codecs);
            drop(predictors);
        })
        .await
        .map_err(|e| BatchGenError::internal(format!("Failed to shut down pools: {}", e)))?;

        if report.has_fatal_failure() {
            warn!(processed = report.processed(), "Pipeline finished with fatal failures");
        } else {
            info!(processed = report.processed(), "Pipeline finished");
        }
        Ok(report)
    }
}
