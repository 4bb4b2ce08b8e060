//! Metrics collection for batchgen
//!
//! This module provides Prometheus metrics for the orchestrators, the actor
//! pools and the predictor's failure containment.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for batchgen
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub pipeline: PipelineMetrics,
    pub generation: GenerationMetrics,
    pub pool: PoolMetrics,
}

/// Message-level metrics, recorded by the orchestrators
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// Messages persisted and acknowledged
    pub messages_processed: IntCounter,

    /// Messages abandoned after a processing failure
    pub messages_failed: IntCounter,

    /// Rows read from input files
    pub rows_read: IntCounter,

    /// Output records written
    pub rows_written: IntCounter,

    /// Rows that never came back from the predictors
    pub rows_dropped: IntCounter,

    /// End-to-end message duration
    pub message_duration: Histogram,

    /// Orchestrators currently running
    pub active_orchestrators: IntGauge,
}

/// Predictor-side metrics
#[derive(Debug, Clone)]
pub struct GenerationMetrics {
    /// Rows over `max_context_length`
    pub context_too_long: IntCounter,

    /// Completions dropped for not finishing on a stop condition
    pub non_stop_dropped: IntCounter,

    /// Engine calls that failed with a device fault
    pub device_faults: IntCounter,

    /// Prompts per engine call
    pub batch_size: Histogram,

    /// Longest prompt per engine call
    pub batch_max_tokens: Histogram,

    /// Engine call duration
    pub generate_duration: Histogram,
}

/// Actor pool metrics
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Workers replaced after a crash
    pub actor_restarts: IntCounter,

    /// Workers given up on
    pub actor_deaths: IntCounter,

    /// Tasks submitted across all pools
    pub tasks_submitted: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let pipeline = PipelineMetrics {
            messages_processed: counter(
                &registry,
                "batchgen_messages_processed_total",
                "Messages persisted and acknowledged",
            ),
            messages_failed: counter(
                &registry,
                "batchgen_messages_failed_total",
                "Messages abandoned after a processing failure",
            ),
            rows_read: counter(&registry, "batchgen_rows_read_total", "Rows read from input files"),
            rows_written: counter(
                &registry,
                "batchgen_rows_written_total",
                "Output records written",
            ),
            rows_dropped: counter(
                &registry,
                "batchgen_rows_dropped_total",
                "Rows dropped by generation policy",
            ),
            message_duration: histogram(
                &registry,
                "batchgen_message_duration_seconds",
                "End-to-end message processing duration in seconds",
                vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0],
            ),
            active_orchestrators: gauge(
                &registry,
                "batchgen_active_orchestrators",
                "Orchestrators currently running",
            ),
        };

        let generation = GenerationMetrics {
            context_too_long: counter(
                &registry,
                "batchgen_context_too_long_total",
                "Rows longer than the maximum context length",
            ),
            non_stop_dropped: counter(
                &registry,
                "batchgen_non_stop_dropped_total",
                "Completions dropped for not finishing on a stop condition",
            ),
            device_faults: counter(
                &registry,
                "batchgen_device_faults_total",
                "Generation calls that failed with a device fault",
            ),
            batch_size: histogram(
                &registry,
                "batchgen_generation_batch_size",
                "Prompts per generation call",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0],
            ),
            batch_max_tokens: histogram(
                &registry,
                "batchgen_generation_batch_max_tokens",
                "Longest prompt per generation call",
                vec![64.0, 128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0],
            ),
            generate_duration: histogram(
                &registry,
                "batchgen_generate_duration_seconds",
                "Generation call duration in seconds",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
            ),
        };

        let pool = PoolMetrics {
            actor_restarts: counter(
                &registry,
                "batchgen_actor_restarts_total",
                "Pool workers replaced after a crash",
            ),
            actor_deaths: counter(
                &registry,
                "batchgen_actor_deaths_total",
                "Pool workers given up on",
            ),
            tasks_submitted: counter(
                &registry,
                "batchgen_tasks_submitted_total",
                "Tasks submitted to actor pools",
            ),
        };

        MetricsRegistry {
            registry,
            pipeline,
            generation,
            pool,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
