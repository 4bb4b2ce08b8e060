//! Worker orchestrator
//!
//! An orchestrator drives work items end to end, one at a time:
//!
//! ```text
//! file -> rows -> prepare (codec pool) -> sort by length -> batches
//!      -> predict (predictor pool) -> decode (codec pool) -> merge by index
//!      -> serialize -> persist -> acknowledge
//! ```
//!
//! Pools complete work out of order, so every stage carries the row index and
//! the final merge re-associates results with their source rows. Rows whose
//! index never comes back were dropped by policy and are left out of the output.
//!
//! Several orchestrators share one queue and both pools; each runs on its own
//! thread and blocks while its tasks are in flight.

use crate::batching::{flatten, flatten_and_sort, form_batches, simple_chunks, until_error};
use crate::codec::{CodecPool, TextCodec};
use crate::io;
use crate::messages::{CompletedItem, Instance, PreparedInputItem, RawInputItem};
use crate::predictor::{Predictor, PredictorPool};
use crate::queue::{WorkItem, WorkQueue};
use crate::serializer::{default_serializer, Serializer};
use batchgen_common::{Result, Settings, METRICS};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    FetchingWork,
    Processing,
    Succeeded,
    Failed,
    Terminated,
}

/// Why an orchestrator stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The queue had no more work
    QueueExhausted,
    /// `max_num_messages_per_worker` work items were handled
    MessageLimit,
    /// The queue could not be reached
    QueueUnavailable,
    /// A pool lost its last worker
    PoolDependencyFatal,
    /// Shutdown was requested
    Shutdown,
    /// The orchestrator thread panicked; reported by whoever joins it
    Crashed,
}

/// Outcome of [`Orchestrator::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Work items taken off the queue, failed ones included
    pub processed: usize,
    pub reason: TerminationReason,
}

fn prepare_task(codec: &mut Box<dyn TextCodec>, batch: &Vec<RawInputItem>) -> Result<Vec<PreparedInputItem>> {
    codec.prepare(batch)
}

fn predict_task(predictor: &mut Box<dyn Predictor>, batch: &Vec<PreparedInputItem>) -> Result<Vec<CompletedItem>> {
    predictor.predict(batch)
}

fn decode_task(codec: &mut Box<dyn TextCodec>, batch: &Vec<CompletedItem>) -> Result<Vec<CompletedItem>> {
    codec.decode(batch)
}

/// Drives work items from the queue through the pools
pub struct Orchestrator {
    id: Uuid,
    settings: Arc<Settings>,
    queue: Arc<dyn WorkQueue>,
    codecs: Arc<CodecPool>,
    predictors: Arc<PredictorPool>,
    serializer: Serializer,
    shutdown: Arc<AtomicBool>,
    state: OrchestratorState,
    processed: usize,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        queue: Arc<dyn WorkQueue>,
        codecs: Arc<CodecPool>,
        predictors: Arc<PredictorPool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            queue,
            codecs,
            predictors,
            serializer: default_serializer,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: OrchestratorState::Idle,
            processed: 0,
        }
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Stop before fetching the next work item once `flag` is set
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    fn transition(&mut self, next: OrchestratorState) {
        debug!(from = ?self.state, to = ?next, "State transition");
        self.state = next;
    }

    /// Work until the queue is empty, the message limit is hit, or a fatal error occurs
    pub fn run(&mut self) -> RunSummary {
        let span = info_span!("orchestrator", id = %self.id);
        let _guard = span.enter();

        info!("Orchestrator started");
        METRICS.pipeline.active_orchestrators.inc();
        let reason = self.work_loop();
        METRICS.pipeline.active_orchestrators.dec();
        self.transition(OrchestratorState::Terminated);
        info!(processed = self.processed, ?reason, "Orchestrator terminated");

        RunSummary {
            processed: self.processed,
            reason,
        }
    }

    fn work_loop(&mut self) -> TerminationReason {
        let limit = self
            .settings
            .pipeline
            .max_num_messages_per_worker
            .filter(|&limit| limit > 0);

        loop {
            if limit.is_some_and(|limit| self.processed >= limit) {
                info!(processed = self.processed, "Message limit reached");
                return TerminationReason::MessageLimit;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested");
                return TerminationReason::Shutdown;
            }

            self.transition(OrchestratorState::FetchingWork);
            let item = match self.queue.get_next() {
                Ok(Some(item)) => item,
                Ok(None) => {
                    info!("Out of work items");
                    return TerminationReason::QueueExhausted;
                }
                Err(e) => {
                    error!("Failed to fetch work item: {}", e);
                    return TerminationReason::QueueUnavailable;
                }
            };

            self.transition(OrchestratorState::Processing);
            info!(message_id = %item.id, "Processing work item");
            let started = Instant::now();
            let outcome = self
                .process(&item)
                .and_then(|written| self.queue.acknowledge(&item).map(|()| written));
            METRICS
                .pipeline
                .message_duration
                .observe(started.elapsed().as_secs_f64());
            self.processed += 1;

            match outcome {
                Ok(written) => {
                    self.transition(OrchestratorState::Succeeded);
                    METRICS.pipeline.messages_processed.inc();
                    info!(
                        message_id = %item.id,
                        written,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Finished work item"
                    );
                }
                Err(e) if e.is_fatal() => {
                    self.transition(OrchestratorState::Failed);
                    METRICS.pipeline.messages_failed.inc();
                    error!(
                        message_id = %item.id,
                        "A pool this orchestrator depends on has died: {}", e
                    );
                    return TerminationReason::PoolDependencyFatal;
                }
                Err(e) => {
                    self.transition(OrchestratorState::Failed);
                    METRICS.pipeline.messages_failed.inc();
                    error!(message_id = %item.id, "Failed to process work item: {}", e);
                }
            }

            self.transition(OrchestratorState::Idle);
        }
    }

    /// Run one work item through the pipeline; returns the number of records written
    fn process(&self, item: &WorkItem) -> Result<usize> {
        let instances = self.load(&item.source)?;

        let rows = instances
            .iter()
            .enumerate()
            .map(|(index, instance)| RawInputItem::from_instance(index, instance))
            .collect::<Result<Vec<_>>>()?;

        let prepared = self.prepare_and_sort(rows)?;
        debug!(message_id = %item.id, rows = prepared.len(), "Prepared rows");

        let mut completed = self.predict_and_decode(prepared)?;

        let mut records = Vec::with_capacity(completed.len());
        for (index, instance) in instances.iter().enumerate() {
            if let Some(result) = completed.remove(&index) {
                records.push((self.serializer)(instance, &result.outputs, result.error)?);
            }
        }

        let dropped = instances.len() - records.len();
        if dropped > 0 {
            debug!(message_id = %item.id, dropped, "Rows dropped by generation policy");
            METRICS.pipeline.rows_dropped.inc_by(dropped as u64);
        }

        self.persist(&records, &item.source)?;
        Ok(records.len())
    }

    fn load(&self, source: &Path) -> Result<Vec<Instance>> {
        let mut instances = io::load_instances(source)?;

        if let Some(cap) = self.settings.row_cap() {
            if instances.len() > cap {
                info!(rows = instances.len(), cap, "Truncating work item");
                instances.truncate(cap);
            }
        }

        METRICS.pipeline.rows_read.inc_by(instances.len() as u64);
        Ok(instances)
    }

    /// Tokenize on the codec pool and sort ascending by token count
    fn prepare_and_sort(&self, rows: Vec<RawInputItem>) -> Result<Vec<PreparedInputItem>> {
        let chunks = simple_chunks(rows, self.settings.pipeline.tokenization_batch_size);
        let prepared = self
            .codecs
            .map_unordered(prepare_task, chunks)
            .collect::<Result<Vec<_>>>()?;

        Ok(flatten_and_sort(prepared))
    }

    /// Generate on the predictor pool and decode on the codec pool, keyed by row index
    fn predict_and_decode(&self, prepared: Vec<PreparedInputItem>) -> Result<HashMap<usize, CompletedItem>> {
        let pipeline = &self.settings.pipeline;
        let batches = form_batches(prepared, &pipeline.generation_batch_size);

        let mut failure = None;
        let predictions = until_error(
            flatten(self.predictors.map_unordered(predict_task, batches)),
            &mut failure,
        );
        let decoded = self
            .codecs
            .map_unordered(decode_task, simple_chunks(predictions, pipeline.decoding_batch_size));

        let mut by_index = HashMap::new();
        for chunk in decoded {
            for item in chunk? {
                if let Some(previous) = by_index.insert(item.index, item) {
                    warn!(index = previous.index, "Row completed more than once");
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(by_index),
        }
    }

    fn persist(&self, records: &[Instance], source: &Path) -> Result<()> {
        if self.settings.dummy_mode {
            info!(records = records.len(), "Running in dummy mode, not writing");
            return Ok(());
        }

        let path = io::write_instances(records, source, &self.settings.pipeline.output_file_dir)?;
        METRICS.pipeline.rows_written.inc_by(records.len() as u64);
        debug!(path = %path.display(), records = records.len(), "Wrote output file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CompletionError, CompletionOutput};
    use crate::pool::{ActorPool, RestartPolicy};
    use crate::predictor::DummyPredictor;
    use crate::queue::InMemoryQueue;
    use batchgen_common::config::{
        FormatConfig, GenerateConfig, GenerationBatchSize, ModelConfig, ObservabilityConfig,
        PipelineConfig,
    };
    use batchgen_common::BatchGenError;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::TempDir;

    /// One token per byte of the last message's text
    struct ByteCodec;

    impl TextCodec for ByteCodec {
        fn prepare(&mut self, batch: &[RawInputItem]) -> Result<Vec<PreparedInputItem>> {
            Ok(batch
                .iter()
                .map(|row| {
                    let text = row.messages.last().map(|m| m.text()).unwrap_or_default();
                    PreparedInputItem::new(row.index, text.bytes().map(u32::from).collect())
                })
                .collect())
        }

        fn decode(&mut self, batch: &[CompletedItem]) -> Result<Vec<CompletedItem>> {
            let mut decoded = batch.to_vec();
            for output in decoded.iter_mut().flat_map(|item| item.outputs.iter_mut()) {
                output.text = output.token_ids.iter().map(|&id| char::from(id as u8)).collect();
            }
            Ok(decoded)
        }
    }

    /// Drops even rows, flags rows over 6 tokens as too long
    struct PickyPredictor;

    impl Predictor for PickyPredictor {
        fn predict(&mut self, batch: &[PreparedInputItem]) -> Result<Vec<CompletedItem>> {
            Ok(batch
                .iter()
                .filter(|item| item.index % 2 == 1)
                .map(|item| {
                    if item.num_tokens() > 6 {
                        CompletedItem::failed(item.index, CompletionError::ContextTooLong)
                    } else {
                        CompletedItem::success(
                            item.index,
                            vec![CompletionOutput {
                                index: 0,
                                text: String::new(),
                                token_ids: item.token_ids.iter().rev().copied().collect(),
                                finish_reason: Some("stop".to_string()),
                                stop_reason: None,
                            }],
                        )
                    }
                })
                .collect())
        }
    }

    struct PanickingPredictor;

    impl Predictor for PanickingPredictor {
        fn predict(&mut self, _batch: &[PreparedInputItem]) -> Result<Vec<CompletedItem>> {
            panic!("predictor process died");
        }
    }

    struct UnreachableQueue;

    impl WorkQueue for UnreachableQueue {
        fn get_next(&self) -> Result<Option<WorkItem>> {
            Err(BatchGenError::queue("connection refused"))
        }

        fn acknowledge(&self, _item: &WorkItem) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        input: TempDir,
        output: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                input: tempfile::tempdir().unwrap(),
                output: tempfile::tempdir().unwrap(),
            }
        }

        fn write_input(&self, name: &str, rows: &[Value]) {
            let lines: Vec<String> = rows.iter().map(Value::to_string).collect();
            fs::write(self.input.path().join(name), lines.join("\n")).unwrap();
        }

        fn read_output(&self, name: &str) -> Vec<Value> {
            fs::read_to_string(self.output.path().join(name))
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }

        fn settings(&self, generation_batch_size: GenerationBatchSize) -> Settings {
            let mut pipeline = PipelineConfig::new(self.input.path(), self.output.path(), generation_batch_size);
            pipeline.tokenization_batch_size = 2;
            pipeline.decoding_batch_size = 3;
            Settings {
                model: ModelConfig::default(),
                format: FormatConfig::default(),
                generate: GenerateConfig::default(),
                pipeline,
                observability: ObservabilityConfig::default(),
                dummy_mode: false,
            }
        }

        fn queue(&self) -> Arc<InMemoryQueue> {
            Arc::new(InMemoryQueue::from_dirs(self.input.path(), self.output.path()).unwrap())
        }
    }

    fn codec_pool() -> Arc<CodecPool> {
        Arc::new(
            ActorPool::spawn("codec", 3, RestartPolicy::NEVER, |_| {
                Ok(Box::new(ByteCodec) as Box<dyn TextCodec>)
            })
            .unwrap(),
        )
    }

    fn predictor_pool<P, F>(factory: F) -> Arc<PredictorPool>
    where
        P: Predictor + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        Arc::new(
            ActorPool::spawn("predictor", 2, RestartPolicy::NEVER, move |_| {
                Ok(Box::new(factory()) as Box<dyn Predictor>)
            })
            .unwrap(),
        )
    }

    fn orchestrator(settings: Settings, queue: Arc<dyn WorkQueue>, predictors: Arc<PredictorPool>) -> Orchestrator {
        Orchestrator::new(Arc::new(settings), queue, codec_pool(), predictors)
    }

    fn texts(n: usize) -> Vec<Value> {
        // Lengths deliberately out of order
        (0..n)
            .map(|i| json!({"id": i, "text": "x".repeat(1 + (i * 7) % 5)}))
            .collect()
    }

    #[test]
    fn test_output_rows_keep_input_order() {
        let fixture = Fixture::new();
        let rows = texts(23);
        fixture.write_input("part-0.jsonl", &rows);
        let settings = fixture.settings(GenerationBatchSize::Bracketed(vec![(2, 4).into(), (4, 3).into(), (8, 2).into()]));
        let queue = fixture.queue();

        let summary = orchestrator(settings, queue.clone(), predictor_pool(|| DummyPredictor)).run();

        assert_eq!(summary, RunSummary { processed: 1, reason: TerminationReason::QueueExhausted });
        let output = fixture.read_output("part-0.jsonl");
        assert_eq!(output.len(), rows.len());
        for (record, row) in output.iter().zip(&rows) {
            assert_eq!(record["id"], row["id"]);
            assert_eq!(record["outputs"][0]["text"], row["text"]);
            assert_eq!(record["outputs"][0]["finish_reason"], Value::Null);
        }
        assert_eq!(queue.acknowledged(), 1);
    }

    #[test]
    fn test_dropped_rows_are_omitted_and_errors_serialized() {
        let fixture = Fixture::new();
        let rows: Vec<Value> = ["a", "bb", "ccc", "way too long", "dddd", "eeeee"]
            .iter()
            .enumerate()
            .map(|(i, text)| json!({"id": i, "text": text}))
            .collect();
        fixture.write_input("part-0.jsonl", &rows);
        let settings = fixture.settings(GenerationBatchSize::Flat(2));

        orchestrator(settings, fixture.queue(), predictor_pool(|| PickyPredictor)).run();

        let output = fixture.read_output("part-0.jsonl");
        let ids: Vec<_> = output.iter().map(|record| record["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(3), json!(5)]);
        assert_eq!(output[0]["outputs"][0]["text"], json!("bb"));
        assert_eq!(output[1]["outputs"], Value::Null);
        assert_eq!(output[1]["completion_error"], json!("CONTEXT_TOO_LONG"));
        assert_eq!(output[2]["outputs"][0]["text"], json!("eeeee"));
    }

    #[test]
    fn test_chat_rows_are_supported() {
        let fixture = Fixture::new();
        fixture.write_input(
            "chat.jsonl",
            &[json!({"chat_messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": [{"type": "text", "text": "hello"}]},
            ]})],
        );
        let settings = fixture.settings(GenerationBatchSize::Flat(4));

        orchestrator(settings, fixture.queue(), predictor_pool(|| DummyPredictor)).run();

        let output = fixture.read_output("chat.jsonl");
        assert_eq!(output[0]["outputs"][0]["text"], json!("hello"));
        assert_eq!(output[0]["chat_messages"][0]["role"], json!("system"));
    }

    #[test]
    fn test_failed_item_is_skipped_and_not_acknowledged() {
        let fixture = Fixture::new();
        fixture.write_input("a.jsonl", &[json!({"text": "fine"}), json!({"neither": "field"})]);
        fixture.write_input("b.jsonl", &[json!({"text": "fine"})]);
        let settings = fixture.settings(GenerationBatchSize::Flat(4));
        let queue = fixture.queue();

        let summary = orchestrator(settings, queue.clone(), predictor_pool(|| DummyPredictor)).run();

        assert_eq!(summary, RunSummary { processed: 2, reason: TerminationReason::QueueExhausted });
        assert!(!fixture.output.path().join("a.jsonl").exists());
        assert_eq!(fixture.read_output("b.jsonl").len(), 1);
        assert_eq!(queue.acknowledged(), 1);
    }

    #[test]
    fn test_dead_predictor_pool_terminates_the_orchestrator() {
        let fixture = Fixture::new();
        fixture.write_input("a.jsonl", &texts(4));
        fixture.write_input("b.jsonl", &texts(4));
        let settings = fixture.settings(GenerationBatchSize::Flat(1));
        let queue = fixture.queue();

        let mut orchestrator = orchestrator(settings, queue.clone(), predictor_pool(|| PanickingPredictor));
        let summary = orchestrator.run();

        assert_eq!(summary, RunSummary { processed: 1, reason: TerminationReason::PoolDependencyFatal });
        assert_eq!(orchestrator.state(), OrchestratorState::Terminated);
        assert_eq!(queue.remaining(), 1);
        assert_eq!(queue.acknowledged(), 0);
    }

    #[test]
    fn test_message_limit_stops_early() {
        let fixture = Fixture::new();
        for name in ["a.jsonl", "b.jsonl", "c.jsonl"] {
            fixture.write_input(name, &texts(2));
        }
        let mut settings = fixture.settings(GenerationBatchSize::Flat(4));
        settings.pipeline.max_num_messages_per_worker = Some(2);
        let queue = fixture.queue();

        let summary = orchestrator(settings, queue.clone(), predictor_pool(|| DummyPredictor)).run();

        assert_eq!(summary, RunSummary { processed: 2, reason: TerminationReason::MessageLimit });
        assert_eq!(queue.remaining(), 1);
    }

    #[test]
    fn test_dummy_mode_caps_rows_and_skips_writing() {
        let fixture = Fixture::new();
        fixture.write_input("a.jsonl", &texts(150));
        let mut settings = fixture.settings(GenerationBatchSize::Flat(16));
        settings.dummy_mode = true;
        let queue = fixture.queue();

        let summary = orchestrator(settings, queue.clone(), predictor_pool(|| DummyPredictor)).run();

        assert_eq!(summary.processed, 1);
        assert_eq!(queue.acknowledged(), 1);
        assert_eq!(fs::read_dir(fixture.output.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_row_cap_truncates_the_file() {
        let fixture = Fixture::new();
        fixture.write_input("a.jsonl", &texts(10));
        let mut settings = fixture.settings(GenerationBatchSize::Flat(4));
        settings.pipeline.max_instances_per_message = Some(3);

        orchestrator(settings, fixture.queue(), predictor_pool(|| DummyPredictor)).run();

        let ids: Vec<_> = fixture.read_output("a.jsonl").iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn test_shutdown_flag_stops_before_fetching() {
        let fixture = Fixture::new();
        fixture.write_input("a.jsonl", &texts(2));
        let settings = fixture.settings(GenerationBatchSize::Flat(4));
        let queue = fixture.queue();
        let flag = Arc::new(AtomicBool::new(true));

        let summary = orchestrator(settings, queue.clone(), predictor_pool(|| DummyPredictor))
            .with_shutdown(flag)
            .run();

        assert_eq!(summary, RunSummary { processed: 0, reason: TerminationReason::Shutdown });
        assert_eq!(queue.remaining(), 1);
    }

    #[test]
    fn test_unreachable_queue_terminates() {
        let fixture = Fixture::new();
        let settings = fixture.settings(GenerationBatchSize::Flat(4));

        let summary = orchestrator(settings, Arc::new(UnreachableQueue), predictor_pool(|| DummyPredictor)).run();

        assert_eq!(summary, RunSummary { processed: 0, reason: TerminationReason::QueueUnavailable });
    }

    #[test]
    fn test_custom_serializer() {
        fn ids_only(input: &Instance, outputs: &[CompletionOutput], _: Option<CompletionError>) -> Result<Instance> {
            let mut record = Instance::new();
            record.insert("id".to_string(), input["id"].clone());
            record.insert("n".to_string(), json!(outputs.len()));
            Ok(record)
        }

        let fixture = Fixture::new();
        fixture.write_input("a.jsonl", &texts(2));
        let settings = fixture.settings(GenerationBatchSize::Flat(4));

        orchestrator(settings, fixture.queue(), predictor_pool(|| DummyPredictor))
            .with_serializer(ids_only)
            .run();

        assert_eq!(
            fixture.read_output("a.jsonl"),
            vec![json!({"id": 0, "n": 1}), json!({"id": 1, "n": 1})]
        );
    }

    #[test]
    fn test_serializer_failure_fails_the_item() {
        fn refuses(_: &Instance, _: &[CompletionOutput], _: Option<CompletionError>) -> Result<Instance> {
            Err(BatchGenError::internal("record not representable"))
        }

        let fixture = Fixture::new();
        fixture.write_input("a.jsonl", &texts(3));
        let settings = fixture.settings(GenerationBatchSize::Flat(4));
        let queue = fixture.queue();

        let summary = orchestrator(settings, queue.clone(), predictor_pool(|| DummyPredictor))
            .with_serializer(refuses)
            .run();

        assert_eq!(summary, RunSummary { processed: 1, reason: TerminationReason::QueueExhausted });
        assert!(!fixture.output.path().join("a.jsonl").exists());
        assert_eq!(queue.acknowledged(), 0);
    }
}
