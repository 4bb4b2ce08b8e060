//! Predictor capability
//!
//! A predictor turns batches of prepared rows into completed rows by calling a
//! generation engine once per batch. Around that call it enforces the context
//! length limit, the output drop policies, and containment of device faults.

use crate::messages::{
    CompletedItem, CompletionError, CompletionOutput, PreparedInputItem, StopReason,
};
use crate::pool::{self, ActorPool};
use batchgen_common::config::GenerateConfig;
use batchgen_common::{BatchGenError, LatencyTimer, Result, METRICS};
use image::DynamicImage;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

/// Device faults tolerated by one worker before it exits
pub const MAX_ALLOWED_DEVICE_FAULTS: u32 = 2;

/// Engine error text that marks an accelerator fault
const DEVICE_FAULT_MARKER: &str = "CUDA error";

/// Generate completions for a batch of prepared rows
pub trait Predictor {
    /// The result may be smaller than the batch and in any order
    fn predict(&mut self, batch: &[PreparedInputItem]) -> Result<Vec<CompletedItem>>;
}

/// Pool of predictor workers
pub type PredictorPool = ActorPool<Box<dyn Predictor>>;

/// One prompt handed to the engine
#[derive(Debug, Clone)]
pub struct TokensPrompt {
    pub prompt_token_ids: Vec<u32>,
    pub images: Option<Vec<DynamicImage>>,
}

/// Sampling parameters for one engine call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingParams {
    /// Completions per prompt
    pub n: usize,
    pub temperature: f32,
    pub top_k: i32,
    pub top_p: f32,
    pub max_tokens: usize,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub repetition_penalty: f32,
    /// JSON schema the output must conform to
    pub guided_json: Option<Value>,
    /// Whether the engine should produce text; decoding happens on the codec pool instead
    pub detokenize: bool,
}

impl SamplingParams {
    pub fn from_config(config: &GenerateConfig, max_tokens: usize) -> Self {
        Self {
            n: 1,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            max_tokens,
            presence_penalty: config.presence_penalty,
            frequency_penalty: config.frequency_penalty,
            repetition_penalty: config.repetition_penalty,
            guided_json: config.guided_decoding_json_schema.clone(),
            detokenize: false,
        }
    }
}

/// One sequence generated for a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSequence {
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<String>,
    pub stop_reason: Option<StopReason>,
}

/// Engine result for one prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutput {
    pub outputs: Vec<GeneratedSequence>,
}

/// The generation engine boundary
///
/// Implementations return one [`RequestOutput`] per prompt, in prompt order.
/// A failed call reports its cause through the error message.
pub trait Generator {
    fn generate(
        &mut self,
        prompts: Vec<TokensPrompt>,
        params: &SamplingParams,
    ) -> Result<Vec<RequestOutput>>;
}

/// [`Predictor`] driving a [`Generator`]
pub struct EnginePredictor<G> {
    engine: G,
    config: GenerateConfig,
    /// Device faults seen by this worker; never shared
    device_faults: u32,
}

impl<G: Generator> EnginePredictor<G> {
    pub fn new(engine: G, config: GenerateConfig) -> Self {
        Self {
            engine,
            config,
            device_faults: 0,
        }
    }

    pub fn device_faults(&self) -> u32 {
        self.device_faults
    }

    /// Count device faults and exit the worker once the budget is spent
    fn contain(&mut self, err: BatchGenError) -> BatchGenError {
        if !err.to_string().contains(DEVICE_FAULT_MARKER) {
            return err;
        }

        self.device_faults += 1;
        METRICS.generation.device_faults.inc();
        if self.device_faults >= MAX_ALLOWED_DEVICE_FAULTS {
            error!(
                faults = self.device_faults,
                "Device faults encountered too many times, device memory is likely unrecoverable. Terminating predictor: {}",
                err
            );
            pool::exit_worker(format!("device fault limit reached: {}", err));
        }

        warn!(
            faults = self.device_faults,
            limit = MAX_ALLOWED_DEVICE_FAULTS,
            "Device fault during generation: {}",
            err
        );
        err
    }
}

impl<G: Generator> Predictor for EnginePredictor<G> {
    fn predict(&mut self, batch: &[PreparedInputItem]) -> Result<Vec<CompletedItem>> {
        let max_context_length = self.config.max_context_length;
        let (fitting, too_long): (Vec<&PreparedInputItem>, Vec<&PreparedInputItem>) = batch
            .iter()
            .partition(|item| item.num_tokens() <= max_context_length);

        METRICS.generation.context_too_long.inc_by(too_long.len() as u64);
        let too_long_records: Vec<CompletedItem> = if self.config.drop_long_contexts {
            Vec::new()
        } else {
            too_long
                .iter()
                .map(|item| CompletedItem::failed(item.index, CompletionError::ContextTooLong))
                .collect()
        };

        if fitting.is_empty() {
            return Ok(too_long_records);
        }

        let longest = fitting.iter().map(|item| item.num_tokens()).max().unwrap_or(0);
        // A zero cap counts as unset
        let max_tokens = self.config.max_tokens.filter(|&cap| cap > 0).unwrap_or(longest);
        let params = SamplingParams::from_config(&self.config, max_tokens);

        let prompts: Vec<TokensPrompt> = fitting
            .iter()
            .map(|item| TokensPrompt {
                prompt_token_ids: item.token_ids.clone(),
                images: item.image_data.clone(),
            })
            .collect();

        METRICS.generation.batch_size.observe(prompts.len() as f64);
        METRICS.generation.batch_max_tokens.observe(longest as f64);
        debug!(
            prompts = prompts.len(),
            longest,
            max_tokens = params.max_tokens,
            "Generating"
        );

        let engine = &mut self.engine;
        let generated = METRICS
            .generation
            .generate_duration
            .time(|| engine.generate(prompts, &params));
        let outputs = match generated {
            Ok(outputs) => outputs,
            Err(err) => return Err(self.contain(err)),
        };

        if outputs.len() != fitting.len() {
            return Err(BatchGenError::generation(format!(
                "Engine returned {} outputs for {} prompts",
                outputs.len(),
                fitting.len()
            )));
        }

        let mut predictions = Vec::with_capacity(batch.len());
        for (item, output) in fitting.iter().zip(outputs) {
            let sequence = output.outputs.into_iter().next().ok_or_else(|| {
                BatchGenError::generation(format!("Engine returned no sequence for row {}", item.index))
            })?;

            let completion = CompletionOutput {
                index: 0,
                text: String::new(),
                token_ids: sequence.token_ids,
                finish_reason: sequence.finish_reason,
                stop_reason: sequence.stop_reason,
            };

            if self.config.drop_long_outputs && !completion.finished_on_stop() {
                METRICS.generation.non_stop_dropped.inc();
                continue;
            }
            predictions.push(CompletedItem::success(item.index, vec![completion]));
        }

        predictions.extend(too_long_records);
        Ok(predictions)
    }
}

/// Echoes each prompt back as its own completion
///
/// Used in dummy mode and in tests: no engine, no accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyPredictor;

impl Predictor for DummyPredictor {
    fn predict(&mut self, batch: &[PreparedInputItem]) -> Result<Vec<CompletedItem>> {
        Ok(batch
            .iter()
            .map(|item| {
                CompletedItem::success(
                    item.index,
                    vec![CompletionOutput {
                        index: 0,
                        text: String::new(),
                        token_ids: item.token_ids.clone(),
                        finish_reason: None,
                        stop_reason: None,
                    }],
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::RestartPolicy;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted engine: pops one canned reply per call, records the parameters it saw
    #[derive(Default)]
    struct ScriptedEngine {
        replies: VecDeque<Result<Vec<RequestOutput>>>,
        calls: Arc<Mutex<Vec<(usize, SamplingParams)>>>,
    }

    impl ScriptedEngine {
        fn echo() -> Self {
            Self::default()
        }

        fn failing(messages: &[&str]) -> Self {
            Self {
                replies: messages
                    .iter()
                    .map(|msg| Err(BatchGenError::generation(*msg)))
                    .collect(),
                ..Self::default()
            }
        }
    }

    impl Generator for ScriptedEngine {
        fn generate(
            &mut self,
            prompts: Vec<TokensPrompt>,
            params: &SamplingParams,
        ) -> Result<Vec<RequestOutput>> {
            self.calls.lock().unwrap().push((prompts.len(), params.clone()));
            if let Some(reply) = self.replies.pop_front() {
                return reply;
            }
            // Finish on stop unless the prompt starts with token 0
            Ok(prompts
                .into_iter()
                .map(|prompt| {
                    let finish = if prompt.prompt_token_ids.first() == Some(&0) {
                        "length"
                    } else {
                        "stop"
                    };
                    RequestOutput {
                        outputs: vec![GeneratedSequence {
                            token_ids: prompt.prompt_token_ids.iter().rev().copied().collect(),
                            finish_reason: Some(finish.to_string()),
                            stop_reason: None,
                        }],
                    }
                })
                .collect())
        }
    }

    fn config(max_context_length: usize) -> GenerateConfig {
        GenerateConfig {
            max_context_length,
            ..GenerateConfig::default()
        }
    }

    fn item(index: usize, token_ids: Vec<u32>) -> PreparedInputItem {
        PreparedInputItem::new(index, token_ids)
    }

    fn sorted_indices(items: &[CompletedItem]) -> Vec<usize> {
        let mut indices: Vec<_> = items.iter().map(|item| item.index).collect();
        indices.sort_unstable();
        indices
    }

    #[test]
    fn test_context_too_long_record_emitted() {
        let mut predictor = EnginePredictor::new(ScriptedEngine::echo(), config(3));
        let batch = vec![item(0, vec![1, 2]), item(1, vec![1, 2, 3, 4])];

        let completed = predictor.predict(&batch).unwrap();

        assert_eq!(sorted_indices(&completed), vec![0, 1]);
        let normal = completed.iter().find(|c| c.index == 0).unwrap();
        assert_eq!(normal.outputs[0].token_ids, vec![2, 1]);
        assert!(normal.error.is_none());
        let too_long = completed.iter().find(|c| c.index == 1).unwrap();
        assert!(too_long.outputs.is_empty());
        assert_eq!(too_long.error, Some(CompletionError::ContextTooLong));
    }

    #[test]
    fn test_context_too_long_record_dropped() {
        let mut cfg = config(3);
        cfg.drop_long_contexts = true;
        let mut predictor = EnginePredictor::new(ScriptedEngine::echo(), cfg);
        let batch = vec![item(0, vec![1, 2]), item(1, vec![1, 2, 3, 4])];

        let completed = predictor.predict(&batch).unwrap();

        assert_eq!(sorted_indices(&completed), vec![0]);
        assert!(completed[0].error.is_none());
    }

    #[test]
    fn test_all_too_long_skips_the_engine() {
        let engine = ScriptedEngine::echo();
        let calls = engine.calls.clone();
        let mut predictor = EnginePredictor::new(engine, config(1));

        let completed = predictor.predict(&[item(4, vec![1, 2]), item(5, vec![1, 2, 3])]).unwrap();

        assert_eq!(sorted_indices(&completed), vec![4, 5]);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_outputs_follow_the_filtered_batch() {
        let mut predictor = EnginePredictor::new(ScriptedEngine::echo(), config(2));
        let batch = vec![item(0, vec![9, 9, 9]), item(1, vec![5, 6]), item(2, vec![7])];

        let completed = predictor.predict(&batch).unwrap();

        let one = completed.iter().find(|c| c.index == 1).unwrap();
        let two = completed.iter().find(|c| c.index == 2).unwrap();
        assert_eq!(one.outputs[0].token_ids, vec![6, 5]);
        assert_eq!(two.outputs[0].token_ids, vec![7]);
    }

    #[test]
    fn test_max_tokens_defaults_to_longest_prompt() {
        let engine = ScriptedEngine::echo();
        let calls = engine.calls.clone();
        let mut predictor = EnginePredictor::new(engine, config(16));

        predictor.predict(&[item(0, vec![1; 3]), item(1, vec![1; 7])]).unwrap();

        let calls = calls.lock().unwrap();
        let (prompts, params) = &calls[0];
        assert_eq!(*prompts, 2);
        assert_eq!(params.max_tokens, 7);
        assert_eq!(params.n, 1);
        assert!(!params.detokenize);
    }

    #[test]
    fn test_configured_max_tokens_wins() {
        let engine = ScriptedEngine::echo();
        let calls = engine.calls.clone();
        let mut cfg = config(16);
        cfg.max_tokens = Some(64);
        cfg.guided_decoding_json_schema = Some(serde_json::json!({"type": "object"}));
        let mut predictor = EnginePredictor::new(engine, cfg);

        predictor.predict(&[item(0, vec![1; 3])]).unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].1.max_tokens, 64);
        assert_eq!(calls[0].1.guided_json, Some(serde_json::json!({"type": "object"})));
    }

    #[test]
    fn test_zero_max_tokens_falls_back_to_longest_prompt() {
        let engine = ScriptedEngine::echo();
        let calls = engine.calls.clone();
        let mut cfg = config(16);
        cfg.max_tokens = Some(0);
        let mut predictor = EnginePredictor::new(engine, cfg);

        predictor.predict(&[item(0, vec![1; 7])]).unwrap();

        assert_eq!(calls.lock().unwrap()[0].1.max_tokens, 7);
    }

    #[test]
    fn test_non_stop_completions_dropped_when_configured() {
        let batch = vec![item(0, vec![0, 1]), item(1, vec![1, 1])];

        let mut keeping = EnginePredictor::new(ScriptedEngine::echo(), config(16));
        assert_eq!(sorted_indices(&keeping.predict(&batch).unwrap()), vec![0, 1]);

        let mut cfg = config(16);
        cfg.drop_long_outputs = true;
        let mut dropping = EnginePredictor::new(ScriptedEngine::echo(), cfg);
        assert_eq!(sorted_indices(&dropping.predict(&batch).unwrap()), vec![1]);
    }

    #[test]
    fn test_other_engine_errors_propagate() {
        let engine = ScriptedEngine::failing(&["out of cheese", "out of cheese", "out of cheese"]);
        let mut predictor = EnginePredictor::new(engine, config(16));

        for _ in 0..3 {
            let err = predictor.predict(&[item(0, vec![1])]).unwrap_err();
            assert!(matches!(err, BatchGenError::Generation(_)));
        }
        assert_eq!(predictor.device_faults(), 0);
    }

    #[test]
    fn test_first_device_fault_is_returned() {
        let engine = ScriptedEngine::failing(&["CUDA error: an illegal memory access was encountered"]);
        let mut predictor = EnginePredictor::new(engine, config(16));

        let err = predictor.predict(&[item(0, vec![1])]).unwrap_err();

        assert!(err.to_string().contains("CUDA error"));
        assert_eq!(predictor.device_faults(), 1);
        assert!(predictor.predict(&[item(0, vec![1])]).is_ok());
    }

    #[test]
    fn test_second_device_fault_terminates_the_worker() {
        let built = Arc::new(Mutex::new(0usize));
        let factory_built = built.clone();
        let pool: PredictorPool = ActorPool::spawn("predictor", 1, RestartPolicy::NEVER, move |_| {
            *factory_built.lock().unwrap() += 1;
            let engine = ScriptedEngine::failing(&["CUDA error: first", "CUDA error: second"]);
            Ok(Box::new(EnginePredictor::new(engine, config(16))) as Box<dyn Predictor>)
        })
        .unwrap();

        let predict = |predictor: &mut Box<dyn Predictor>, batch: &Vec<PreparedInputItem>| {
            predictor.predict(batch)
        };

        let first: Vec<_> = pool.map_unordered(predict, vec![vec![item(0, vec![1])]]).collect();
        assert!(matches!(first[0], Err(BatchGenError::Generation(_))));
        assert_eq!(pool.live_workers(), 1);

        let second: Vec<_> = pool.map_unordered(predict, vec![vec![item(0, vec![1])]]).collect();
        match &second[0] {
            Err(BatchGenError::ActorDied(msg)) => assert!(msg.contains("device fault limit")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(*built.lock().unwrap(), 1);
    }

    #[test]
    fn test_device_fault_exit_restarts_with_fresh_counter() {
        let pool: PredictorPool = ActorPool::spawn("predictor", 1, RestartPolicy::new(1, u32::MAX), |_| {
            let engine = ScriptedEngine::failing(&["CUDA error: first", "CUDA error: second"]);
            Ok(Box::new(EnginePredictor::new(engine, config(16))) as Box<dyn Predictor>)
        })
        .unwrap();
        let predict = |predictor: &mut Box<dyn Predictor>, batch: &Vec<PreparedInputItem>| {
            predictor.predict(batch)
        };

        let first: Vec<_> = pool.map_unordered(predict, vec![vec![item(0, vec![1])]]).collect();
        assert!(first[0].is_err());

        // Second fault exits the worker; the retry runs on a fresh instance, which faults once
        let second: Vec<_> = pool.map_unordered(predict, vec![vec![item(0, vec![1])]]).collect();
        assert!(matches!(second[0], Err(BatchGenError::Generation(_))));
        assert_eq!(pool.live_workers(), 1);
    }

    #[test]
    fn test_dummy_predictor_echoes_prompts() {
        let completed = DummyPredictor
            .predict(&[item(3, vec![4, 5]), item(8, vec![6])])
            .unwrap();

        assert_eq!(completed.len(), 2);
        assert_eq!(completed[0].index, 3);
        assert_eq!(completed[0].outputs[0].token_ids, vec![4, 5]);
        assert_eq!(completed[0].outputs[0].finish_reason, None);
        assert_eq!(completed[1].outputs[0].token_ids, vec![6]);
    }
}
