//! Configuration structures for batchgen
//!
//! This module defines the settings consumed by the runner, the orchestrators
//! and the codec/predictor workers. Settings are loaded from a YAML file and can
//! be overridden by `BATCHGEN__SECTION__FIELD` environment variables.

use crate::error::{BatchGenError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `BATCHGEN__PIPELINE__NUM_WORKERS=4`
pub const ENV_PREFIX: &str = "BATCHGEN";

/// Row cap applied to every message in dummy mode
pub const DUMMY_MODE_ROW_CAP: usize = 100;

/// Top-level configuration for a batch generation run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Model loading configuration
    #[serde(default)]
    pub model: ModelConfig,

    /// Prompt formatting configuration
    #[serde(default)]
    pub format: FormatConfig,

    /// Generation configuration
    #[serde(default)]
    pub generate: GenerateConfig,

    /// Pipeline sizing and I/O locations
    pub pipeline: PipelineConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Run without an accelerator: rows are capped and nothing is written
    #[serde(default)]
    pub dummy_mode: bool,
}

/// Model loading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Directory holding `tokenizer.json` (and optionally `tokenizer_config.json`)
    #[serde(default = "default_name_or_path")]
    pub name_or_path: PathBuf,

    /// Precision handed to the generation engine
    #[serde(default = "default_dtype")]
    pub dtype: String,

    /// Whether to trust code packaged with model files
    #[serde(default)]
    pub trust_remote_code: bool,

    /// Whether this is a vision-language model
    #[serde(default)]
    pub vlm: bool,

    /// How many GPUs one predictor spans; exclusive with `predictors_per_gpu`
    pub tensor_parallel_size: Option<usize>,

    /// Optional override of the model's context length
    pub max_model_len: Option<usize>,

    /// Fraction of device memory the engine may claim
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f32,
}

/// Prompt formatting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatConfig {
    /// Replacement for `\n` in rendered prompts
    #[serde(default = "default_new_line_symbol")]
    pub new_line_symbol: String,

    /// System message prepended to every conversation
    pub system_message: Option<String>,

    /// Prefix prepended to the last message's text, no whitespace inserted
    pub instruction_prefix: Option<String>,

    /// Custom generation prompt; the template must read `generation_prompt`
    pub generation_prompt: Option<String>,

    /// Whether the template should append the assistant turn header
    #[serde(default = "default_true")]
    pub add_generation_prompt: bool,

    /// Jinja chat template; falls back to the tokenizer's own template
    pub chat_template: Option<String>,
}

/// Generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateConfig {
    /// Generation cap; defaults to the longest prompt in the batch
    pub max_tokens: Option<usize>,

    /// Longest prompt (template tokens included) we attempt to generate for
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_k")]
    pub top_k: i32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Discard rows longer than `max_context_length` instead of emitting an error record
    #[serde(default)]
    pub drop_long_contexts: bool,

    /// Discard completions that did not finish on a stop condition
    #[serde(default)]
    pub drop_long_outputs: bool,

    /// JSON schema for guided decoding
    pub guided_decoding_json_schema: Option<serde_json::Value>,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Local directory of `.jsonl` files to process
    pub input_file_dir: PathBuf,

    /// Local directory to write output files to
    pub output_file_dir: PathBuf,

    /// Multiple model copies per GPU; exclusive with `tensor_parallel_size`
    pub predictors_per_gpu: Option<usize>,

    /// How many times a crashed predictor is replaced before it is given up on
    #[serde(default)]
    pub allowed_restarts_per_predictor: u32,

    /// Number of orchestrators, i.e. messages worked on concurrently
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Orchestrators stop after handling this many messages
    pub max_num_messages_per_worker: Option<usize>,

    /// Debugging aid: clip every message to this many rows
    pub max_instances_per_message: Option<usize>,

    /// Number of codec workers
    #[serde(default = "default_num_tokenizers")]
    pub num_tokenizers: usize,

    /// GPUs available to predictors
    #[serde(default)]
    pub num_gpus: usize,

    /// Rows per tokenization task
    #[serde(default = "default_codec_batch_size")]
    pub tokenization_batch_size: usize,

    /// Prompts per generation call, flat or bracketed by length
    pub generation_batch_size: GenerationBatchSize,

    /// Completed rows per detokenization task
    #[serde(default = "default_codec_batch_size")]
    pub decoding_batch_size: usize,
}

/// Generation batch size policy
///
/// Either a flat size (`256`) or an ascending table of
/// `[max_tokens, batch_size]` pairs (`[[512, 64], [2048, 16]]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationBatchSize {
    Flat(usize),
    Bracketed(Vec<Bracket>),
}

/// One row of the bracket table: sequences up to `max_tokens` go in batches of `batch_size`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(usize, usize)", into = "(usize, usize)")]
pub struct Bracket {
    pub max_tokens: usize,
    pub batch_size: usize,
}

impl From<(usize, usize)> for Bracket {
    fn from((max_tokens, batch_size): (usize, usize)) -> Self {
        Bracket { max_tokens, batch_size }
    }
}

impl From<Bracket> for (usize, usize) {
    fn from(bracket: Bracket) -> Self {
        (bracket.max_tokens, bracket.batch_size)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,

    /// Where to write the Prometheus exposition at shutdown
    pub metrics_path: Option<PathBuf>,
}

/// Default value functions
fn default_name_or_path() -> PathBuf {
    PathBuf::from("/artifacts")
}

fn default_dtype() -> String {
    "bfloat16".to_string()
}

fn default_gpu_memory_utilization() -> f32 {
    0.9
}

fn default_new_line_symbol() -> String {
    "\n".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_context_length() -> usize {
    4096
}

fn default_temperature() -> f32 {
    0.2
}

fn default_top_k() -> i32 {
    50
}

fn default_top_p() -> f32 {
    1.0
}

fn default_repetition_penalty() -> f32 {
    1.0
}

fn default_num_workers() -> usize {
    1
}

fn default_num_tokenizers() -> usize {
    4
}

fn default_codec_batch_size() -> usize {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name_or_path: default_name_or_path(),
            dtype: default_dtype(),
            trust_remote_code: false,
            vlm: false,
            tensor_parallel_size: None,
            max_model_len: None,
            gpu_memory_utilization: default_gpu_memory_utilization(),
        }
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            new_line_symbol: default_new_line_symbol(),
            system_message: None,
            instruction_prefix: None,
            generation_prompt: None,
            add_generation_prompt: true,
            chat_template: None,
        }
    }
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            max_context_length: default_max_context_length(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            drop_long_contexts: false,
            drop_long_outputs: false,
            guided_decoding_json_schema: None,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            repetition_penalty: default_repetition_penalty(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
            metrics_path: None,
        }
    }
}

impl PipelineConfig {
    /// Minimal pipeline configuration with defaults for everything optional
    pub fn new(
        input_file_dir: impl Into<PathBuf>,
        output_file_dir: impl Into<PathBuf>,
        generation_batch_size: GenerationBatchSize,
    ) -> Self {
        Self {
            input_file_dir: input_file_dir.into(),
            output_file_dir: output_file_dir.into(),
            predictors_per_gpu: None,
            allowed_restarts_per_predictor: 0,
            num_workers: default_num_workers(),
            max_num_messages_per_worker: None,
            max_instances_per_message: None,
            num_tokenizers: default_num_tokenizers(),
            num_gpus: 0,
            tokenization_batch_size: default_codec_batch_size(),
            generation_batch_size,
            decoding_batch_size: default_codec_batch_size(),
        }
    }

    /// Task retries granted after a predictor crash
    ///
    /// Unlimited whenever restarts are allowed (each retry still consumes a
    /// restart), none otherwise.
    pub fn max_task_retries(&self) -> u32 {
        if self.allowed_restarts_per_predictor > 0 {
            u32::MAX
        } else {
            0
        }
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("num_workers", self.num_workers),
            ("num_tokenizers", self.num_tokenizers),
            ("tokenization_batch_size", self.tokenization_batch_size),
            ("decoding_batch_size", self.decoding_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BatchGenError::config(format!("{} must be at least 1", name)));
            }
        }

        if self.predictors_per_gpu == Some(0) {
            return Err(BatchGenError::config("predictors_per_gpu must be at least 1"));
        }

        self.generation_batch_size.validate()
    }
}

impl GenerationBatchSize {
    /// Validate the batch size policy
    pub fn validate(&self) -> Result<()> {
        match self {
            GenerationBatchSize::Flat(0) => Err(BatchGenError::config(
                "generation_batch_size must be at least 1",
            )),
            GenerationBatchSize::Flat(_) => Ok(()),
            GenerationBatchSize::Bracketed(brackets) => {
                if brackets.is_empty() {
                    return Err(BatchGenError::config(
                        "generation_batch_size bracket table is empty",
                    ));
                }
                if brackets.iter().any(|b| b.batch_size == 0) {
                    return Err(BatchGenError::config(
                        "generation_batch_size brackets need a batch size of at least 1",
                    ));
                }
                if brackets.windows(2).any(|w| w[0].max_tokens >= w[1].max_tokens) {
                    return Err(BatchGenError::config(
                        "generation_batch_size brackets must have strictly ascending max_tokens",
                    ));
                }
                Ok(())
            }
        }
    }
}

impl GenerateConfig {
    fn validate(&self) -> Result<()> {
        if self.max_context_length == 0 {
            return Err(BatchGenError::config("max_context_length must be at least 1"));
        }
        if let Some(schema) = &self.guided_decoding_json_schema {
            if !schema.is_object() {
                return Err(BatchGenError::config(
                    "guided_decoding_json_schema must be a JSON object",
                ));
            }
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from a YAML file layered with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load settings from a YAML file, reading overrides from `env` instead
    /// of the process environment when given
    pub fn load_with_env<P: AsRef<Path>>(
        path: P,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(|e| {
                BatchGenError::config(format!("Failed to read config file {}: {}", path.display(), e))
            })?
            .try_deserialize()
            .map_err(|e| {
                BatchGenError::config(format!("Failed to parse config file {}: {}", path.display(), e))
            })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.generate.validate()?;

        if self.model.tensor_parallel_size.is_some() && self.pipeline.predictors_per_gpu.is_some() {
            return Err(BatchGenError::config(
                "Cannot set both model.tensor_parallel_size and pipeline.predictors_per_gpu",
            ));
        }

        if let Some(tp) = self.model.tensor_parallel_size {
            if tp == 0 {
                return Err(BatchGenError::config("tensor_parallel_size must be at least 1"));
            }
            if self.pipeline.num_gpus == 0 {
                return Err(BatchGenError::config("Can't have tensor parallelism without gpus"));
            }
            if self.pipeline.num_gpus % tp != 0 {
                return Err(BatchGenError::config(
                    "num_gpus must be divisible by tensor_parallel_size",
                ));
            }
        }

        if !self.dummy_mode {
            if self.pipeline.num_gpus == 0 {
                return Err(BatchGenError::config(
                    "pipeline.num_gpus must be greater than 0 when not running in dummy_mode",
                ));
            }
            if self.num_predictors() == 0 {
                return Err(BatchGenError::config(
                    "No predictors, make sure num_gpus is set correctly",
                ));
            }
        }

        Ok(())
    }

    /// Number of predictor workers to run
    pub fn num_predictors(&self) -> usize {
        let gpus = self.pipeline.num_gpus;

        if self.dummy_mode && gpus == 0 {
            return 1;
        }

        if let Some(tp) = self.model.tensor_parallel_size {
            return gpus / tp.max(1);
        }

        if let Some(per_gpu) = self.pipeline.predictors_per_gpu {
            return gpus * per_gpu;
        }

        gpus
    }

    /// Share of a GPU (or number of GPUs) each predictor owns
    pub fn gpus_per_predictor(&self) -> f64 {
        if self.pipeline.num_gpus == 0 {
            return 0.0;
        }

        if let Some(tp) = self.model.tensor_parallel_size {
            return tp as f64;
        }

        if let Some(per_gpu) = self.pipeline.predictors_per_gpu {
            return 1.0 / per_gpu as f64;
        }

        1.0
    }

    /// Row cap for a single message, combining dummy mode and the configured cap
    pub fn row_cap(&self) -> Option<usize> {
        let dummy_cap = self.dummy_mode.then_some(DUMMY_MODE_ROW_CAP);
        match (dummy_cap, self.pipeline.max_instances_per_message) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
