//! TextCodec capability
//!
//! The codec turns raw rows into model-ready token sequences and turns
//! generated token ids back into text. Both directions are CPU-bound and run on
//! the codec pool, away from the predictors.
//!
//! Prompt rendering goes through a Jinja chat template (`minijinja`), token
//! handling through a [`TokenBackend`] (a `tokenizers::Tokenizer` in
//! production). Vision pipelines also decode the base64 images embedded in
//! chat messages.

use crate::messages::{ChatMessage, CompletedItem, PreparedInputItem, RawInputItem};
use crate::pool::ActorPool;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use batchgen_common::config::{FormatConfig, ModelConfig};
use batchgen_common::{BatchGenError, Result};
use image::DynamicImage;
use minijinja::{context, Environment};
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tokenizers::{PaddingParams, Tokenizer};
use tracing::{debug, info};

/// Tokenize rows and detokenize completions
pub trait TextCodec {
    /// Render, tokenize and (for vision pipelines) load the images of every row
    fn prepare(&mut self, batch: &[RawInputItem]) -> Result<Vec<PreparedInputItem>>;

    /// Fill in the text of every completion output
    fn decode(&mut self, batch: &[CompletedItem]) -> Result<Vec<CompletedItem>>;
}

/// Pool of codec workers
pub type CodecPool = ActorPool<Box<dyn TextCodec>>;

/// Token ids and attention mask of one padded sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedText {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl EncodedText {
    /// Ids at attended positions only, i.e. with padding removed
    pub fn attended_ids(&self) -> Vec<u32> {
        self.ids
            .iter()
            .zip(&self.attention_mask)
            .filter(|(_, keep)| **keep != 0)
            .map(|(&id, _)| id)
            .collect()
    }
}

/// Batched tokenizer operations the codec relies on
pub trait TokenBackend {
    /// Encode without adding special tokens; sequences may be padded
    fn encode_batch(&self, texts: Vec<String>) -> Result<Vec<EncodedText>>;

    /// Decode, skipping special tokens
    fn decode_batch(&self, sequences: &[&[u32]]) -> Result<Vec<String>>;
}

impl TokenBackend for Tokenizer {
    fn encode_batch(&self, texts: Vec<String>) -> Result<Vec<EncodedText>> {
        let encodings = (**self)
            .encode_batch(texts, false)
            .map_err(|e| BatchGenError::tokenizer(format!("Failed to encode batch: {}", e)))?;

        Ok(encodings
            .into_iter()
            .map(|encoding| EncodedText {
                ids: encoding.get_ids().to_vec(),
                attention_mask: encoding.get_attention_mask().to_vec(),
            })
            .collect())
    }

    fn decode_batch(&self, sequences: &[&[u32]]) -> Result<Vec<String>> {
        (**self)
            .decode_batch(sequences, true)
            .map_err(|e| BatchGenError::tokenizer(format!("Failed to decode batch: {}", e)))
    }
}

/// ChatML, used when neither the config nor the tokenizer ships a template
pub const DEFAULT_CHAT_TEMPLATE: &str = concat!(
    "{% for message in messages %}",
    "{{ '<|im_start|>' ~ message['role'] ~ '\\n' }}",
    "{% if message['content'] is string %}{{ message['content'] }}",
    "{% else %}{% for part in message['content'] %}",
    "{% if part['type'] == 'text' %}{{ part['text'] }}{% endif %}",
    "{% endfor %}{% endif %}",
    "{{ '<|im_end|>' ~ '\\n' }}",
    "{% endfor %}",
    "{% if add_generation_prompt %}",
    "{{ generation_prompt if generation_prompt else '<|im_start|>assistant\\n' }}",
    "{% endif %}",
);

const TEMPLATE_NAME: &str = "chat";

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfigFile {
    #[serde(default)]
    chat_template: Option<ChatTemplateField>,
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    #[serde(default)]
    eos_token: Option<SpecialToken>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatTemplateField {
    Single(String),
    Named(Vec<NamedTemplate>),
}

#[derive(Debug, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Text(String),
    Added { content: String },
}

impl SpecialToken {
    fn into_content(self) -> String {
        match self {
            SpecialToken::Text(content) | SpecialToken::Added { content } => content,
        }
    }
}

impl TokenizerConfigFile {
    fn load(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join("tokenizer_config.json");
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn chat_template(&mut self) -> Option<String> {
        match self.chat_template.take()? {
            ChatTemplateField::Single(template) => Some(template),
            ChatTemplateField::Named(templates) => {
                let mut templates = templates.into_iter().peekable();
                let first = templates.peek().map(|t| t.template.clone());
                templates
                    .find(|t| t.name == "default")
                    .map(|t| t.template)
                    .or(first)
            }
        }
    }
}

fn raise_exception(message: String) -> std::result::Result<String, minijinja::Error> {
    Err(minijinja::Error::new(
        minijinja::ErrorKind::InvalidOperation,
        message,
    ))
}

/// Renders chat turns into prompt strings
pub struct ChatFormatter {
    env: Environment<'static>,
    format: FormatConfig,
    bos_token: String,
    eos_token: String,
}

impl ChatFormatter {
    pub fn new(
        format: FormatConfig,
        template: impl Into<String>,
        bos_token: Option<String>,
        eos_token: Option<String>,
    ) -> Result<Self> {
        let mut env = Environment::new();
        env.add_function("raise_exception", raise_exception);
        env.add_template_owned(TEMPLATE_NAME, template.into())
            .map_err(|e| BatchGenError::template(format!("Invalid chat template: {}", e)))?;

        Ok(Self {
            env,
            format,
            bos_token: bos_token.unwrap_or_default(),
            eos_token: eos_token.unwrap_or_default(),
        })
    }

    /// Template from `format`, else from the model's `tokenizer_config.json`, else ChatML
    pub fn from_model_dir(format: &FormatConfig, model_dir: &Path) -> Result<Self> {
        let mut tokenizer_config = TokenizerConfigFile::load(model_dir)?;

        let template = match (&format.chat_template, tokenizer_config.chat_template()) {
            (Some(configured), _) => configured.clone(),
            (None, Some(shipped)) => shipped,
            (None, None) => {
                info!("No chat template configured or shipped with the tokenizer, using ChatML");
                DEFAULT_CHAT_TEMPLATE.to_string()
            }
        };

        Self::new(
            format.clone(),
            template,
            tokenizer_config.bos_token.map(SpecialToken::into_content),
            tokenizer_config.eos_token.map(SpecialToken::into_content),
        )
    }

    fn turns(&self, messages: &[ChatMessage]) -> Result<Vec<Value>> {
        let mut turns = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = &self.format.system_message {
            turns.push(json!({"role": "system", "content": system}));
        }

        let last = messages.len().saturating_sub(1);
        for (position, message) in messages.iter().enumerate() {
            match &self.format.instruction_prefix {
                Some(prefix) if position == last => {
                    let mut prefixed = message.clone();
                    prefixed.set_text(format!("{}{}", prefix, message.text()));
                    turns.push(prefixed.to_value()?);
                }
                _ => turns.push(message.to_value()?),
            }
        }
        Ok(turns)
    }

    /// Render one conversation into a prompt string
    pub fn format(&self, messages: &[ChatMessage]) -> Result<String> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| BatchGenError::template(e.to_string()))?;

        let add_generation_prompt = self.format.add_generation_prompt;
        let generation_prompt = self
            .format
            .generation_prompt
            .as_deref()
            .filter(|_| add_generation_prompt);

        let turns = self.turns(messages)?;
        let rendered = template
            .render(context! {
                messages => turns,
                add_generation_prompt => add_generation_prompt,
                generation_prompt => generation_prompt,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token,
            })
            .map_err(|e| BatchGenError::template(format!("Failed to render chat template: {}", e)))?;

        Ok(rendered.replace('\n', &self.format.new_line_symbol))
    }
}

/// Decode a `<mime>;base64,<payload>` data URI into an image
pub fn decode_data_uri(uri: &str) -> Result<DynamicImage> {
    let (_, data) = uri
        .split_once(';')
        .ok_or_else(|| BatchGenError::malformed_image("expected `<mime>;base64,<payload>`"))?;
    let payload = data
        .strip_prefix("base64,")
        .ok_or_else(|| BatchGenError::malformed_image("payload is not base64 encoded"))?;

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| BatchGenError::malformed_image(format!("invalid base64: {}", e)))?;
    image::load_from_memory(&bytes)
        .map_err(|e| BatchGenError::malformed_image(format!("undecodable image: {}", e)))
}

fn load_images(item: &RawInputItem) -> Result<Option<Vec<DynamicImage>>> {
    let images = item
        .messages
        .iter()
        .flat_map(ChatMessage::image_urls)
        .map(decode_data_uri)
        .collect::<Result<Vec<_>>>()?;
    Ok((!images.is_empty()).then_some(images))
}

/// [`TextCodec`] backed by a tokenizer and a chat template
pub struct TokenizerCodec<B = Tokenizer> {
    backend: B,
    formatter: ChatFormatter,
    vlm: bool,
}

impl TokenizerCodec<Tokenizer> {
    /// Load `tokenizer.json` (and `tokenizer_config.json`) from the model directory
    pub fn load(model: &ModelConfig, format: &FormatConfig) -> Result<Self> {
        let model_dir = model.name_or_path.as_path();
        let tokenizer_path = model_dir.join("tokenizer.json");
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            BatchGenError::tokenizer(format!("Failed to load {}: {}", tokenizer_path.display(), e))
        })?;

        let formatter = ChatFormatter::from_model_dir(format, model_dir)?;

        if tokenizer.get_padding().is_none() {
            // Pad with EOS when the tokenizer defines no padding
            let padding = tokenizer
                .token_to_id(&formatter.eos_token)
                .map(|pad_id| PaddingParams {
                    pad_id,
                    pad_token: formatter.eos_token.clone(),
                    ..PaddingParams::default()
                })
                .unwrap_or_default();
            tokenizer.with_padding(Some(padding));
        }

        debug!(path = %tokenizer_path.display(), vlm = model.vlm, "Tokenizer loaded");
        Ok(Self::new(tokenizer, formatter, model.vlm))
    }
}

impl<B: TokenBackend> TokenizerCodec<B> {
    pub fn new(backend: B, formatter: ChatFormatter, vlm: bool) -> Self {
        Self {
            backend,
            formatter,
            vlm,
        }
    }
}

impl<B: TokenBackend> TextCodec for TokenizerCodec<B> {
    fn prepare(&mut self, batch: &[RawInputItem]) -> Result<Vec<PreparedInputItem>> {
        let prompts = batch
            .iter()
            .map(|item| self.formatter.format(&item.messages))
            .collect::<Result<Vec<_>>>()?;

        let encodings = self.backend.encode_batch(prompts)?;
        if encodings.len() != batch.len() {
            return Err(BatchGenError::tokenizer(format!(
                "Tokenizer returned {} encodings for {} prompts",
                encodings.len(),
                batch.len()
            )));
        }

        let images = if self.vlm {
            batch.par_iter().map(load_images).collect::<Result<Vec<_>>>()?
        } else {
            vec![None; batch.len()]
        };

        Ok(batch
            .iter()
            .zip(encodings)
            .zip(images)
            .map(|((item, encoding), image_data)| PreparedInputItem {
                index: item.index,
                token_ids: encoding.attended_ids(),
                image_data,
            })
            .collect())
    }

    fn decode(&mut self, batch: &[CompletedItem]) -> Result<Vec<CompletedItem>> {
        let texts = {
            let sequences: Vec<&[u32]> = batch
                .iter()
                .flat_map(|item| &item.outputs)
                .map(|output| output.token_ids.as_slice())
                .collect();
            self.backend.decode_batch(&sequences)?
        };

        let mut decoded = batch.to_vec();
        let outputs = decoded.iter_mut().flat_map(|item| item.outputs.iter_mut());
        for (output, text) in outputs.zip(texts) {
            output.text = text;
        }
        Ok(decoded)
    }
}
