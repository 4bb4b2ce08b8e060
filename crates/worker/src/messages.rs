//! Row-level data model
//!
//! Every type that travels through the pipeline carries the row `index`, its
//! 0-based position in the source file. The index is the only correlation key:
//! pools complete work out of order and the orchestrator re-associates results
//! with their rows by index alone.

use batchgen_common::{BatchGenError, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One parsed line of an input file
pub type Instance = Map<String, Value>;

/// One element of a structured message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// Data URI, `<mime>;base64,<payload>`
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

/// Message body: a plain string or a list of typed parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One chat turn
///
/// A structured body always holds exactly one text part; construction fails
/// otherwise, so `text()` never has to guess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedChatMessage")]
pub struct ChatMessage {
    role: String,
    content: MessageContent,
}

#[derive(Deserialize)]
struct UncheckedChatMessage {
    role: String,
    content: MessageContent,
}

impl TryFrom<UncheckedChatMessage> for ChatMessage {
    type Error = BatchGenError;

    fn try_from(raw: UncheckedChatMessage) -> Result<Self> {
        ChatMessage::new(raw.role, raw.content)
    }
}

impl ChatMessage {
    /// Create a message, enforcing the single-text-part invariant
    pub fn new(role: impl Into<String>, content: MessageContent) -> Result<Self> {
        if let MessageContent::Parts(parts) = &content {
            let text_parts = parts
                .iter()
                .filter(|part| matches!(part, ContentPart::Text { .. }))
                .count();
            if text_parts != 1 {
                return Err(BatchGenError::invalid_input(format!(
                    "A chat message must have exactly one text content member, found {}",
                    text_parts
                )));
            }
        }

        Ok(Self {
            role: role.into(),
            content,
        })
    }

    /// A single user turn
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    /// The textual part of the message
    pub fn text(&self) -> &str {
        match &self.content {
            MessageContent::Text(text) => text,
            MessageContent::Parts(parts) => parts
                .iter()
                .find_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .unwrap_or_default(),
        }
    }

    /// Replace the textual part, leaving image parts untouched
    pub fn set_text(&mut self, new_text: impl Into<String>) {
        let new_text = new_text.into();
        match &mut self.content {
            MessageContent::Text(text) => *text = new_text,
            MessageContent::Parts(parts) => {
                for part in parts.iter_mut() {
                    if let ContentPart::Text { text } = part {
                        *text = new_text;
                        return;
                    }
                }
            }
        }
    }

    /// Data URIs of the image parts, in order
    pub fn image_urls(&self) -> impl Iterator<Item = &str> {
        let parts: &[ContentPart] = match &self.content {
            MessageContent::Text(_) => &[],
            MessageContent::Parts(parts) => parts,
        };
        parts.iter().filter_map(|part| match part {
            ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
            ContentPart::Text { .. } => None,
        })
    }

    /// OpenAI-style JSON representation
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse the OpenAI-style JSON representation
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| BatchGenError::invalid_input(format!("Invalid chat message: {}", e)))
    }
}

/// One row of an input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInputItem {
    pub index: usize,
    pub messages: Vec<ChatMessage>,
}

impl RawInputItem {
    pub fn from_text(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            messages: vec![ChatMessage::from_text(text)],
        }
    }

    pub fn from_message_values(index: usize, messages: &[Value]) -> Result<Self> {
        let messages = messages
            .iter()
            .cloned()
            .map(ChatMessage::from_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { index, messages })
    }

    /// Build a row from a parsed input line
    ///
    /// A `text` field becomes a single user turn; otherwise `chat_messages`
    /// must hold an array of turns.
    pub fn from_instance(index: usize, instance: &Instance) -> Result<Self> {
        if let Some(text) = instance.get("text") {
            let text = text.as_str().ok_or_else(|| {
                BatchGenError::invalid_input(format!("Row {}: `text` must be a string", index))
            })?;
            return Ok(Self::from_text(index, text));
        }

        match instance.get("chat_messages") {
            Some(Value::Array(messages)) => Self::from_message_values(index, messages),
            Some(_) => Err(BatchGenError::invalid_input(format!(
                "Row {}: `chat_messages` must be an array",
                index
            ))),
            None => Err(BatchGenError::invalid_input(format!(
                "Row {}: expected a `text` or `chat_messages` field",
                index
            ))),
        }
    }
}

/// Tokenized row, ready for generation
#[derive(Debug, Clone)]
pub struct PreparedInputItem {
    pub index: usize,
    pub token_ids: Vec<u32>,
    /// Present only for vision pipelines and rows that carried images
    pub image_data: Option<Vec<DynamicImage>>,
}

impl PreparedInputItem {
    pub fn new(index: usize, token_ids: Vec<u32>) -> Self {
        Self {
            index,
            token_ids,
            image_data: None,
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }
}

/// Engine-specific stop marker: a stop token id or a stop string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopReason {
    Token(u32),
    Text(String),
}

/// One generated continuation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionOutput {
    pub index: usize,
    pub text: String,
    pub token_ids: Vec<u32>,
    pub finish_reason: Option<String>,
    pub stop_reason: Option<StopReason>,
}

impl CompletionOutput {
    /// Whether generation ended on a stop condition rather than a length cap
    pub fn finished_on_stop(&self) -> bool {
        self.finish_reason.as_deref() == Some(FINISH_REASON_STOP)
    }
}

/// Finish reason reported for completions that hit a stop condition
pub const FINISH_REASON_STOP: &str = "stop";

/// Why a row produced no completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionError {
    ContextTooLong,
}

impl CompletionError {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionError::ContextTooLong => "CONTEXT_TOO_LONG",
        }
    }
}

/// Generation result for one row: outputs on success, or an error with no outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedItem {
    pub index: usize,
    pub outputs: Vec<CompletionOutput>,
    pub error: Option<CompletionError>,
}

impl CompletedItem {
    pub fn success(index: usize, outputs: Vec<CompletionOutput>) -> Self {
        Self {
            index,
            outputs,
            error: None,
        }
    }

    pub fn failed(index: usize, error: CompletionError) -> Self {
        Self {
            index,
            outputs: Vec::new(),
            error: Some(error),
        }
    }
}
