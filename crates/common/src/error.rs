//! Common error types for batchgen
//!
//! This module defines the error taxonomy shared by the queue, the actor pools,
//! the codec and predictor capabilities, and the orchestrators.

use thiserror::Error;

/// Main error type for batchgen
#[derive(Error, Debug)]
pub enum BatchGenError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input row or message
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A data-URI image payload that is not `<mime>;base64,<payload>` or does not decode
    #[error("Malformed image payload: {0}")]
    MalformedImage(String),

    /// Tokenization or detokenization failure
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Chat template rendering failure
    #[error("Template error: {0}")]
    Template(String),

    /// The generation engine call failed
    #[error("Generation error: {0}")]
    Generation(String),

    /// A pool worker is gone and cannot be replaced
    #[error("Actor died: {0}")]
    ActorDied(String),

    /// A worker crashed while running a task and the task was not retried
    #[error("Task crashed: {0}")]
    TaskCrashed(String),

    /// The work queue could not be reached
    #[error("Queue error: {0}")]
    Queue(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_yaml::Error> for BatchGenError {
    fn from(err: serde_yaml::Error) -> Self {
        BatchGenError::Config(err.to_string())
    }
}

impl From<config::ConfigError> for BatchGenError {
    fn from(err: config::ConfigError) -> Self {
        BatchGenError::Config(err.to_string())
    }
}

impl BatchGenError {
    /// Whether the error means a pool dependency is permanently unusable.
    ///
    /// Orchestrators terminate on fatal errors instead of moving on to the
    /// next work item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BatchGenError::ActorDied(_))
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        BatchGenError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        BatchGenError::InvalidInput(msg.into())
    }

    /// Create a malformed image error
    pub fn malformed_image(msg: impl Into<String>) -> Self {
        BatchGenError::MalformedImage(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        BatchGenError::Tokenizer(msg.into())
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        BatchGenError::Template(msg.into())
    }

    /// Create a generation error
    pub fn generation(msg: impl Into<String>) -> Self {
        BatchGenError::Generation(msg.into())
    }

    /// Create an actor died error
    pub fn actor_died(msg: impl Into<String>) -> Self {
        BatchGenError::ActorDied(msg.into())
    }

    /// Create a queue error
    pub fn queue(msg: impl Into<String>) -> Self {
        BatchGenError::Queue(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        BatchGenError::Internal(msg.into())
    }
}

/// Result type alias for batchgen operations
pub type Result<T> = std::result::Result<T, BatchGenError>;
