//! Batchgen Worker
//!
//! Core of the batch generation pipeline: work items are pulled from a queue,
//! tokenized on a pool of codec workers, packed into length-aware batches,
//! generated on a pool of predictor workers, decoded, and written back out
//! with every row in its original position.

pub mod batching;
pub mod codec;
pub mod io;
pub mod messages;
pub mod orchestrator;
pub mod pool;
pub mod predictor;
pub mod queue;
pub mod serializer;

pub use codec::{ChatFormatter, CodecPool, TextCodec, TokenizerCodec};
pub use messages::{
    ChatMessage, CompletedItem, CompletionError, CompletionOutput, Instance, PreparedInputItem,
    RawInputItem,
};
pub use orchestrator::{Orchestrator, OrchestratorState, RunSummary, TerminationReason};
pub use pool::{ActorPool, RestartPolicy};
pub use predictor::{DummyPredictor, EnginePredictor, Generator, Predictor, PredictorPool};
pub use queue::{InMemoryQueue, WorkItem, WorkQueue};
