//! batchgen Coordinator
//!
//! Wires the queue, codec pool, predictor pool and orchestrators of a run
//! together and drives them to completion.

pub mod runner;

pub use runner::{CodecFactory, Pipeline, PipelineBuilder, PipelineReport, PredictorFactory};
