//! batchgen common library
//!
//! This crate contains configuration, errors, metrics and logging shared by
//! the worker library and the coordinator binary.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::Settings;
pub use error::{BatchGenError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
