//! Logging bootstrap
//!
//! `RUST_LOG` overrides the configured level.

use crate::config::ObservabilityConfig;
use crate::error::{BatchGenError, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if config.structured_logging {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init()
    };

    installed.map_err(|e| BatchGenError::internal(format!("Failed to initialize logging: {}", e)))
}
