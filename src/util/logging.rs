//! Logging initialization and configuration.

use crate::config::LogFormat;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this twice
/// in one process is a no-op for the second call.
///
/// # Arguments
///
/// * `level` - Log level filter (e.g., "info", "debug")
/// * `format` - Log output format (json or pretty)
pub fn init_logging(level: &str, format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "logging already initialized");
    }
}
