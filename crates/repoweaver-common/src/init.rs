//! Global initialization utilities for the application

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Output format for the process-wide log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Text,
    /// One JSON object per event, for log shippers
    Json,
}

/// Initialize the application environment
///
/// Loads environment variables from a `.env` file if one exists in the
/// current directory or any parent.
///
/// Safe to call multiple times - will only run once
pub fn initialize_environment() {
    INIT.call_once(|| {
        dotenvy::dotenv().ok();
    });
}

/// Install the global `tracing` subscriber
///
/// `RUST_LOG` wins when set; otherwise `default_level` (e.g. "info") applies
/// to every target. Returns `false` if a subscriber was already installed,
/// which happens when tests in one binary race to initialize logging.
pub fn initialize_tracing(default_level: &str, format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    }
}
