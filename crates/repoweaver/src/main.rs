//! Repoweaver orchestrator
//!
//! Keeps repositories from configured connections cloned, fetched and
//! indexed, and garbage collects the ones no connection references.

use clap::Parser;
use repoweaver_common::{LogFormat, initialize_environment, initialize_tracing};
use repoweaver_config::source::{ConfigurationLoader, EnvironmentSource, file_source};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Repository lifecycle orchestrator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional configuration file path (TOML or YAML); replaces environment settings
    #[arg(long, short = 'c')]
    config_file: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize environment (load .env, etc.)
    initialize_environment();
    let args = Args::parse();

    let mut loader = ConfigurationLoader::new().add_source(Box::new(EnvironmentSource));
    if let Some(path) = &args.config_file {
        loader = loader.add_source(file_source(path));
    }
    let config = loader.load()?;

    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.telemetry.tracing_level);
    let format = if config.telemetry.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    initialize_tracing(level, format);

    info!(
        service = %config.telemetry.service_name,
        data_cache_dir = %config.paths.data_cache_dir.display(),
        connections = config.connections.len(),
        "🚀 Starting repoweaver"
    );

    let services = repoweaver::initialize_services(&config).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        repoweaver::shutdown_signal().await;
        signal_token.cancel();
    });

    repoweaver::run(services, shutdown).await;
    Ok(())
}
