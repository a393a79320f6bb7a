//! Concord Daemon - governance-aware message bus service
//!
//! The daemon wires a [`MessageBus`](concord_bus::MessageBus) with:
//! - the validation pipeline named in configuration
//! - circuit breakers and the recovery worker
//! - the audit drain, writing audit events to the log
//! - periodic health and metrics reporting

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod daemon;
mod error;

use config::DaemonConfig;
use daemon::Daemon;

/// Concord Daemon CLI
#[derive(Parser)]
#[command(name = "concordd")]
#[command(about = "Concord Daemon - governance-aware agent message bus", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CONCORD_CONFIG")]
    config: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "CONCORD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "CONCORD_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = DaemonConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "Starting Concord daemon"
    );

    let daemon = Daemon::new(config).context("building message bus")?;
    daemon.run().await.context("running message bus")?;
    Ok(())
}
