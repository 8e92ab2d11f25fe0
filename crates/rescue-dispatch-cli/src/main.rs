//! Rescue Dispatch CLI
//!
//! # Configuration
//!
//! Configuration is loaded from multiple sources with priority:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables (`RESCUE_*`)
//! 3. Config file given with `--config`
//! 4. Default values (lowest priority)
//!
//! # Environment Variables
//!
//! - `RESCUE_DB_PATH`: SQLite database file
//! - `RESCUE_LOG_LEVEL`: Default log filter when `RUST_LOG` is unset
//! - `RESCUE_FIELD_UNIT_SPEED_KMH`: Field unit speed for ETA estimates
//! - `RESCUE_FACILITY_SPEED_KMH`: Facility dispatch speed for ETA estimates
//! - `RESCUE_RECOVERY_INTERVAL_SECS`: Event recovery scan period

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rescue_dispatch_agents::{default_registry, default_subscriptions, LogSink};
use rescue_dispatch_core::{AppConfig, ConfigLoader, DispatchSystem};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use commands::Command;

/// Rescue Dispatch - emergency case intake and responder assignment
#[derive(Parser, Debug)]
#[command(name = "rescue-dispatch")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the database path (also: RESCUE_DB_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    fn resolve_config(&self) -> Result<AppConfig> {
        let mut loader = ConfigLoader::new();
        if let Some(ref path) = self.config {
            loader = loader.with_file(path);
        }
        let mut config = loader.load().context("Failed to load configuration")?;

        // CLI args override (highest priority)
        if let Some(ref db) = self.db {
            config.storage.path.clone_from(db);
        }
        if config.subscriptions.is_empty() {
            config.subscriptions = default_subscriptions();
        }
        Ok(config)
    }

    /// Filter: --debug > --verbose > RUST_LOG env > config level
    fn log_filter(&self, config: &AppConfig) -> EnvFilter {
        if self.debug {
            EnvFilter::new("debug,rusqlite=warn,tokio=warn")
        } else if self.verbose {
            EnvFilter::new("info")
        } else {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.resolve_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(args.log_filter(&config))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!(path = %config.storage.path.display(), "Opening dispatch store");

    let registry = default_registry(Arc::new(LogSink));
    let system = DispatchSystem::open(config, registry).context("Failed to open dispatch system")?;

    commands::run(&system, args.command).await
}
