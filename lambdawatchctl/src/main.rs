//! # lambdawatchctl
//!
//! Operator entry point for lambdawatch. Watches a beamline directory for
//! multi-module Lambda acquisitions and runs the configured processor once
//! per complete dataset.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lambdawatch_config::{ConfigLoader, ConfigSource};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod processor;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "lambdawatchctl", version)]
#[command(about = "Detect complete multi-module detector datasets and process each exactly once")]
struct Cli {
    /// Configuration file (TOML or JSON). Overrides $LAMBDAWATCH_CONFIG_PATH.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Environment file loaded before the configuration is resolved
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch a directory and process datasets as they complete (until Ctrl-C)
    Watch {
        /// Directory to watch; defaults to `watch_dir` from the configuration
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Process the complete datasets among FILES, then exit
    Batch {
        /// Part files to group into datasets
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List complete and incomplete datasets under DIR without processing them
    Scan {
        dir: PathBuf,

        /// Print one JSON object per dataset
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config.clone() {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = cli.env_file.clone() {
        loader = loader.with_env_file(path);
    }
    let load = loader.load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG, e.g. lambdawatch::intake=debug.
                "info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if load.env_file_loaded {
        info!("loaded .env file");
    }
    match &load.source {
        ConfigSource::Default => info!("using built-in configuration defaults"),
        ConfigSource::Explicit(path) | ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "configuration loaded")
        }
        ConfigSource::EnvInline => info!("configuration loaded from $LAMBDAWATCH_CONFIG_JSON"),
    }

    let config = load.config;
    match cli.command {
        Command::Watch { dir } => {
            let dir = dir
                .or_else(|| config.watch_dir.clone())
                .context("no directory to watch: pass --dir or set watch_dir")?;
            commands::watch::run(config, dir).await
        }
        Command::Batch { files } => commands::batch::run(config, files).await,
        Command::Scan { dir, json } => commands::scan::run(config, dir, json).await,
    }
}
