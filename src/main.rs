//! stagetrack CLI entrypoint

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stagetrack::cli::Cli;
use stagetrack::config;

const SILENT: &str = "silent";

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Install the tracing subscriber. An explicit `--log-level` wins over
/// RUST_LOG, which wins over the configured level.
fn init_tracing(cli: &Cli) -> Result<()> {
    let cfg = config::config()?;

    let filter = match cli.log_level.as_deref() {
        Some(SILENT) => return Ok(()),
        Some(level) => EnvFilter::new(level),
        None if cfg.logging.level == SILENT => return Ok(()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level)),
    };

    let log_file = if cli.log_stderr {
        None
    } else {
        cli.log_file.clone().or_else(|| cfg.logging.file.clone())
    };

    let (file_layer, stderr_layer) = match log_file {
        Some(path) => {
            let file = open_log_file(&path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), None)
        }
        None => {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr);
            (None, Some(layer))
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse first: the subscriber depends on the global flags
    let cli = Cli::parse();
    init_tracing(&cli)?;

    cli.execute().await
}
