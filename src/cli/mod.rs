//! Command-line interface for stagetrack.
//!
//! Provides commands for listing a stage's compiled steps, monitoring
//! stage execution from the event bus, and showing the configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::adapters::{CommandFeed, ReplayFeed, SaltRenderer};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    CompileOptions, EventDemux, LoggingListener, Monitor, NoiseFilter, RenderCache,
    StageCompiler,
};
use crate::domain::{RawEvent, StageProgress};

pub mod printer;

pub use printer::{print_steps, ProgressPrinter};

/// Capacity of the channel between the bus feed and the monitor loop
const EVENT_BUFFER: usize = 256;

/// stagetrack - progress tracker for orchestration stages
#[derive(Parser, Debug)]
#[command(name = "stagetrack")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level filter (e.g. "debug", "stagetrack=trace"), or "silent"
    #[arg(long, global = true, env = "STAGETRACK_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Write logs to this file instead of the configured one
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Log to stderr instead of a file
    #[arg(long, global = true)]
    pub log_stderr: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a stage and print its steps
    Steps {
        /// Stage name (e.g. ceph.stage.3)
        stage: String,

        /// Do not render per-node state files
        #[arg(long)]
        hide_state_steps: bool,

        /// Only list sub-steps that fire events
        #[arg(long)]
        only_visible_steps: bool,

        /// Print the compiled stage as JSON
        #[arg(long)]
        json: bool,
    },

    /// Track stage execution from the event bus
    Monitor {
        /// Compile this stage before its orchestration starts
        #[arg(short, long)]
        stage: Option<String>,

        /// Replay events from a file instead of the bus command
        #[arg(short, long)]
        events: Option<PathBuf>,

        /// Do not track per-node state results
        #[arg(long)]
        hide_state_steps: bool,

        /// Only track sub-steps that fire events
        #[arg(long)]
        only_visible_steps: bool,

        /// Also track dispatches that match no compiled step
        #[arg(long)]
        show_dynamic_steps: bool,

        /// Exit once the first tracked stage finishes
        #[arg(long)]
        once: bool,

        /// Print the final progress snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        match self.command {
            Commands::Steps {
                stage,
                hide_state_steps,
                only_visible_steps,
                json,
            } => show_steps(&stage, hide_state_steps, only_visible_steps, json).await,
            Commands::Monitor {
                stage,
                events,
                hide_state_steps,
                only_visible_steps,
                show_dynamic_steps,
                once,
                json,
            } => {
                let options = MonitorOptions {
                    stage,
                    events,
                    hide_state_steps,
                    only_visible_steps,
                    show_dynamic_steps,
                    once,
                    json,
                };
                monitor(options).await
            }
            Commands::Config => {
                show_config()?;
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

/// Merge command flags over the monitor section of the config
fn compile_options(cfg: &ResolvedConfig, hide_state_steps: bool, only_visible: bool) -> CompileOptions {
    CompileOptions {
        hide_state_steps: hide_state_steps || !cfg.monitor.show_state_steps,
        only_visible_steps: only_visible || cfg.monitor.only_visible_steps,
    }
}

fn build_compiler(cfg: &ResolvedConfig) -> StageCompiler {
    let renderer = Arc::new(SaltRenderer::new(&cfg.renderer));
    StageCompiler::new(renderer, Arc::new(RenderCache::new()))
}

/// Compile a stage and print its steps
async fn show_steps(
    stage: &str,
    hide_state_steps: bool,
    only_visible_steps: bool,
    json: bool,
) -> Result<ExitCode> {
    let cfg = config::config()?;
    let compiler = build_compiler(cfg);
    let options = compile_options(cfg, hide_state_steps, only_visible_steps);

    let compiled = match compiler.compile_stage(stage, options).await {
        Ok(compiled) => compiled,
        Err(err) => {
            eprintln!("Failed to parse stage {}:", stage);
            for message in err.messages() {
                eprintln!("  {}", message);
            }
            return Ok(ExitCode::from(2));
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&compiled.stage)?);
    } else {
        if !compiled.output.trim().is_empty() {
            println!("{}", compiled.output.trim_end());
            println!();
        }
        print_steps(&compiled.stage);
    }

    Ok(ExitCode::SUCCESS)
}

struct MonitorOptions {
    stage: Option<String>,
    events: Option<PathBuf>,
    hide_state_steps: bool,
    only_visible_steps: bool,
    show_dynamic_steps: bool,
    once: bool,
    json: bool,
}

/// Track stages until the feed ends, the stage finishes (`--once`) or
/// Ctrl-C is pressed
async fn monitor(opts: MonitorOptions) -> Result<ExitCode> {
    let cfg = config::config()?;

    let demux = EventDemux::new(&cfg.bus.tag_prefix)
        .with_context(|| format!("Invalid tag prefix: {}", cfg.bus.tag_prefix))?;
    let filter = NoiseFilter::new(&cfg.monitor.ignore_functions)
        .with_job_patterns(&cfg.monitor.ignore_job_functions);

    let mut monitor = Monitor::new(build_compiler(cfg), demux, filter)
        .with_options(compile_options(cfg, opts.hide_state_steps, opts.only_visible_steps))
        .with_orchestration_functions(cfg.monitor.orchestration_functions.clone())
        .with_dynamic_steps(opts.show_dynamic_steps || cfg.monitor.show_dynamic_steps)
        .exit_after_stage(opts.once);
    monitor.add_listener(Arc::new(LoggingListener));
    if !opts.json {
        monitor.add_listener(Arc::new(ProgressPrinter::new()));
    }

    if let Some(stage) = &opts.stage {
        if let Err(err) = monitor.prepare_stage(stage).await {
            // without --json the printer has reported it
            if opts.json {
                eprintln!("Failed to parse stage {}: {}", stage, err);
            }
            return Ok(ExitCode::from(2));
        }
    }

    let (tx, rx) = mpsc::channel::<RawEvent>(EVENT_BUFFER);
    let feed = match &opts.events {
        Some(path) => {
            let replay = ReplayFeed::new(path);
            tokio::spawn(async move { replay.forward(tx).await })
        }
        None => {
            let command = CommandFeed::from_command_line(&cfg.bus.command)
                .with_context(|| format!("Invalid bus command: {}", cfg.bus.command))?;
            tokio::spawn(async move { command.forward(tx).await })
        }
    };

    let stop = monitor.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let last = monitor.run(rx).await;

    if feed.is_finished() {
        match feed.await {
            Ok(Ok(forwarded)) => debug!(forwarded, "Event feed finished"),
            Ok(Err(err)) => warn!(error = %err, "Event feed failed"),
            Err(err) => warn!(error = %err, "Event feed task failed"),
        }
    } else {
        feed.abort();
    }

    if opts.json {
        match &last {
            Some(progress) => println!("{}", serde_json::to_string_pretty(progress.as_ref())?),
            None => println!("null"),
        }
    }

    Ok(ExitCode::from(exit_status(last.as_deref())))
}

/// Non-zero when the tracked stage did not succeed
fn exit_status(progress: Option<&StageProgress>) -> u8 {
    match progress.and_then(StageProgress::success) {
        Some(false) => 1,
        _ => 0,
    }
}

/// Show current configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("stagetrack configuration");
    println!("{}", "=".repeat(60));
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Renderer:");
    println!("  salt-call:   {}", cfg.renderer.salt_call);
    println!("  salt:        {}", cfg.renderer.salt);
    println!("  States root: {}", cfg.renderer.states_root.display());
    println!("  Timeout:     {}s", cfg.renderer.timeout_seconds);
    println!();
    println!("Bus:");
    println!("  Command:    {}", cfg.bus.command);
    println!("  Tag prefix: {}", cfg.bus.tag_prefix);
    println!();
    println!("Monitor:");
    println!("  Ignored functions:       {}", cfg.monitor.ignore_functions.join(", "));
    println!(
        "  Ignored job functions:   {}",
        cfg.monitor.ignore_job_functions.join(", ")
    );
    println!(
        "  Orchestration functions: {}",
        cfg.monitor.orchestration_functions.join(", ")
    );
    println!("  Show state steps:        {}", cfg.monitor.show_state_steps);
    println!("  Only visible steps:      {}", cfg.monitor.only_visible_steps);
    println!("  Show dynamic steps:      {}", cfg.monitor.show_dynamic_steps);
    println!();
    println!("Logging:");
    println!(
        "  File:  {}",
        cfg.logging
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(stderr)".to_string())
    );
    println!("  Level: {}", cfg.logging.level);

    Ok(())
}
