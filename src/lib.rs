//! stagetrack - progress tracking for multi-node orchestration stages
//!
//! Follows the execution of a declarative orchestration stage from the
//! events its engine publishes, and derives a live progress model from
//! them. Nothing is executed here; the engine runs the operations and this
//! crate only watches.
//!
//! # Architecture
//!
//! - A stage document is compiled once into an immutable list of ordered
//!   steps with dependency links
//! - Raw bus events are classified into typed events and filtered
//! - A per-stage tracker consumes the typed events in order and moves a
//!   head-of-queue cursor through the steps
//! - Progress is published to listeners and as snapshots
//!
//! # Modules
//!
//! - `adapters`: External collaborators (renderer subprocess, event bus)
//! - `core`: Tracking logic (Demux, Compiler, Tracker, Monitor)
//! - `domain`: Data structures (events, steps, progress)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # List the steps of a stage
//! stagetrack steps ceph.stage.0
//!
//! # Follow the next run of a stage
//! stagetrack monitor --stage ceph.stage.0 --once
//!
//! # Replay a recorded event log
//! stagetrack monitor --events events.log --json
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{RenderFailure, Rendered, Renderer, SaltRenderer};
pub use core::{
    CompileError, CompileOptions, EventDemux, Monitor, NoiseFilter, Outcome, RenderCache,
    StageCompiler, StageListener, StageTracker,
};
pub use domain::{CompiledStage, RawEvent, StageProgress, Step, StepProgress, TypedEvent};
