//! Core tracking logic.
//!
//! This module contains:
//! - Demux: classifies raw bus events into typed events
//! - Filter: drops housekeeping traffic
//! - Compiler: turns stage documents into ordered steps
//! - Tracker: the per-stage state machine
//! - Monitor: the event loop tying them together

pub mod cache;
pub mod compiler;
pub mod demux;
pub mod filter;
pub mod listener;
pub mod monitor;
pub mod requisites;
pub mod tracker;

// Re-export commonly used types
pub use cache::RenderCache;
pub use compiler::{
    parse_sub_steps, resolve_include, CompileError, CompileOptions, Compiled, ReferenceProblem,
    StageCompiler,
};
pub use demux::{EventClass, EventDemux, DEFAULT_TAG_PREFIX};
pub use filter::NoiseFilter;
pub use listener::{Listeners, LoggingListener, StageListener};
pub use monitor::{default_orchestration_functions, Handled, Monitor};
pub use requisites::{should_skip, SkipDecision, SkipReason};
pub use tracker::{IgnoreReason, Outcome, StageTracker, StopHandle};
