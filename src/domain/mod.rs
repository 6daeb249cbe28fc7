//! Domain types for stage tracking.
//!
//! This module contains the core data structures:
//! - Events: raw bus messages and the typed events decoded from them
//! - Step: the compiled, immutable stage structure
//! - Stage: live progress derived from the event feed

pub mod events;
pub mod stage;
pub mod step;

// Re-export commonly used types
pub use events::{
    JobCompleted, JobDispatched, RawEvent, RunnerCompleted, RunnerDispatched, SubResult,
    TypedEvent,
};
pub use stage::{
    summarize_args, DynamicStep, NodeProgress, NodeState, StageProgress, StageState,
    StepProgress, StepState, SubStepOutcome,
};
pub use step::{
    CompiledStage, DeclarationKind, RunnerStep, StanzaKind, Step, StepKind, SubStep,
    SubStepCall, TargetedStep,
};
