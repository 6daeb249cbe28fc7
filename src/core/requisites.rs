//! Requisite evaluation.
//!
//! The executor decides whether a step runs from the outcome of the steps
//! it depends on. The monitor mirrors that decision so the tracker can
//! move past steps the executor will never dispatch.

use crate::domain::{StageProgress, Step, StepState};

/// Whether the executor will run a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    Run,

    /// Skipped because of the dependency at this one-based position
    Skip { dependency: usize, reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A required step did not succeed
    RequirementNotMet,

    /// An `onfail` step succeeded
    NoFailure,
}

impl SkipDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip { .. })
    }
}

/// Evaluate a step's requisites against current progress
pub fn should_skip(step: &Step, progress: &StageProgress) -> SkipDecision {
    let state_of = |dep: &Step| {
        progress
            .steps
            .get(dep.index)
            .map(|p| p.state)
            .unwrap_or_default()
    };

    for dep in &step.on_success_deps {
        if state_of(dep) != (StepState::Finished { success: true }) {
            return SkipDecision::Skip {
                dependency: dep.order(),
                reason: SkipReason::RequirementNotMet,
            };
        }
    }

    // A skipped dependency reports no success, so `onfail` still fires
    for dep in &step.on_failure_deps {
        if state_of(dep) == (StepState::Finished { success: true }) {
            return SkipDecision::Skip {
                dependency: dep.order(),
                reason: SkipReason::NoFailure,
            };
        }
    }

    SkipDecision::Run
}
