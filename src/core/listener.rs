//! Listener protocol for stage progress.
//!
//! Presentation layers implement [`StageListener`] and register with the
//! monitor or tracker. Every method has a no-op default so listeners only
//! override what they display. Notifications are delivered synchronously,
//! in registration order, on the task that applies the event; listeners
//! must not block.

use std::sync::Arc;

use tracing::{info, warn};

use super::compiler::CompileError;
use crate::domain::{CompiledStage, DynamicStep, StageProgress, StepProgress, SubResult};

/// Observer of stage and step transitions
pub trait StageListener: Send + Sync {
    fn stage_parsing_started(&self, _stage_name: &str) {}

    fn stage_parsing_finished(
        &self,
        _stage: Option<&CompiledStage>,
        _output: &str,
        _error: Option<&CompileError>,
    ) {
    }

    fn stage_started(&self, _stage: &StageProgress) {}

    fn stage_finished(&self, _stage: &StageProgress) {}

    fn step_runner_started(&self, _step: &StepProgress) {}

    fn step_runner_finished(&self, _step: &StepProgress) {}

    fn step_state_started(&self, _step: &StepProgress) {}

    fn step_state_minion_finished(&self, _step: &StepProgress, _node: &str) {}

    fn step_state_result(&self, _step: &StepProgress, _event: &SubResult) {}

    fn step_state_finished(&self, _step: &StepProgress) {}

    fn step_skipped(&self, _step: &StepProgress) {}

    /// A dispatch outside the compiled steps started (dynamic tracking only)
    fn dynamic_step_started(&self, _step: &DynamicStep) {}

    fn dynamic_step_finished(&self, _step: &DynamicStep) {}
}

/// Registered listeners, notified in registration order
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Vec<Arc<dyn StageListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn StageListener>) {
        self.inner.push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Deliver one notification to every listener
    pub fn notify(&self, f: impl Fn(&dyn StageListener)) {
        for listener in &self.inner {
            f(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.inner.len())
            .finish()
    }
}

impl FromIterator<Arc<dyn StageListener>> for Listeners {
    fn from_iter<I: IntoIterator<Item = Arc<dyn StageListener>>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

/// Listener that records every transition in the tracing log
#[derive(Debug, Default)]
pub struct LoggingListener;

fn outcome(success: Option<bool>) -> &'static str {
    match success {
        Some(true) => "succeeded",
        Some(false) => "failed",
        None => "unknown",
    }
}

impl StageListener for LoggingListener {
    fn stage_parsing_started(&self, stage_name: &str) {
        info!(stage = stage_name, "Parsing stage");
    }

    fn stage_parsing_finished(
        &self,
        stage: Option<&CompiledStage>,
        _output: &str,
        error: Option<&CompileError>,
    ) {
        match (stage, error) {
            (_, Some(err)) => warn!(error = %err, "Stage parsing failed"),
            (Some(stage), None) => {
                info!(stage = %stage.name, steps = stage.total_steps(), "Stage parsed")
            }
            (None, None) => {}
        }
    }

    fn stage_started(&self, stage: &StageProgress) {
        info!(
            stage = %stage.name,
            job_id = stage.job_id.as_deref().unwrap_or(""),
            steps = stage.total_steps(),
            "Stage started"
        );
    }

    fn stage_finished(&self, stage: &StageProgress) {
        info!(
            stage = %stage.name,
            result = outcome(stage.success()),
            succeeded = stage.succeeded_count(),
            failed = stage.failed_count(),
            skipped = stage.skipped_count(),
            "Stage finished"
        );
    }

    fn step_runner_started(&self, step: &StepProgress) {
        info!(
            order = step.step.order(),
            function = step.step.match_name(),
            args = %step.args_summary,
            "Runner step started"
        );
    }

    fn step_runner_finished(&self, step: &StepProgress) {
        info!(
            order = step.step.order(),
            function = step.step.match_name(),
            result = outcome(step.success()),
            "Runner step finished"
        );
    }

    fn step_state_started(&self, step: &StepProgress) {
        info!(
            order = step.step.order(),
            name = step.step.match_name(),
            targets = ?step.target_names(),
            "State step started"
        );
    }

    fn step_state_minion_finished(&self, step: &StepProgress, node: &str) {
        let success = step.node(node).and_then(|n| n.success());
        info!(
            order = step.step.order(),
            node,
            result = outcome(success),
            "Node finished"
        );
    }

    fn step_state_result(&self, step: &StepProgress, event: &SubResult) {
        info!(
            order = step.step.order(),
            node = %event.node,
            component = %event.component_id,
            name = %event.name,
            result = event.result,
            "State result"
        );
    }

    fn step_state_finished(&self, step: &StepProgress) {
        info!(
            order = step.step.order(),
            name = step.step.match_name(),
            result = outcome(step.success()),
            "State step finished"
        );
    }

    fn step_skipped(&self, step: &StepProgress) {
        info!(
            order = step.step.order(),
            description = %step.step.description,
            "Step skipped"
        );
    }

    fn dynamic_step_started(&self, step: &DynamicStep) {
        info!(
            job_id = %step.job_id,
            name = %step.name,
            targets = ?step.target_names(),
            "Dynamic step started"
        );
    }

    fn dynamic_step_finished(&self, step: &DynamicStep) {
        info!(
            job_id = %step.job_id,
            name = %step.name,
            result = outcome(step.success()),
            "Dynamic step finished"
        );
    }
}
