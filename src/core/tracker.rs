//! Stage tracker state machine.
//!
//! A [`StageTracker`] owns the live progress of one stage run and advances
//! it from typed events. Only the step at the head of the queue may be
//! started or finished; anything else is ignored, which keeps the picture
//! sound while unrelated jobs share the bus.
//!
//! Readers never touch the live progress: every change is published as an
//! immutable snapshot on a watch channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use super::listener::Listeners;
use crate::domain::stage::NodeCompletion;
use crate::domain::{
    CompiledStage, DynamicStep, JobCompleted, RunnerCompleted, StageProgress, StageState, Step,
    StepProgress, SubResult, TypedEvent,
};

/// What the tracker did with an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// State changed
    Applied,

    /// Nothing changed
    Ignored(IgnoreReason),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        *self == Self::Applied
    }
}

/// Why an input left the tracker unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Tracking was stopped
    Stopped,

    /// The stage is not running
    NotRunning,

    /// The stage was already started
    AlreadyStarted,

    /// Every step has been dealt with
    NoPendingStep,

    /// The dispatch names a different step than the head
    HeadMismatch,

    /// The head step is already running
    HeadNotPending,

    /// No step was started by this job
    UnknownJob,

    /// The job belongs to a step that is not the head
    NotHead,

    /// The node is not among the step's targets
    UnknownNode,

    /// The event was already applied
    Duplicate,
}

/// Cloneable handle that stops a tracker from another task
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Safe to call any number of times from any task.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested, on every clone
    pub async fn stopped(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);

        // Register before checking the flag so a concurrent stop is not lost
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// State machine for one stage run
pub struct StageTracker {
    progress: StageProgress,
    listeners: Listeners,
    dynamic_steps: bool,
    stop: StopHandle,
    snapshots: watch::Sender<Arc<StageProgress>>,
}

impl StageTracker {
    /// Create a tracker with every step pending
    pub fn new(stage: &CompiledStage, listeners: Listeners) -> Self {
        let progress = StageProgress::new(stage);
        let (snapshots, _) = watch::channel(Arc::new(progress.clone()));
        Self {
            progress,
            listeners,
            dynamic_steps: false,
            stop: StopHandle::new(),
            snapshots,
        }
    }

    /// Record dispatches that do not match the head as dynamic steps
    /// instead of ignoring them
    pub fn with_dynamic_steps(mut self, enabled: bool) -> Self {
        self.dynamic_steps = enabled;
        self
    }

    /// Share a stop handle with the caller instead of a private one
    pub fn with_stop_handle(mut self, handle: StopHandle) -> Self {
        self.stop = handle;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Receive a snapshot after every change
    pub fn subscribe(&self) -> watch::Receiver<Arc<StageProgress>> {
        self.snapshots.subscribe()
    }

    /// The latest published snapshot
    pub fn snapshot(&self) -> Arc<StageProgress> {
        self.snapshots.borrow().clone()
    }

    pub fn progress(&self) -> &StageProgress {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.progress.is_finished()
    }

    fn publish(&self) {
        self.snapshots.send_replace(Arc::new(self.progress.clone()));
    }

    fn ignore(&self, reason: IgnoreReason, event: &str, job_id: &str) -> Outcome {
        match reason {
            IgnoreReason::UnknownNode | IgnoreReason::NotHead => {
                warn!(stage = %self.progress.name, event, job_id, ?reason, "Ignoring event")
            }
            _ => debug!(stage = %self.progress.name, event, job_id, ?reason, "Ignoring event"),
        }
        Outcome::Ignored(reason)
    }

    /// Mark the stage as running under the orchestration job `job_id`
    pub fn start(&mut self, job_id: &str) -> Outcome {
        if self.stop.is_stopped() {
            return self.ignore(IgnoreReason::Stopped, "start", job_id);
        }
        if self.progress.state != StageState::NotStarted {
            return self.ignore(IgnoreReason::AlreadyStarted, "start", job_id);
        }

        self.progress.state = StageState::Running;
        self.progress.job_id = Some(job_id.to_string());
        self.progress.started_at = Some(Utc::now());
        info!(stage = %self.progress.name, job_id, "Stage started");

        self.publish();
        self.listeners.notify(|l| l.stage_started(&self.progress));

        self.finish_if_exhausted();
        Outcome::Applied
    }

    /// Apply one typed event
    pub fn handle(&mut self, event: &TypedEvent) -> Outcome {
        if self.stop.is_stopped() {
            return self.ignore(IgnoreReason::Stopped, event.kind(), event.job_id());
        }
        if !self.progress.is_running() {
            return self.ignore(IgnoreReason::NotRunning, event.kind(), event.job_id());
        }

        match event {
            TypedEvent::JobDispatched(e) => self.on_dispatch(
                event.kind(),
                &e.job_id,
                e.step_name(),
                &e.args,
                Some(e.target_nodes.as_slice()),
            ),
            TypedEvent::RunnerDispatched(e) => {
                self.on_dispatch(event.kind(), &e.job_id, e.step_name(), &e.args, None)
            }
            TypedEvent::RunnerCompleted(e) => self.on_runner_completed(e),
            TypedEvent::JobCompleted(e) => self.on_job_completed(e),
            TypedEvent::SubResultReported(e) => self.on_sub_result(e),
        }
    }

    fn step_index_by_job(&self, job_id: &str) -> Option<usize> {
        self.progress
            .steps
            .iter()
            .position(|s| s.job_id.as_deref() == Some(job_id))
    }

    /// Locate the step a follow-up event belongs to; it must be the
    /// running head.
    fn running_head_for(&self, event: &str, job_id: &str) -> Result<usize, Outcome> {
        let Some(index) = self.step_index_by_job(job_id) else {
            return Err(self.ignore(IgnoreReason::UnknownJob, event, job_id));
        };
        let step = &self.progress.steps[index];
        if step.is_finished() || step.is_skipped() {
            return Err(self.ignore(IgnoreReason::Duplicate, event, job_id));
        }
        if index != self.progress.head {
            return Err(self.ignore(IgnoreReason::NotHead, event, job_id));
        }
        Ok(index)
    }

    fn on_dispatch(
        &mut self,
        event: &str,
        job_id: &str,
        name: &str,
        args: &[Value],
        nodes: Option<&[String]>,
    ) -> Outcome {
        if self.step_index_by_job(job_id).is_some() || self.dynamic_index(job_id).is_some() {
            return self.ignore(IgnoreReason::Duplicate, event, job_id);
        }
        let head = self.progress.head;
        let Some(step) = self.progress.steps.get(head) else {
            return self.ignore(IgnoreReason::NoPendingStep, event, job_id);
        };
        let mismatch = if !step.is_pending() {
            Some(IgnoreReason::HeadNotPending)
        } else if step.step.match_name() != name {
            debug!(expected = step.step.match_name(), got = name, "Dispatch does not match head");
            Some(IgnoreReason::HeadMismatch)
        } else {
            None
        };
        if let Some(reason) = mismatch {
            if self.dynamic_steps {
                return self.start_dynamic(event, job_id, name, args, nodes);
            }
            return self.ignore(reason, event, job_id);
        }

        let step = &mut self.progress.steps[head];
        step.start(job_id, args, nodes);
        info!(
            order = step.step.order(),
            name,
            job_id,
            targets = ?step.target_names(),
            "Step started"
        );

        self.publish();
        let step = &self.progress.steps[head];
        match &step.targets {
            None => self.listeners.notify(|l| l.step_runner_started(step)),
            Some(targets) => {
                self.listeners.notify(|l| l.step_state_started(step));
                if targets.is_empty() {
                    warn!(order = step.step.order(), "Step dispatched to no nodes");
                    self.progress.steps[head].finish(false);
                    self.complete_head(head);
                }
            }
        }

        Outcome::Applied
    }

    fn dynamic_index(&self, job_id: &str) -> Option<usize> {
        self.progress
            .dynamic_steps
            .iter()
            .position(|d| d.job_id == job_id)
    }

    fn start_dynamic(
        &mut self,
        event: &str,
        job_id: &str,
        name: &str,
        args: &[Value],
        nodes: Option<&[String]>,
    ) -> Outcome {
        let step = DynamicStep::start(job_id, name, args, nodes);

        // Compiling the stage dispatches the same calls just before it runs
        let before_first_step = self.progress.head == 0
            && self
                .progress
                .steps
                .first()
                .map_or(true, StepProgress::is_pending);
        if before_first_step && self.progress.dynamic_steps.iter().any(|d| d.same_call(&step)) {
            return self.ignore(IgnoreReason::Duplicate, event, job_id);
        }

        info!(job_id, name, targets = ?step.target_names(), "Dynamic step started");
        let no_targets = step.targets.as_ref().is_some_and(Vec::is_empty);
        self.progress.dynamic_steps.push(step);
        let index = self.progress.dynamic_steps.len() - 1;
        if no_targets {
            warn!(job_id, "Dynamic step dispatched to no nodes");
            self.progress.dynamic_steps[index].finish(false);
        }

        self.publish();
        let step = &self.progress.dynamic_steps[index];
        self.listeners.notify(|l| l.dynamic_step_started(step));
        if no_targets {
            self.listeners.notify(|l| l.dynamic_step_finished(step));
        }
        Outcome::Applied
    }

    fn on_dynamic_completed(&mut self, index: usize, node: Option<&str>, success: bool) -> Outcome {
        let step = &mut self.progress.dynamic_steps[index];
        let job_id = step.job_id.clone();
        let kind = "dynamic_completed";
        if step.is_finished() {
            return self.ignore(IgnoreReason::Duplicate, kind, &job_id);
        }

        let finished = match (node, step.targets.is_some()) {
            (None, false) => {
                step.finish(success);
                true
            }
            (Some(node), true) => match step.finish_node(node, success) {
                NodeCompletion::Recorded { step_finished } => step_finished,
                NodeCompletion::AlreadyFinished => {
                    return self.ignore(IgnoreReason::Duplicate, kind, &job_id)
                }
                NodeCompletion::UnknownNode => {
                    return self.ignore(IgnoreReason::UnknownNode, kind, &job_id)
                }
            },
            _ => return self.ignore(IgnoreReason::UnknownNode, kind, &job_id),
        };

        self.publish();
        if finished {
            let step = &self.progress.dynamic_steps[index];
            info!(job_id = %step.job_id, success = ?step.success(), "Dynamic step finished");
            self.listeners.notify(|l| l.dynamic_step_finished(step));
        }
        Outcome::Applied
    }

    fn on_runner_completed(&mut self, event: &RunnerCompleted) -> Outcome {
        if let Some(index) = self.dynamic_index(&event.job_id) {
            return self.on_dynamic_completed(index, None, event.success);
        }
        let kind = "runner_completed";
        let index = match self.running_head_for(kind, &event.job_id) {
            Ok(index) => index,
            Err(outcome) => return outcome,
        };
        if self.progress.steps[index].targets.is_some() {
            return self.ignore(IgnoreReason::UnknownNode, kind, &event.job_id);
        }

        self.progress.steps[index].finish(event.success);
        self.complete_head(index);
        Outcome::Applied
    }

    fn on_job_completed(&mut self, event: &JobCompleted) -> Outcome {
        if let Some(index) = self.dynamic_index(&event.job_id) {
            return self.on_dynamic_completed(index, Some(&event.node), event.success);
        }
        let kind = "job_completed";
        let index = match self.running_head_for(kind, &event.job_id) {
            Ok(index) => index,
            Err(outcome) => return outcome,
        };

        match self.progress.steps[index].finish_node(&event.node, event.success) {
            NodeCompletion::UnknownNode => self.ignore(IgnoreReason::UnknownNode, kind, &event.job_id),
            NodeCompletion::AlreadyFinished => {
                self.ignore(IgnoreReason::Duplicate, kind, &event.job_id)
            }
            NodeCompletion::Recorded { step_finished } => {
                info!(
                    order = index + 1,
                    node = %event.node,
                    success = event.success,
                    "Node finished"
                );
                if !step_finished {
                    self.publish();
                }
                let step = &self.progress.steps[index];
                self.listeners
                    .notify(|l| l.step_state_minion_finished(step, &event.node));
                if step_finished {
                    self.complete_head(index);
                }
                Outcome::Applied
            }
        }
    }

    fn on_sub_result(&mut self, event: &SubResult) -> Outcome {
        let kind = "sub_result_reported";
        let index = match self.running_head_for(kind, &event.job_id) {
            Ok(index) => index,
            Err(outcome) => return outcome,
        };

        if !self.progress.steps[index].record_sub_result(event) {
            return self.ignore(IgnoreReason::UnknownNode, kind, &event.job_id);
        }

        self.publish();
        let step = &self.progress.steps[index];
        self.listeners.notify(|l| l.step_state_result(step, event));
        Outcome::Applied
    }

    /// The head step finished: notify, advance, and finish the stage when
    /// no steps remain.
    fn complete_head(&mut self, index: usize) {
        let step = &self.progress.steps[index];
        info!(
            order = step.step.order(),
            success = ?step.success(),
            "Step finished"
        );

        self.progress.head = index + 1;
        self.publish();

        let step = &self.progress.steps[index];
        if step.targets.is_some() {
            self.listeners.notify(|l| l.step_state_finished(step));
        } else {
            self.listeners.notify(|l| l.step_runner_finished(step));
        }

        self.finish_if_exhausted();
    }

    fn finish_if_exhausted(&mut self) {
        if self.progress.is_running() && self.progress.head >= self.progress.total_steps() {
            let success = self.progress.executed_success();
            self.finish_stage(success);
        }
    }

    /// Mark the head step as skipped without waiting for any event
    pub fn mark_skipped(&mut self, step: &Step) -> Outcome {
        let event = "mark_skipped";
        if self.stop.is_stopped() {
            return self.ignore(IgnoreReason::Stopped, event, "");
        }
        if !self.progress.is_running() {
            return self.ignore(IgnoreReason::NotRunning, event, "");
        }
        let head = self.progress.head;
        let Some(current) = self.progress.steps.get(head) else {
            return self.ignore(IgnoreReason::NoPendingStep, event, "");
        };
        if current.step.index != step.index || current.step.description != step.description {
            return self.ignore(IgnoreReason::NotHead, event, "");
        }
        if !current.is_pending() {
            return self.ignore(IgnoreReason::HeadNotPending, event, "");
        }

        self.progress.steps[head].skip();
        info!(order = step.order(), description = %step.description, "Step skipped");

        self.progress.head = head + 1;
        self.publish();
        let skipped = &self.progress.steps[head];
        self.listeners.notify(|l| l.step_skipped(skipped));

        self.finish_if_exhausted();
        Outcome::Applied
    }

    /// Finish the stage. The result is the reported `success` combined
    /// with every executed step's success.
    pub fn finish(&mut self, success: bool) -> Outcome {
        if self.stop.is_stopped() {
            return self.ignore(IgnoreReason::Stopped, "finish", "");
        }
        if self.progress.is_finished() {
            return self.ignore(IgnoreReason::Duplicate, "finish", "");
        }
        if !self.progress.is_running() {
            return self.ignore(IgnoreReason::NotRunning, "finish", "");
        }

        let success = success && self.progress.executed_success();
        self.finish_stage(success);
        Outcome::Applied
    }

    fn finish_stage(&mut self, success: bool) {
        self.progress.state = StageState::Finished { success };
        self.progress.finished_at = Some(Utc::now());
        info!(stage = %self.progress.name, success, "Stage finished");

        self.publish();
        self.listeners.notify(|l| l.stage_finished(&self.progress));
    }

    /// Stop tracking. A running stage is finished as failed; afterwards no
    /// input changes state. Idempotent.
    pub fn stop(&mut self) {
        if self.progress.stopped {
            return;
        }
        self.stop.stop();

        if self.progress.is_running() {
            self.finish_stage(false);
        }
        self.progress.stopped = true;
        info!(stage = %self.progress.name, "Tracking stopped");
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        DeclarationKind, JobDispatched, RunnerDispatched, RunnerStep, StepKind, StepState,
        TargetedStep,
    };
    use serde_json::json;

    fn runner(index: usize, function: &str) -> Arc<Step> {
        Arc::new(Step {
            index,
            description: function.to_string(),
            declared_as: DeclarationKind::Runner,
            kind: StepKind::Runner(RunnerStep {
                function: function.to_string(),
                args: json!({}),
            }),
            on_success_deps: vec![],
            on_failure_deps: vec![],
        })
    }

    fn targeted(index: usize, state: &str) -> Arc<Step> {
        Arc::new(Step {
            index,
            description: state.to_string(),
            declared_as: DeclarationKind::State,
            kind: StepKind::Targeted(TargetedStep {
                reference_name: state.to_string(),
                declared_target_selector: "*".to_string(),
                args: json!({}),
                sub_steps: vec![],
            }),
            on_success_deps: vec![],
            on_failure_deps: vec![],
        })
    }

    fn runner_new(job_id: &str, function: &str) -> TypedEvent {
        TypedEvent::RunnerDispatched(RunnerDispatched {
            job_id: job_id.to_string(),
            function: format!("runner.{}", function),
            args: vec![],
        })
    }

    fn runner_ret(job_id: &str, function: &str, success: bool) -> TypedEvent {
        TypedEvent::RunnerCompleted(RunnerCompleted {
            job_id: job_id.to_string(),
            function: format!("runner.{}", function),
            success,
            result: Value::Null,
        })
    }

    #[test]
    fn test_runner_step_lifecycle() {
        let stage = CompiledStage {
            name: "s".to_string(),
            steps: vec![runner(0, "ready.check")],
        };
        let mut tracker = StageTracker::new(&stage, Listeners::new());

        assert_eq!(
            tracker.handle(&runner_new("1", "ready.check")),
            Outcome::Ignored(IgnoreReason::NotRunning)
        );
        assert!(tracker.start("orch").is_applied());
        assert!(tracker.handle(&runner_new("1", "ready.check")).is_applied());
        assert_eq!(tracker.progress().steps[0].state, StepState::Running);

        assert!(tracker.handle(&runner_ret("1", "ready.check", true)).is_applied());
        assert_eq!(
            tracker.progress().steps[0].state,
            StepState::Finished { success: true }
        );
        assert_eq!(tracker.progress().success(), Some(true));
    }

    #[test]
    fn test_empty_target_set_fails_step() {
        let stage = CompiledStage {
            name: "s".to_string(),
            steps: vec![targeted(0, "ceph.mon"), runner(1, "next")],
        };
        let mut tracker = StageTracker::new(&stage, Listeners::new());
        tracker.start("orch");

        let dispatch = TypedEvent::JobDispatched(JobDispatched {
            job_id: "2".to_string(),
            function: "state.sls".to_string(),
            args: vec![json!("ceph.mon")],
            target_nodes: vec![],
        });
        assert!(tracker.handle(&dispatch).is_applied());

        assert_eq!(
            tracker.progress().steps[0].state,
            StepState::Finished { success: false }
        );
        assert_eq!(tracker.progress().head, 1);
    }

    #[test]
    fn test_dynamic_steps_beside_queue() {
        let stage = CompiledStage {
            name: "s".to_string(),
            steps: vec![runner(0, "a")],
        };
        let mut tracker = StageTracker::new(&stage, Listeners::new()).with_dynamic_steps(true);
        tracker.start("orch");

        assert!(tracker.handle(&runner_new("7", "extra.run")).is_applied());
        assert_eq!(
            tracker.handle(&runner_new("8", "extra.run")),
            Outcome::Ignored(IgnoreReason::Duplicate)
        );
        assert!(tracker.handle(&runner_ret("7", "extra.run", true)).is_applied());
        assert_eq!(
            tracker.handle(&runner_ret("7", "extra.run", true)),
            Outcome::Ignored(IgnoreReason::Duplicate)
        );

        let progress = tracker.progress();
        assert_eq!(progress.head, 0);
        assert_eq!(progress.dynamic_steps.len(), 1);
        assert_eq!(
            progress.dynamic_step("7").map(|d| d.state),
            Some(StepState::Finished { success: true })
        );
        assert!(progress.steps[0].is_pending());
    }

    #[test]
    fn test_snapshots_published() {
        let stage = CompiledStage {
            name: "s".to_string(),
            steps: vec![runner(0, "a")],
        };
        let mut tracker = StageTracker::new(&stage, Listeners::new());
        let rx = tracker.subscribe();

        tracker.start("orch");
        tracker.handle(&runner_new("1", "a"));

        assert!(rx.borrow().steps[0].is_running());
        assert_eq!(tracker.snapshot().steps[0].job_id.as_deref(), Some("1"));
    }

    #[test]
    fn test_stop_is_idempotent_and_final() {
        let stage = CompiledStage {
            name: "s".to_string(),
            steps: vec![runner(0, "a")],
        };
        let mut tracker = StageTracker::new(&stage, Listeners::new());
        let handle = tracker.stop_handle();
        tracker.start("orch");

        handle.stop();
        assert_eq!(
            tracker.handle(&runner_new("1", "a")),
            Outcome::Ignored(IgnoreReason::Stopped)
        );

        tracker.stop();
        tracker.stop();
        assert!(tracker.progress().stopped);
        assert_eq!(tracker.progress().success(), Some(false));
        assert_eq!(tracker.progress().steps[0].state, StepState::Pending);
    }
}
