//! Stage monitor.
//!
//! Wires the event pipeline together: raw bus events are demultiplexed,
//! housekeeping traffic is filtered, orchestration jobs start and finish
//! stages, and everything else is routed to the tracker of the running
//! stage. After each applied event the monitor mirrors the executor's
//! requisite decisions so skipped steps do not stall the head of the
//! queue.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::compiler::{CompileError, CompileOptions, Compiled, StageCompiler};
use super::demux::EventDemux;
use super::filter::NoiseFilter;
use super::listener::{Listeners, StageListener};
use super::requisites::{should_skip, SkipDecision};
use super::tracker::{Outcome, StageTracker, StopHandle};
use crate::domain::events::strip_runner_prefix;
use crate::domain::{CompiledStage, RawEvent, RunnerCompleted, RunnerDispatched, StageProgress, TypedEvent};

/// Runner functions that run a whole stage
pub fn default_orchestration_functions() -> Vec<String> {
    vec![
        "runner.state.orch".to_string(),
        "runner.state.orchestrate".to_string(),
    ]
}

/// What the monitor did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Not decodable into a typed event
    Foreign,

    /// Housekeeping traffic, dropped by the filter
    Noise,

    /// No stage is running
    NoStage,

    StageStarted { stage: String },

    /// The stage could not be compiled; it is not tracked
    CompileFailed { stage: String },

    StageFinished { stage: String },

    /// Routed to the running stage's tracker
    Tracked(Outcome),
}

/// Event loop owner tying the pipeline together
pub struct Monitor {
    compiler: StageCompiler,
    demux: EventDemux,
    filter: NoiseFilter,
    listeners: Listeners,
    options: CompileOptions,
    orchestration_functions: Vec<String>,

    /// Stages compiled ahead of their orchestration event
    prepared: HashMap<String, Compiled>,

    tracker: Option<StageTracker>,
    last_finished: Option<Arc<StageProgress>>,
    exit_after_stage: bool,
    dynamic_steps: bool,

    stop: StopHandle,
    snapshots: watch::Sender<Option<Arc<StageProgress>>>,
}

impl Monitor {
    pub fn new(compiler: StageCompiler, demux: EventDemux, filter: NoiseFilter) -> Self {
        let (snapshots, _) = watch::channel(None);
        Self {
            compiler,
            demux,
            filter,
            listeners: Listeners::new(),
            options: CompileOptions::default(),
            orchestration_functions: default_orchestration_functions(),
            prepared: HashMap::new(),
            tracker: None,
            last_finished: None,
            exit_after_stage: false,
            dynamic_steps: false,
            stop: StopHandle::new(),
            snapshots,
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_orchestration_functions(mut self, functions: Vec<String>) -> Self {
        self.orchestration_functions = functions;
        self
    }

    /// Track dispatches that match no compiled step beside the step queue
    pub fn with_dynamic_steps(mut self, enabled: bool) -> Self {
        self.dynamic_steps = enabled;
        self
    }

    /// Make [`Monitor::run`] return once the first tracked stage finishes
    pub fn exit_after_stage(mut self, exit: bool) -> Self {
        self.exit_after_stage = exit;
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn StageListener>) {
        self.listeners.add(listener);
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<StageProgress>>> {
        self.snapshots.subscribe()
    }

    /// Progress of the running stage, or of the last finished one
    pub fn snapshot(&self) -> Option<Arc<StageProgress>> {
        match &self.tracker {
            Some(tracker) => Some(tracker.snapshot()),
            None => self.last_finished.clone(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    /// Compile a stage before its orchestration event arrives
    pub async fn prepare_stage(&mut self, stage_name: &str) -> Result<&CompiledStage, CompileError> {
        let compiled = self.compile_notifying(stage_name).await?;
        self.prepared.remove(stage_name);
        let entry = self
            .prepared
            .entry(stage_name.to_string())
            .or_insert(compiled);
        Ok(&entry.stage)
    }

    async fn compile_notifying(&self, stage_name: &str) -> Result<Compiled, CompileError> {
        self.listeners.notify(|l| l.stage_parsing_started(stage_name));

        match self.compiler.compile_stage(stage_name, self.options).await {
            Ok(compiled) => {
                self.listeners.notify(|l| {
                    l.stage_parsing_finished(Some(&compiled.stage), &compiled.output, None)
                });
                Ok(compiled)
            }
            Err(err) => {
                self.listeners
                    .notify(|l| l.stage_parsing_finished(None, "", Some(&err)));
                Err(err)
            }
        }
    }

    fn is_orchestration(&self, function: &str) -> bool {
        let function = strip_runner_prefix(function);
        self.orchestration_functions
            .iter()
            .any(|f| strip_runner_prefix(f) == function)
    }

    /// Decode and apply one raw bus event
    pub async fn handle_raw(&mut self, raw: &RawEvent) -> Handled {
        match self.demux.decode(raw) {
            Some(event) => self.handle_event(&event).await,
            None => Handled::Foreign,
        }
    }

    /// Apply one typed event
    pub async fn handle_event(&mut self, event: &TypedEvent) -> Handled {
        let handled = match event {
            TypedEvent::RunnerDispatched(e) if self.is_orchestration(&e.function) => {
                self.start_stage(e).await
            }
            TypedEvent::RunnerCompleted(e) if self.is_orchestration(&e.function) => {
                self.finish_stage(e)
            }
            _ => self.route(event),
        };
        self.publish();
        handled
    }

    async fn start_stage(&mut self, event: &RunnerDispatched) -> Handled {
        let Some(stage_name) = orchestrated_stage(&event.args) else {
            debug!(job_id = %event.job_id, "Orchestration without a stage name");
            return Handled::NoStage;
        };

        if let Some(mut previous) = self.tracker.take() {
            if !previous.is_finished() {
                warn!(
                    stage = %previous.progress().name,
                    "New stage started before the previous one finished"
                );
                previous.finish(false);
            }
            self.last_finished = Some(previous.snapshot());
        }

        let compiled = match self.prepared.remove(&stage_name) {
            Some(compiled) => compiled,
            None => match self.compile_notifying(&stage_name).await {
                Ok(compiled) => compiled,
                Err(err) => {
                    warn!(stage = %stage_name, error = %err, "Not tracking stage");
                    return Handled::CompileFailed { stage: stage_name };
                }
            },
        };

        let mut tracker = StageTracker::new(&compiled.stage, self.listeners.clone())
            .with_dynamic_steps(self.dynamic_steps)
            .with_stop_handle(self.stop.clone());
        tracker.start(&event.job_id);
        info!(stage = %stage_name, job_id = %event.job_id, "Tracking stage");

        self.tracker = Some(tracker);
        self.skip_ahead();
        Handled::StageStarted { stage: stage_name }
    }

    fn finish_stage(&mut self, event: &RunnerCompleted) -> Handled {
        let owns_job = self
            .tracker
            .as_ref()
            .is_some_and(|t| t.progress().job_id.as_deref() == Some(event.job_id.as_str()));
        if !owns_job {
            debug!(job_id = %event.job_id, "Orchestration return for an untracked stage");
            return Handled::NoStage;
        }
        let Some(mut tracker) = self.tracker.take() else {
            return Handled::NoStage;
        };

        tracker.finish(event.success);
        let stage = tracker.progress().name.clone();
        self.last_finished = Some(tracker.snapshot());
        Handled::StageFinished { stage }
    }

    fn route(&mut self, event: &TypedEvent) -> Handled {
        if self.filter.is_noise(event) {
            return Handled::Noise;
        }
        if self.options.hide_state_steps && matches!(event, TypedEvent::SubResultReported(_)) {
            return Handled::Noise;
        }

        let Some(tracker) = self.tracker.as_mut() else {
            debug!(kind = event.kind(), "No stage running");
            return Handled::NoStage;
        };

        let outcome = tracker.handle(event);
        if outcome.is_applied() {
            self.skip_ahead();
        }
        Handled::Tracked(outcome)
    }

    /// Skip head steps whose requisites rule them out
    fn skip_ahead(&mut self) {
        let Some(tracker) = self.tracker.as_mut() else {
            return;
        };

        while tracker.progress().is_running() {
            let Some(head) = tracker.progress().head_step() else {
                break;
            };
            if !head.is_pending() {
                break;
            }
            let step = head.step.clone();
            let decision = should_skip(&step, tracker.progress());
            if let SkipDecision::Skip { dependency, reason } = decision {
                debug!(order = step.order(), dependency, ?reason, "Requisites not met");
                tracker.mark_skipped(&step);
            } else {
                break;
            }
        }
    }

    /// Stop tracking. The running stage, if any, is finished as failed.
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.stop();
        }
        self.publish();
    }

    /// Consume raw events until the feed ends or a stop is requested.
    /// Returns the final progress of the running or last finished stage.
    pub async fn run(&mut self, mut events: mpsc::Receiver<RawEvent>) -> Option<Arc<StageProgress>> {
        let stop = self.stop.clone();
        info!("Monitoring stage events");

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    info!("Stop requested");
                    break;
                }
                received = events.recv() => {
                    let Some(raw) = received else {
                        info!("Event feed closed");
                        break;
                    };
                    let handled = self.handle_raw(&raw).await;
                    if self.exit_after_stage && matches!(handled, Handled::StageFinished { .. }) {
                        break;
                    }
                }
            }
        }

        if stop.is_stopped() {
            self.stop();
        }
        self.snapshot()
    }
}

/// Stage name carried by an orchestration dispatch
fn orchestrated_stage(args: &[Value]) -> Option<String> {
    args.iter().find_map(|arg| match arg {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("mods").and_then(Value::as_str).map(String::from),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_orchestrated_stage_name() {
        assert_eq!(
            orchestrated_stage(&[json!("ceph.stage.0"), json!({"__kwarg__": true})]),
            Some("ceph.stage.0".to_string())
        );
        assert_eq!(
            orchestrated_stage(&[json!({"mods": "ceph.stage.1"})]),
            Some("ceph.stage.1".to_string())
        );
        assert_eq!(orchestrated_stage(&[]), None);
    }
}
