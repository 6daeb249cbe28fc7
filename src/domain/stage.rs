//! Live progress of a stage run.
//!
//! A [`StageProgress`] mirrors a compiled stage and records what the event
//! feed has revealed so far. Only the stage tracker mutates it; readers get
//! immutable snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::events::SubResult;
use super::step::{CompiledStage, Step, SubStep};

/// Lifecycle of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StageState {
    NotStarted,
    Running,
    Finished { success: bool },
}

/// Lifecycle of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepState {
    Pending,
    Running,
    Finished { success: bool },
    Skipped,
}

/// Lifecycle of one target node within a targeted step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum NodeState {
    Pending,
    Running,
    Finished { success: bool },
}

impl Default for StageState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl Default for StepState {
    fn default() -> Self {
        Self::Pending
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Outcome of one sub-step on one node, as far as sub-results tell
#[derive(Debug, Clone, Serialize)]
pub struct SubStepOutcome {
    pub label: String,
    pub result: Option<bool>,
}

/// Progress of one node inside a targeted step
#[derive(Debug, Clone, Serialize)]
pub struct NodeProgress {
    pub name: String,
    pub state: NodeState,
    pub finished_at: Option<DateTime<Utc>>,

    /// Per-node view of the step's sub-steps
    pub sub_steps: Vec<SubStepOutcome>,

    /// Every sub-result received for this node, in arrival order
    pub results: Vec<SubResult>,
}

impl NodeProgress {
    fn new(name: String, sub_steps: &[SubStep]) -> Self {
        Self {
            name,
            state: NodeState::Pending,
            finished_at: None,
            sub_steps: sub_steps
                .iter()
                .map(|s| SubStepOutcome {
                    label: s.pretty(),
                    result: None,
                })
                .collect(),
            results: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, NodeState::Finished { .. })
    }

    pub fn success(&self) -> Option<bool> {
        match self.state {
            NodeState::Finished { success } => Some(success),
            _ => None,
        }
    }
}

/// What happened when a node completion was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeCompletion {
    /// Recorded; `step_finished` tells whether it was the last node
    Recorded { step_finished: bool },
    UnknownNode,
    AlreadyFinished,
}

/// Node entries for a dispatch, first occurrence wins
fn node_targets(nodes: &[String], sub_steps: &[SubStep]) -> Vec<NodeProgress> {
    let mut targets: Vec<NodeProgress> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if !targets.iter().any(|t| &t.name == node) {
            targets.push(NodeProgress::new(node.clone(), sub_steps));
        }
    }
    targets
}

/// Mark one node finished and report whether it was the last
fn record_node(targets: Option<&mut Vec<NodeProgress>>, node: &str, success: bool) -> NodeCompletion {
    let Some(targets) = targets else {
        return NodeCompletion::UnknownNode;
    };
    let Some(entry) = targets.iter_mut().find(|n| n.name == node) else {
        return NodeCompletion::UnknownNode;
    };
    if entry.is_finished() {
        return NodeCompletion::AlreadyFinished;
    }

    entry.state = NodeState::Finished { success };
    entry.finished_at = Some(Utc::now());

    NodeCompletion::Recorded {
        step_finished: targets.iter().all(NodeProgress::is_finished),
    }
}

fn all_succeeded(targets: &Option<Vec<NodeProgress>>) -> bool {
    targets.iter().flatten().all(|n| n.success() == Some(true))
}

/// Progress of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepProgress {
    pub step: Arc<Step>,
    pub state: StepState,

    /// Job id of the dispatch that started this step
    pub job_id: Option<String>,

    /// Dispatch arguments, condensed for display
    pub args_summary: String,

    /// Target nodes, in dispatch order. `None` until dispatched, and always
    /// `None` for runner steps.
    pub targets: Option<Vec<NodeProgress>>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepProgress {
    fn new(step: Arc<Step>) -> Self {
        Self {
            step,
            state: StepState::Pending,
            job_id: None,
            args_summary: String::new(),
            targets: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == StepState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.state == StepState::Running
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, StepState::Finished { .. })
    }

    pub fn is_skipped(&self) -> bool {
        self.state == StepState::Skipped
    }

    /// `Some(success)` once finished, `None` while pending, running or skipped
    pub fn success(&self) -> Option<bool> {
        match self.state {
            StepState::Finished { success } => Some(success),
            _ => None,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeProgress> {
        self.targets.as_ref()?.iter().find(|n| n.name == name)
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets
            .iter()
            .flatten()
            .map(|n| n.name.as_str())
            .collect()
    }

    pub(crate) fn start(&mut self, job_id: &str, args: &[Value], nodes: Option<&[String]>) {
        self.state = StepState::Running;
        self.job_id = Some(job_id.to_string());
        self.args_summary = summarize_args(args, self.step.match_name());
        self.started_at = Some(Utc::now());

        if let Some(nodes) = nodes {
            self.targets = Some(node_targets(nodes, self.step.sub_steps()));
        }
    }

    pub(crate) fn finish(&mut self, success: bool) {
        self.state = StepState::Finished { success };
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn skip(&mut self) {
        self.state = StepState::Skipped;
        self.finished_at = Some(Utc::now());
    }

    /// Record one node's completion; finishes the step when it was the last.
    pub(crate) fn finish_node(&mut self, node: &str, success: bool) -> NodeCompletion {
        let completion = record_node(self.targets.as_mut(), node, success);
        if completion == (NodeCompletion::Recorded { step_finished: true }) {
            let aggregate = all_succeeded(&self.targets);
            self.finish(aggregate);
        }
        completion
    }

    /// Attach a sub-result to its node. Returns false for unknown or
    /// already finished nodes.
    pub(crate) fn record_sub_result(&mut self, event: &SubResult) -> bool {
        let Some(entry) = self
            .targets
            .as_mut()
            .and_then(|t| t.iter_mut().find(|n| n.name == event.node))
        else {
            return false;
        };
        if entry.is_finished() {
            return false;
        }

        entry.state = NodeState::Running;

        let matched = self
            .step
            .sub_steps()
            .iter()
            .zip(entry.sub_steps.iter_mut())
            .find(|(sub, outcome)| {
                outcome.result.is_none() && sub.matches_result(&event.name, &event.component_id)
            });
        if let Some((_, outcome)) = matched {
            outcome.result = Some(event.result);
        }

        entry.results.push(event.clone());
        true
    }
}

/// A dispatch seen while the stage runs that matches no compiled step.
///
/// Dynamic steps sit beside the step queue: they never move the head and
/// do not count toward the stage result.
#[derive(Debug, Clone, Serialize)]
pub struct DynamicStep {
    pub job_id: String,

    /// Runner function (without its `runner.` prefix) or state name
    pub name: String,
    pub state: StepState,
    pub args_summary: String,

    /// Target nodes; `None` for runners
    pub targets: Option<Vec<NodeProgress>>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DynamicStep {
    pub(crate) fn start(job_id: &str, name: &str, args: &[Value], nodes: Option<&[String]>) -> Self {
        Self {
            job_id: job_id.to_string(),
            name: name.to_string(),
            state: StepState::Running,
            args_summary: summarize_args(args, name),
            targets: nodes.map(|nodes| node_targets(nodes, &[])),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, StepState::Finished { .. })
    }

    pub fn success(&self) -> Option<bool> {
        match self.state {
            StepState::Finished { success } => Some(success),
            _ => None,
        }
    }

    pub fn target_names(&self) -> Vec<&str> {
        self.targets
            .iter()
            .flatten()
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Same call as another dispatch: name, arguments and node set
    pub fn same_call(&self, other: &DynamicStep) -> bool {
        let mut ours = self.target_names();
        let mut theirs = other.target_names();
        ours.sort_unstable();
        theirs.sort_unstable();
        self.name == other.name && self.args_summary == other.args_summary && ours == theirs
    }

    pub(crate) fn finish(&mut self, success: bool) {
        self.state = StepState::Finished { success };
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn finish_node(&mut self, node: &str, success: bool) -> NodeCompletion {
        let completion = record_node(self.targets.as_mut(), node, success);
        if completion == (NodeCompletion::Recorded { step_finished: true }) {
            let aggregate = all_succeeded(&self.targets);
            self.finish(aggregate);
        }
        completion
    }
}

/// Progress of a whole stage run
#[derive(Debug, Clone, Serialize)]
pub struct StageProgress {
    pub name: String,
    pub state: StageState,

    /// Job id of the top-level orchestration job
    pub job_id: Option<String>,

    pub steps: Vec<StepProgress>,

    /// Index of the single step eligible for events
    pub head: usize,

    /// Untracked dispatches, in arrival order
    pub dynamic_steps: Vec<DynamicStep>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Set when tracking was stopped before the stage finished on its own
    pub stopped: bool,
}

impl StageProgress {
    /// Fresh progress for a compiled stage, every step pending
    pub fn new(stage: &CompiledStage) -> Self {
        Self {
            name: stage.name.clone(),
            state: StageState::NotStarted,
            job_id: None,
            steps: stage.steps.iter().cloned().map(StepProgress::new).collect(),
            head: 0,
            dynamic_steps: Vec::new(),
            started_at: None,
            finished_at: None,
            stopped: false,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// The step currently eligible for events, if any remain
    pub fn head_step(&self) -> Option<&StepProgress> {
        self.steps.get(self.head)
    }

    pub fn step(&self, order: usize) -> Option<&StepProgress> {
        order.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    /// Find the step that was started by a given job
    pub fn step_by_job(&self, job_id: &str) -> Option<&StepProgress> {
        self.steps
            .iter()
            .find(|s| s.job_id.as_deref() == Some(job_id))
    }

    pub fn dynamic_step(&self, job_id: &str) -> Option<&DynamicStep> {
        self.dynamic_steps.iter().find(|d| d.job_id == job_id)
    }

    pub fn is_running(&self) -> bool {
        self.state == StageState::Running
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, StageState::Finished { .. })
    }

    pub fn success(&self) -> Option<bool> {
        match self.state {
            StageState::Finished { success } => Some(success),
            _ => None,
        }
    }

    /// AND over every executed (non-skipped) step that finished
    pub fn executed_success(&self) -> bool {
        self.steps
            .iter()
            .filter_map(StepProgress::success)
            .all(|s| s)
    }

    pub fn succeeded_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.success() == Some(true))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.success() == Some(false))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_skipped()).count()
    }
}

/// Keys the dispatcher injects into keyword arguments
const INTERNAL_ARG_KEYS: &[&str] = &["concurrent", "saltenv", "__kwarg__", "queue"];

/// Condense dispatch arguments for display, dropping engine-internal
/// keywords and the step's own name.
pub fn summarize_args(args: &[Value], own_name: &str) -> String {
    let mut parts = Vec::new();

    for arg in args {
        match arg {
            Value::Object(map) => {
                for (key, val) in map {
                    if INTERNAL_ARG_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    match val {
                        Value::String(s) => parts.push(format!("{}={}", key, s)),
                        other => parts.push(format!("{}={}", key, other)),
                    }
                }
            }
            Value::String(s) if s == own_name => {}
            Value::String(s) => parts.push(s.clone()),
            Value::Null => {}
            other => parts.push(other.to_string()),
        }
    }

    parts.join(", ")
}
