//! Shared test support: an in-memory renderer, a recording listener, and
//! raw event builders shaped like real bus traffic.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};

use stagetrack::adapters::{RenderFailure, Rendered, Renderer};
use stagetrack::core::{CompileError, StageListener};
use stagetrack::domain::{
    CompiledStage, DynamicStep, RawEvent, StageProgress, StepProgress, SubResult,
};

/// Renderer serving YAML documents from memory
#[derive(Debug, Default)]
pub struct MockRenderer {
    stages: HashMap<String, Result<String, Vec<String>>>,
    states: HashMap<String, Result<String, (String, Vec<String>)>>,
    packages: HashSet<String>,
    stage_renders: AtomicUsize,
    state_renders: AtomicUsize,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, name: &str, yaml: &str) -> Self {
        self.stages.insert(name.to_string(), Ok(yaml.to_string()));
        self
    }

    pub fn with_failing_stage(mut self, name: &str, errors: &[&str]) -> Self {
        self.stages.insert(
            name.to_string(),
            Err(errors.iter().map(|e| e.to_string()).collect()),
        );
        self
    }

    pub fn with_state(mut self, name: &str, yaml: &str) -> Self {
        self.states.insert(name.to_string(), Ok(yaml.to_string()));
        self
    }

    pub fn with_failing_state(mut self, name: &str, node: &str, errors: &[&str]) -> Self {
        self.states.insert(
            name.to_string(),
            Err((
                node.to_string(),
                errors.iter().map(|e| e.to_string()).collect(),
            )),
        );
        self
    }

    /// Treat a dotted name as a package directory
    pub fn with_package(mut self, name: &str) -> Self {
        self.packages.insert(name.to_string());
        self
    }

    pub fn stage_renders(&self) -> usize {
        self.stage_renders.load(Ordering::SeqCst)
    }

    pub fn state_renders(&self) -> usize {
        self.state_renders.load(Ordering::SeqCst)
    }
}

fn parse(yaml: &str) -> Result<serde_yaml::Value, RenderFailure> {
    serde_yaml::from_str(yaml).map_err(|e| RenderFailure::message(e.to_string()))
}

#[async_trait]
impl Renderer for MockRenderer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn render_stage(&self, stage_name: &str) -> Result<Rendered, RenderFailure> {
        self.stage_renders.fetch_add(1, Ordering::SeqCst);
        match self.stages.get(stage_name) {
            Some(Ok(yaml)) => Ok(Rendered::new(parse(yaml)?).with_output(format!(
                "rendered {}",
                stage_name
            ))),
            Some(Err(errors)) => Err(RenderFailure::new(errors.clone())),
            None => Err(RenderFailure::message(format!(
                "could not determine path for {}",
                stage_name
            ))),
        }
    }

    async fn render_state(&self, state_name: &str, target: &str) -> Result<Rendered, RenderFailure> {
        self.state_renders.fetch_add(1, Ordering::SeqCst);
        match self.states.get(state_name) {
            Some(Ok(yaml)) => Ok(Rendered::new(parse(yaml)?).on_node(target)),
            Some(Err((node, errors))) => Err(RenderFailure::new(errors.clone()).on_node(node)),
            None => Err(RenderFailure::message(format!(
                "No matching sls found for '{}'",
                state_name
            ))
            .on_node(target)),
        }
    }

    fn is_package(&self, name: &str) -> bool {
        self.packages.contains(name)
    }
}

/// One recorded listener notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ParsingStarted(String),
    ParsingFinished {
        steps: Option<usize>,
        error: Option<String>,
    },
    StageStarted(String),
    StageFinished {
        stage: String,
        success: Option<bool>,
    },
    RunnerStarted(usize),
    RunnerFinished {
        order: usize,
        success: Option<bool>,
    },
    StateStarted {
        order: usize,
        targets: Vec<String>,
    },
    MinionFinished {
        order: usize,
        node: String,
    },
    StateResult {
        order: usize,
        node: String,
        name: String,
    },
    StateFinished {
        order: usize,
        success: Option<bool>,
    },
    Skipped(usize),
    DynamicStarted {
        job_id: String,
        name: String,
    },
    DynamicFinished {
        job_id: String,
        success: Option<bool>,
    },
}

/// Listener that records every notification it receives
#[derive(Debug, Default)]
pub struct CollectingListener {
    received: Mutex<Vec<Notification>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, notification: Notification) {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl StageListener for CollectingListener {
    fn stage_parsing_started(&self, stage_name: &str) {
        self.push(Notification::ParsingStarted(stage_name.to_string()));
    }

    fn stage_parsing_finished(
        &self,
        stage: Option<&CompiledStage>,
        _output: &str,
        error: Option<&CompileError>,
    ) {
        self.push(Notification::ParsingFinished {
            steps: stage.map(CompiledStage::total_steps),
            error: error.map(|e| e.to_string()),
        });
    }

    fn stage_started(&self, stage: &StageProgress) {
        self.push(Notification::StageStarted(stage.name.clone()));
    }

    fn stage_finished(&self, stage: &StageProgress) {
        self.push(Notification::StageFinished {
            stage: stage.name.clone(),
            success: stage.success(),
        });
    }

    fn step_runner_started(&self, step: &StepProgress) {
        self.push(Notification::RunnerStarted(step.step.order()));
    }

    fn step_runner_finished(&self, step: &StepProgress) {
        self.push(Notification::RunnerFinished {
            order: step.step.order(),
            success: step.success(),
        });
    }

    fn step_state_started(&self, step: &StepProgress) {
        self.push(Notification::StateStarted {
            order: step.step.order(),
            targets: step.target_names().into_iter().map(String::from).collect(),
        });
    }

    fn step_state_minion_finished(&self, step: &StepProgress, node: &str) {
        self.push(Notification::MinionFinished {
            order: step.step.order(),
            node: node.to_string(),
        });
    }

    fn step_state_result(&self, step: &StepProgress, event: &SubResult) {
        self.push(Notification::StateResult {
            order: step.step.order(),
            node: event.node.clone(),
            name: event.name.clone(),
        });
    }

    fn step_state_finished(&self, step: &StepProgress) {
        self.push(Notification::StateFinished {
            order: step.step.order(),
            success: step.success(),
        });
    }

    fn step_skipped(&self, step: &StepProgress) {
        self.push(Notification::Skipped(step.step.order()));
    }

    fn dynamic_step_started(&self, step: &DynamicStep) {
        self.push(Notification::DynamicStarted {
            job_id: step.job_id.clone(),
            name: step.name.clone(),
        });
    }

    fn dynamic_step_finished(&self, step: &DynamicStep) {
        self.push(Notification::DynamicFinished {
            job_id: step.job_id.clone(),
            success: step.success(),
        });
    }
}

/// A runner start, as the master announces it
pub fn runner_new(job_id: &str, function: &str, args: Vec<Value>) -> RawEvent {
    RawEvent::new(
        format!("salt/run/{}/new", job_id),
        json!({
            "jid": job_id,
            "fun": format!("runner.{}", function),
            "fun_args": args,
            "_stamp": "2024-01-01T00:00:00.000000",
        }),
    )
}

/// A runner return
pub fn runner_ret(job_id: &str, function: &str, success: bool) -> RawEvent {
    RawEvent::new(
        format!("salt/run/{}/ret", job_id),
        json!({
            "jid": job_id,
            "fun": format!("runner.{}", function),
            "fun_args": [],
            "success": success,
            "return": success,
            "_stamp": "2024-01-01T00:00:01.000000",
        }),
    )
}

/// A job dispatched to nodes
pub fn job_new(job_id: &str, function: &str, args: Vec<Value>, nodes: &[&str]) -> RawEvent {
    RawEvent::new(
        format!("salt/job/{}/new", job_id),
        json!({
            "jid": job_id,
            "fun": function,
            "arg": args,
            "minions": nodes,
            "tgt": nodes.join(","),
            "tgt_type": "list",
            "_stamp": "2024-01-01T00:00:00.000000",
        }),
    )
}

/// A `state.sls` job dispatched to nodes
pub fn state_new(job_id: &str, state: &str, nodes: &[&str]) -> RawEvent {
    job_new(
        job_id,
        "state.sls",
        vec![json!(state), json!({"__kwarg__": true, "queue": false})],
        nodes,
    )
}

/// One node's job return
pub fn job_ret(job_id: &str, node: &str, function: &str, success: bool, retcode: i64) -> RawEvent {
    RawEvent::new(
        format!("salt/job/{}/ret/{}", job_id, node),
        json!({
            "jid": job_id,
            "id": node,
            "fun": function,
            "fun_args": [],
            "success": success,
            "retcode": retcode,
            "return": {},
            "_stamp": "2024-01-01T00:00:02.000000",
        }),
    )
}

/// A fine-grained result inside a node's job
pub fn state_result(job_id: &str, node: &str, state_id: &str, name: &str, result: bool) -> RawEvent {
    RawEvent::new(
        format!("salt/state_result/{}", job_id),
        json!({
            "jid": job_id,
            "minion": node,
            "state_id": state_id,
            "name": name,
            "result": result,
        }),
    )
}
