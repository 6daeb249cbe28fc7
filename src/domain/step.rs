//! Compiled stage structure.
//!
//! Steps are built once by the stage compiler and never mutated
//! afterwards. Dependency edges point directly at earlier steps.

use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::Value;

/// How a step was declared in the stage document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationKind {
    /// A master-side runner
    Runner,

    /// A per-node state file application
    State,

    /// A direct remote-procedure call
    Function,
}

impl DeclarationKind {
    /// Classify a declaration marker. Accepts both the neutral and the
    /// native engine spelling.
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "orchestrate-runner" | "salt.runner" => Some(Self::Runner),
            "orchestrate-state" | "salt.state" => Some(Self::State),
            "orchestrate-function" | "salt.function" => Some(Self::Function),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Runner => "Runner",
            Self::State => "State",
            Self::Function => "Function",
        }
    }
}

/// One declared unit of a stage
#[derive(Debug, Serialize)]
pub struct Step {
    /// Zero-based declaration index
    pub index: usize,

    /// Human description (the declaration's key)
    pub description: String,

    /// Marker the step was declared with
    pub declared_as: DeclarationKind,

    pub kind: StepKind,

    /// Steps that must succeed for this one to run
    #[serde(serialize_with = "serialize_dep_orders")]
    pub on_success_deps: Vec<Arc<Step>>,

    /// Steps that must fail for this one to run
    #[serde(serialize_with = "serialize_dep_orders")]
    pub on_failure_deps: Vec<Arc<Step>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum StepKind {
    /// Executes once on the master, no target set
    Runner(RunnerStep),

    /// Executes once per resolved target node
    Targeted(TargetedStep),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStep {
    pub function: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetedStep {
    /// State file (or function) applied on each node
    pub reference_name: String,

    /// Selector resolved to nodes by the dispatcher, never by us
    pub declared_target_selector: String,

    pub args: Value,

    /// Per-node calls composing this step. Empty when state steps are hidden
    /// or the step is a plain function call.
    pub sub_steps: Vec<SubStep>,
}

impl Step {
    /// One-based position used for display and dependency listings
    pub fn order(&self) -> usize {
        self.index + 1
    }

    /// Name a dispatch event must carry to start this step
    pub fn match_name(&self) -> &str {
        match &self.kind {
            StepKind::Runner(r) => &r.function,
            StepKind::Targeted(t) => &t.reference_name,
        }
    }

    pub fn is_targeted(&self) -> bool {
        matches!(self.kind, StepKind::Targeted(_))
    }

    pub fn sub_steps(&self) -> &[SubStep] {
        match &self.kind {
            StepKind::Runner(_) => &[],
            StepKind::Targeted(t) => &t.sub_steps,
        }
    }

    pub fn target_selector(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Runner(_) => None,
            StepKind::Targeted(t) => Some(&t.declared_target_selector),
        }
    }

    /// Success dependency positions, ascending
    pub fn success_dep_orders(&self) -> Vec<usize> {
        sorted_orders(&self.on_success_deps)
    }

    /// Failure dependency positions, ascending
    pub fn failure_dep_orders(&self) -> Vec<usize> {
        sorted_orders(&self.on_failure_deps)
    }
}

fn sorted_orders(deps: &[Arc<Step>]) -> Vec<usize> {
    let mut orders: Vec<usize> = deps.iter().map(|d| d.order()).collect();
    orders.sort_unstable();
    orders.dedup();
    orders
}

fn serialize_dep_orders<S>(deps: &[Arc<Step>], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    sorted_orders(deps).serialize(serializer)
}

/// Canonical shape of a per-node call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubStepCall {
    /// A state function declared in the node's state file
    StateCall,

    /// A direct execution: module invocation, command, file placement or
    /// package install
    ExecutionCall,
}

/// How the stanza names what it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StanzaKind {
    /// `module.run`: the stanza wraps an execution-module function
    ModuleRun,

    /// A built-in state function keyed by the stanza itself
    BuiltIn,
}

/// One per-node function call inside a targeted step
#[derive(Debug, Clone, Serialize)]
pub struct SubStep {
    pub description: String,
    pub function: String,
    pub call: SubStepCall,
    pub stanza: StanzaKind,

    /// Merged stanza arguments
    pub args: serde_json::Map<String, Value>,

    /// Whether the call emits a sub-result event while running
    pub visible: bool,
}

impl SubStep {
    /// Name a sub-result event is matched against
    pub fn match_name(&self) -> &str {
        match self.stanza {
            StanzaKind::ModuleRun => &self.function,
            StanzaKind::BuiltIn => self
                .args
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&self.description),
        }
    }

    /// Condensed label, e.g. `pkg.installed(ceph, ceph-mon)`
    pub fn pretty(&self) -> String {
        let keys: &[&str] = match self.stanza {
            StanzaKind::ModuleRun => &["pkg", "pkgs", "kwargs"],
            StanzaKind::BuiltIn => &["name", "pkg", "pkgs"],
        };

        let parts: Vec<String> = keys
            .iter()
            .filter_map(|k| self.args.get(*k))
            .flat_map(flatten_arg)
            .collect();

        if parts.is_empty() {
            match self.stanza {
                StanzaKind::ModuleRun => format!("{}: {}", self.description, self.function),
                StanzaKind::BuiltIn => format!("{}({})", self.function, self.description),
            }
        } else {
            format!("{}({})", self.function, parts.join(", "))
        }
    }

    /// Whether a sub-result reported under `name` and `component_id`
    /// belongs to this call
    pub fn matches_result(&self, name: &str, component_id: &str) -> bool {
        self.match_name() == name || (!component_id.is_empty() && self.description == component_id)
    }
}

fn flatten_arg(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) if s.is_empty() => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(flatten_arg).collect(),
        Value::Object(map) => map.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
        other => vec![other.to_string()],
    }
}

/// Result of compiling a stage document
#[derive(Debug, Clone, Serialize)]
pub struct CompiledStage {
    pub name: String,
    pub steps: Vec<Arc<Step>>,
}

impl CompiledStage {
    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    /// Look a step up by its one-based position
    pub fn step(&self, order: usize) -> Option<&Arc<Step>> {
        order.checked_sub(1).and_then(|i| self.steps.get(i))
    }
}
