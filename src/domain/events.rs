//! Event types observed on the job-dispatch bus.
//!
//! The bus delivers loosely-shaped [`RawEvent`]s. Only the demultiplexer
//! looks at those; everything downstream works on the closed
//! [`TypedEvent`] set.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A bus message exactly as delivered: a routing tag and an open payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Routing tag, e.g. `salt/job/20240101120000000000/new`
    pub tag: String,

    /// Untyped payload
    #[serde(default)]
    pub data: Value,
}

impl RawEvent {
    /// Create a raw event from a tag and payload
    pub fn new(tag: impl Into<String>, data: Value) -> Self {
        Self {
            tag: tag.into(),
            data,
        }
    }
}

/// An event decoded from the bus that this system understands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedEvent {
    /// An operation was sent to a set of nodes
    JobDispatched(JobDispatched),

    /// One node finished one dispatched operation
    JobCompleted(JobCompleted),

    /// A master-only operation started
    RunnerDispatched(RunnerDispatched),

    /// A master-only operation finished
    RunnerCompleted(RunnerCompleted),

    /// A fine-grained result nested inside a per-node job
    SubResultReported(SubResult),
}

impl TypedEvent {
    /// Job id carried by every variant
    pub fn job_id(&self) -> &str {
        match self {
            Self::JobDispatched(e) => &e.job_id,
            Self::JobCompleted(e) => &e.job_id,
            Self::RunnerDispatched(e) => &e.job_id,
            Self::RunnerCompleted(e) => &e.job_id,
            Self::SubResultReported(e) => &e.job_id,
        }
    }

    /// Function name, if the variant carries one
    pub fn function(&self) -> Option<&str> {
        match self {
            Self::JobDispatched(e) => Some(&e.function),
            Self::JobCompleted(e) => Some(&e.function),
            Self::RunnerDispatched(e) => Some(&e.function),
            Self::RunnerCompleted(e) => Some(&e.function),
            Self::SubResultReported(_) => None,
        }
    }

    /// Short variant label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobDispatched(_) => "job_dispatched",
            Self::JobCompleted(_) => "job_completed",
            Self::RunnerDispatched(_) => "runner_dispatched",
            Self::RunnerCompleted(_) => "runner_completed",
            Self::SubResultReported(_) => "sub_result_reported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDispatched {
    #[serde(rename = "jid", deserialize_with = "job_id_from_any")]
    pub job_id: String,

    #[serde(rename = "fun")]
    pub function: String,

    #[serde(rename = "arg", alias = "fun_args", default)]
    pub args: Vec<Value>,

    #[serde(rename = "minions", default)]
    pub target_nodes: Vec<String>,
}

impl JobDispatched {
    /// Name used to match this dispatch against a declared step.
    ///
    /// A `state.sls` call is named after the state it applies (its first
    /// positional argument); any other call is named after its function.
    pub fn step_name(&self) -> &str {
        if self.function == "state.sls" {
            if let Some(Value::String(state)) = self.args.first() {
                return state;
            }
        }
        &self.function
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobCompleted {
    pub job_id: String,
    pub node: String,
    pub function: String,

    /// Reported success combined with a zero return code
    pub success: bool,

    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerDispatched {
    #[serde(rename = "jid", deserialize_with = "job_id_from_any")]
    pub job_id: String,

    #[serde(rename = "fun")]
    pub function: String,

    #[serde(rename = "fun_args", alias = "arg", default)]
    pub args: Vec<Value>,
}

impl RunnerDispatched {
    /// Runner function without the bus's `runner.` namespace
    pub fn step_name(&self) -> &str {
        strip_runner_prefix(&self.function)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerCompleted {
    #[serde(rename = "jid", deserialize_with = "job_id_from_any")]
    pub job_id: String,

    #[serde(rename = "fun")]
    pub function: String,

    #[serde(default)]
    pub success: bool,

    #[serde(rename = "return", default)]
    pub result: Value,
}

/// Result of one item inside a per-node job. Detail only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResult {
    #[serde(rename = "jid", deserialize_with = "job_id_from_any")]
    pub job_id: String,

    #[serde(rename = "id", alias = "minion")]
    pub node: String,

    #[serde(rename = "state_id", alias = "__id__", default)]
    pub component_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub result: bool,
}

pub(crate) fn strip_runner_prefix(function: &str) -> &str {
    function.strip_prefix("runner.").unwrap_or(function)
}

/// Job ids are strings on the wire, but some producers emit bare numbers.
pub(crate) fn job_id_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "job id must be a string or number, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_sls_named_after_state() {
        let event = JobDispatched {
            job_id: "1".to_string(),
            function: "state.sls".to_string(),
            args: vec![json!("ceph.mon"), json!({"__kwarg__": true, "queue": false})],
            target_nodes: vec!["mon1".to_string()],
        };

        assert_eq!(event.step_name(), "ceph.mon");
    }

    #[test]
    fn test_plain_call_named_after_function() {
        let event = JobDispatched {
            job_id: "1".to_string(),
            function: "cmd.run".to_string(),
            args: vec![json!("ceph.mon")],
            target_nodes: vec![],
        };

        assert_eq!(event.step_name(), "cmd.run");
    }

    #[test]
    fn test_runner_prefix_stripped() {
        let event = RunnerDispatched {
            job_id: "1".to_string(),
            function: "runner.ready.check".to_string(),
            args: vec![],
        };

        assert_eq!(event.step_name(), "ready.check");
        assert_eq!(strip_runner_prefix("ready.check"), "ready.check");
    }

    #[test]
    fn test_numeric_job_id_accepted() {
        let event: RunnerCompleted = serde_json::from_value(json!({
            "jid": 20240101,
            "fun": "runner.jobs.active",
            "success": true
        }))
        .unwrap();

        assert_eq!(event.job_id, "20240101");
        assert_eq!(event.result, Value::Null);
    }
}
