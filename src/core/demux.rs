//! Event demultiplexer.
//!
//! Classifies raw bus messages by routing tag and decodes the ones this
//! system understands into [`TypedEvent`]s. Everything else is foreign
//! traffic and is dropped here.

use glob::{MatchOptions, Pattern, PatternError};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::domain::events::job_id_from_any;
use crate::domain::{
    JobCompleted, JobDispatched, RawEvent, RunnerCompleted, RunnerDispatched, SubResult,
    TypedEvent,
};

/// Default routing tag namespace of the dispatch system
pub const DEFAULT_TAG_PREFIX: &str = "salt";

/// Tag families, in the order they are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    JobNew,
    RunnerNew,
    JobReturn,
    RunnerReturn,
    SubResult,
}

impl EventClass {
    /// Tag pattern relative to the prefix
    fn suffix(&self) -> &'static str {
        match self {
            Self::JobNew => "job/*/new",
            Self::RunnerNew => "run/*/new",
            Self::JobReturn => "job/*/ret/*",
            Self::RunnerReturn => "run/*/ret",
            Self::SubResult => "state_result/*",
        }
    }

    const ALL: [EventClass; 5] = [
        Self::JobNew,
        Self::RunnerNew,
        Self::JobReturn,
        Self::RunnerReturn,
        Self::SubResult,
    ];
}

/// `*` never crosses a `/`, so the patterns cannot overlap
const TAG_MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Payload of a per-node job return
#[derive(Debug, Deserialize)]
struct JobReturnPayload {
    #[serde(deserialize_with = "job_id_from_any")]
    jid: String,

    #[serde(default)]
    id: Option<String>,

    fun: String,

    #[serde(default)]
    success: bool,

    #[serde(default)]
    retcode: Option<Value>,

    #[serde(rename = "return", default)]
    result: Value,
}

impl JobReturnPayload {
    /// A node succeeded only when it says so and its return code is zero
    fn succeeded(&self) -> bool {
        let retcode_ok = match &self.retcode {
            None | Some(Value::Null) => true,
            Some(code) => code.as_i64() == Some(0),
        };
        self.success && retcode_ok
    }
}

/// Tag-pattern classifier and decoder for raw bus events
#[derive(Debug, Clone)]
pub struct EventDemux {
    patterns: Vec<(EventClass, Pattern)>,
}

impl Default for EventDemux {
    fn default() -> Self {
        // The default prefix contains no glob metacharacters
        Self::build(DEFAULT_TAG_PREFIX)
    }
}

impl EventDemux {
    /// Create a demultiplexer for a tag namespace, e.g. `salt`
    pub fn new(prefix: &str) -> Result<Self, PatternError> {
        let prefix = Pattern::escape(prefix.trim_end_matches('/'));
        let patterns = EventClass::ALL
            .iter()
            .map(|class| Ok((*class, Pattern::new(&format!("{}/{}", prefix, class.suffix()))?)))
            .collect::<Result<Vec<_>, PatternError>>()?;
        Ok(Self { patterns })
    }

    fn build(prefix: &str) -> Self {
        let prefix = Pattern::escape(prefix);
        let patterns = EventClass::ALL
            .iter()
            .filter_map(|class| {
                Pattern::new(&format!("{}/{}", prefix, class.suffix()))
                    .ok()
                    .map(|p| (*class, p))
            })
            .collect();
        Self { patterns }
    }

    /// Which tag family a routing tag belongs to, if any
    pub fn classify(&self, tag: &str) -> Option<EventClass> {
        self.patterns
            .iter()
            .find(|(_, pattern)| pattern.matches_with(tag, TAG_MATCH))
            .map(|(class, _)| *class)
    }

    /// Decode a raw event, or `None` when it is foreign
    pub fn decode(&self, raw: &RawEvent) -> Option<TypedEvent> {
        let Some(class) = self.classify(&raw.tag) else {
            debug!(tag = %raw.tag, "Dropping foreign event");
            return None;
        };

        let decoded = match class {
            EventClass::JobNew => {
                JobDispatched::deserialize(&raw.data).map(TypedEvent::JobDispatched)
            }
            EventClass::RunnerNew => {
                RunnerDispatched::deserialize(&raw.data).map(TypedEvent::RunnerDispatched)
            }
            EventClass::JobReturn => JobReturnPayload::deserialize(&raw.data).map(|payload| {
                let node = payload
                    .id
                    .clone()
                    .unwrap_or_else(|| last_segment(&raw.tag).to_string());
                TypedEvent::JobCompleted(JobCompleted {
                    success: payload.succeeded(),
                    job_id: payload.jid,
                    node,
                    function: payload.fun,
                    result: payload.result,
                })
            }),
            EventClass::RunnerReturn => {
                RunnerCompleted::deserialize(&raw.data).map(TypedEvent::RunnerCompleted)
            }
            EventClass::SubResult => {
                SubResult::deserialize(&raw.data).map(TypedEvent::SubResultReported)
            }
        };

        match decoded {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(tag = %raw.tag, class = ?class, error = %e, "Dropping undecodable event");
                None
            }
        }
    }
}

fn last_segment(tag: &str) -> &str {
    tag.rsplit('/').next().unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_fixed_order() {
        let demux = EventDemux::default();

        assert_eq!(demux.classify("salt/job/1/new"), Some(EventClass::JobNew));
        assert_eq!(demux.classify("salt/run/1/new"), Some(EventClass::RunnerNew));
        assert_eq!(demux.classify("salt/job/1/ret/node1"), Some(EventClass::JobReturn));
        assert_eq!(demux.classify("salt/run/1/ret"), Some(EventClass::RunnerReturn));
        assert_eq!(
            demux.classify("salt/state_result/1"),
            Some(EventClass::SubResult)
        );
    }

    #[test]
    fn test_wildcard_does_not_cross_segments() {
        let demux = EventDemux::default();

        assert_eq!(demux.classify("salt/job/1/2/new"), None);
        assert_eq!(demux.classify("salt/run/1/ret/extra"), None);
        assert_eq!(demux.classify("salt/auth"), None);
        assert_eq!(demux.classify("minion_start"), None);
    }

    #[test]
    fn test_custom_prefix_is_literal() {
        let demux = EventDemux::new("lab[1]").unwrap();

        assert_eq!(demux.classify("lab[1]/run/7/new"), Some(EventClass::RunnerNew));
        assert_eq!(demux.classify("lab1/run/7/new"), None);
    }

    #[test]
    fn test_return_success_requires_zero_retcode() {
        let demux = EventDemux::default();
        let raw = RawEvent::new(
            "salt/job/1/ret/node1",
            json!({"jid": "1", "id": "node1", "fun": "state.sls", "success": true, "retcode": 2}),
        );

        let Some(TypedEvent::JobCompleted(event)) = demux.decode(&raw) else {
            panic!("expected job completion");
        };
        assert!(!event.success);
        assert_eq!(event.node, "node1");
    }

    #[test]
    fn test_return_node_falls_back_to_tag() {
        let demux = EventDemux::default();
        let raw = RawEvent::new(
            "salt/job/1/ret/node9",
            json!({"jid": "1", "fun": "cmd.run", "success": true}),
        );

        let Some(TypedEvent::JobCompleted(event)) = demux.decode(&raw) else {
            panic!("expected job completion");
        };
        assert!(event.success);
        assert_eq!(event.node, "node9");
    }

    #[test]
    fn test_missing_fields_dropped() {
        let demux = EventDemux::default();
        let raw = RawEvent::new("salt/job/1/new", json!({"minions": ["a"]}));

        assert!(demux.decode(&raw).is_none());
    }
}
