//! Adapter interfaces for external systems.
//!
//! Two collaborators live outside this crate: the template renderer that
//! turns stage and state files into nested mappings, and the event bus.

pub mod bus;
pub mod salt;

use async_trait::async_trait;
use thiserror::Error;

pub use bus::{parse_event_line, CommandFeed, FeedError, ReplayFeed};
pub use salt::SaltRenderer;

/// A rendered document
#[derive(Debug, Clone)]
pub struct Rendered {
    /// Nested, order-preserving mapping
    pub document: serde_yaml::Value,

    /// Node the document was rendered on, for per-node renders
    pub node: Option<String>,

    /// Text the renderer printed while rendering
    pub output: String,
}

impl Rendered {
    /// Create a rendered document with no node context or output
    pub fn new(document: serde_yaml::Value) -> Self {
        Self {
            document,
            node: None,
            output: String::new(),
        }
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// A render that did not produce a document
#[derive(Debug, Clone, Error)]
#[error("{}", .errors.join("; "))]
pub struct RenderFailure {
    /// Node the failure happened on, for per-node renders
    pub node: Option<String>,

    /// Human-readable messages, one per reported problem
    pub errors: Vec<String>,
}

impl RenderFailure {
    pub fn new(errors: Vec<String>) -> Self {
        Self { node: None, errors }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(vec![message.into()])
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

/// Trait for the template renderer collaborator
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Human-readable renderer name
    fn name(&self) -> &str;

    /// Render a stage document by its dotted name
    async fn render_stage(&self, stage_name: &str) -> Result<Rendered, RenderFailure>;

    /// Render a per-node state file on one node matched by `target`
    async fn render_state(&self, state_name: &str, target: &str)
        -> Result<Rendered, RenderFailure>;

    /// Whether a dotted name refers to a package (a directory with an
    /// `init` document) rather than a single file
    fn is_package(&self, _name: &str) -> bool {
        false
    }
}
