//! Noise filter for bus traffic.
//!
//! The dispatcher emits plenty of housekeeping jobs (pillar refreshes,
//! job lookups, grain queries, renders) while a stage runs. None of them
//! are steps, so they are dropped before they reach the tracker.

use glob::Pattern;
use tracing::{debug, warn};

use crate::domain::TypedEvent;

/// Function patterns ignored on every event unless configured otherwise
pub fn default_patterns() -> Vec<String> {
    vec!["*pillar*".to_string(), "saltutil.find_job".to_string()]
}

/// Function patterns ignored on node jobs only. Runners with these names
/// are real steps.
pub fn default_job_patterns() -> Vec<String> {
    vec![
        "*grains*".to_string(),
        "deepsea.render_sls".to_string(),
        "slsutil.renderer".to_string(),
    ]
}

/// Drops dispatch and return events for housekeeping functions
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    patterns: Vec<Pattern>,
    job_patterns: Vec<Pattern>,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self::new(&default_patterns()).with_job_patterns(&default_job_patterns())
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "Ignoring invalid noise pattern");
                None
            }
        })
        .collect()
}

impl NoiseFilter {
    /// Compile a filter from glob patterns applied to every event.
    /// Invalid patterns are skipped.
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: compile_patterns(patterns),
            job_patterns: Vec::new(),
        }
    }

    /// Add patterns applied to node job dispatches and returns only
    pub fn with_job_patterns(mut self, patterns: &[String]) -> Self {
        self.job_patterns = compile_patterns(patterns);
        self
    }

    /// A filter that lets everything through
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
            job_patterns: Vec::new(),
        }
    }

    /// Whether a function name is housekeeping on any event
    pub fn is_noise_function(&self, function: &str) -> bool {
        let function = function.strip_prefix("runner.").unwrap_or(function);
        self.patterns.iter().any(|p| p.matches(function))
    }

    /// Whether a function name is housekeeping on a node job
    pub fn is_noise_job_function(&self, function: &str) -> bool {
        self.is_noise_function(function) || self.job_patterns.iter().any(|p| p.matches(function))
    }

    /// Whether an event should be dropped. Sub-results are never noise.
    pub fn is_noise(&self, event: &TypedEvent) -> bool {
        let noise = match event {
            TypedEvent::JobDispatched(e) => self.is_noise_job_function(&e.function),
            TypedEvent::JobCompleted(e) => self.is_noise_job_function(&e.function),
            TypedEvent::RunnerDispatched(e) => self.is_noise_function(&e.function),
            TypedEvent::RunnerCompleted(e) => self.is_noise_function(&e.function),
            TypedEvent::SubResultReported(_) => false,
        };
        if noise {
            let function = event.function().unwrap_or_default();
            debug!(function, kind = event.kind(), "Dropping housekeeping event");
        }
        noise
    }
}
