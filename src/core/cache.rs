//! Render cache.
//!
//! Rendering shells out and can take seconds, and the same state file is
//! often referenced by several steps. The cache is created by the caller
//! and handed to the compiler, so its lifetime and invalidation stay
//! under the caller's control.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::adapters::Rendered;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    document: String,
    target: Option<String>,
}

/// Memoized renders keyed by document name and optional target
#[derive(Debug, Default)]
pub struct RenderCache {
    entries: Mutex<HashMap<CacheKey, Rendered>>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(document: &str, target: Option<&str>) -> CacheKey {
        CacheKey {
            document: document.to_string(),
            target: target.map(String::from),
        }
    }

    pub fn get(&self, document: &str, target: Option<&str>) -> Option<Rendered> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&Self::key(document, target)).cloned()
    }

    pub fn insert(&self, document: &str, target: Option<&str>, rendered: Rendered) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(Self::key(document, target), rendered);
    }

    /// Drop every render of a document, whatever the target.
    /// Returns how many entries were removed.
    pub fn invalidate(&self, document: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| key.document != document);
        let removed = before - entries.len();
        debug!(document, removed, "Invalidated cached renders");
        removed
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    #[test]
    fn test_targets_cached_separately() {
        let cache = RenderCache::new();
        cache.insert("ceph.mon", Some("mon*"), Rendered::new(Value::Null).on_node("mon1"));
        cache.insert("ceph.mon", None, Rendered::new(Value::Null));

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get("ceph.mon", Some("mon*")).unwrap().node.as_deref(),
            Some("mon1")
        );
        assert!(cache.get("ceph.mon", Some("osd*")).is_none());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = RenderCache::new();
        cache.insert("a", Some("x"), Rendered::new(Value::Null));
        cache.insert("a", Some("y"), Rendered::new(Value::Null));
        cache.insert("b", None, Rendered::new(Value::Null));

        assert_eq!(cache.invalidate("a"), 2);
        assert_eq!(cache.invalidate("a"), 0);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
