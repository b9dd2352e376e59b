//! Configuration store
//!
//! Holds a global settings tree plus an ordered list of glob-scoped
//! overrides. Resolution for a path deep-merges the global tree with
//! every matching scope in registration order, so when two patterns
//! match the same path with conflicting leaves, the later registration
//! wins. This ordering is caller-visible.
//!
//! The same resolved tree backs both sides of the configuration
//! exchange: `workspace/didChangeConfiguration` pushes and
//! `workspace/configuration` pulls, so the server never observes a
//! divergent view.

use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Error types for configuration management
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid glob pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

type ChangeListener = Box<dyn Fn(&str) + Send + Sync>;

struct ScopeEntry {
    pattern: glob::Pattern,
    tree: Value,
}

#[derive(Default)]
struct Inner {
    global: Value,
    scopes: Vec<ScopeEntry>,
}

/// Global + scoped settings map
pub struct ConfigurationStore {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Default for ConfigurationStore {
    fn default() -> Self {
        Self::new(Value::Object(Default::default()))
    }
}

impl ConfigurationStore {
    pub fn new(global: Value) -> Self {
        Self {
            inner: Mutex::new(Inner {
                global,
                scopes: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Deep-merge a patch into the global tree.
    ///
    /// Maps merge recursively, leaf values (including arrays) replace
    /// wholesale, and explicit `null` entries unset their key.
    pub fn update_global(&self, patch: Value) {
        {
            let mut inner = self.inner.lock().unwrap();
            let mut global = std::mem::take(&mut inner.global);
            deep_merge(&mut global, patch);
            inner.global = global;
        }
        self.notify_listeners("update_global");
    }

    /// Register a scoped override for paths matching a glob pattern
    pub fn add_scope(&self, pattern: &str, tree: Value) -> Result<(), ConfigError> {
        let compiled = glob::Pattern::new(pattern).map_err(|source| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        self.inner.lock().unwrap().scopes.push(ScopeEntry {
            pattern: compiled,
            tree,
        });
        self.notify_listeners(&format!("add_scope:{pattern}"));
        Ok(())
    }

    /// Resolve the effective tree for an optional path and an optional
    /// dot-separated section like `python.analysis`
    pub fn resolve(&self, scope: Option<&Path>, section: Option<&str>) -> Value {
        let inner = self.inner.lock().unwrap();
        let mut resolved = inner.global.clone();

        if let Some(path) = scope {
            for entry in &inner.scopes {
                if entry.pattern.matches_path(path) {
                    deep_merge(&mut resolved, entry.tree.clone());
                }
            }
        }

        match section {
            Some(section) => section_of(&resolved, section),
            None => resolved,
        }
    }

    /// Register a callback invoked with a reason string on every change
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn notify_listeners(&self, reason: &str) {
        debug!("configuration changed: {}", reason);
        for listener in self.listeners.lock().unwrap().iter() {
            listener(reason);
        }
    }
}

/// Recursively merge `patch` into `base`
fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match value {
                    Value::Null => {
                        base_map.remove(&key);
                    }
                    value => match base_map.get_mut(&key) {
                        Some(existing) => deep_merge(existing, value),
                        None => {
                            base_map.insert(key, value);
                        }
                    },
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Walk a dot-separated section path into a tree
fn section_of(tree: &Value, section: &str) -> Value {
    let mut current = tree;
    for part in section.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_preserves_siblings() {
        let store = ConfigurationStore::new(json!({
            "python": { "analysis": { "typeCheckingMode": "basic" }, "venv": ".venv" }
        }));

        store.update_global(json!({
            "python": { "analysis": { "diagnosticMode": "workspace" } }
        }));

        let resolved = store.resolve(None, Some("python"));
        assert_eq!(resolved["analysis"]["typeCheckingMode"], "basic");
        assert_eq!(resolved["analysis"]["diagnosticMode"], "workspace");
        assert_eq!(resolved["venv"], ".venv");
    }

    #[test]
    fn test_deep_merge_later_wins_at_conflicting_leaves() {
        let store = ConfigurationStore::new(json!({ "a": { "b": 1, "c": 2 } }));
        store.update_global(json!({ "a": { "b": 10 } }));

        assert_eq!(store.resolve(None, Some("a.b")), json!(10));
        assert_eq!(store.resolve(None, Some("a.c")), json!(2));
    }

    #[test]
    fn test_deep_merge_arrays_replace_wholesale() {
        let store = ConfigurationStore::new(json!({ "paths": [1, 2, 3] }));
        store.update_global(json!({ "paths": [9] }));

        assert_eq!(store.resolve(None, Some("paths")), json!([9]));
    }

    #[test]
    fn test_null_unsets_key() {
        let store = ConfigurationStore::new(json!({ "a": { "b": 1, "c": 2 } }));
        store.update_global(json!({ "a": { "b": null } }));

        let resolved = store.resolve(None, Some("a"));
        assert_eq!(resolved, json!({ "c": 2 }));
    }

    #[test]
    fn test_merge_is_associative_on_disjoint_leaves() {
        let a = json!({ "x": { "p": 1 } });
        let b = json!({ "x": { "q": 2 } });
        let c = json!({ "y": 3 });

        let mut left = a.clone();
        deep_merge(&mut left, b.clone());
        deep_merge(&mut left, c.clone());

        let mut bc = b;
        deep_merge(&mut bc, c);
        let mut right = a;
        deep_merge(&mut right, bc);

        assert_eq!(left, right);
    }

    #[test]
    fn test_scopes_merge_in_registration_order() {
        let store = ConfigurationStore::new(json!({ "lint": { "enabled": false } }));
        store
            .add_scope("/repo/tests/**", json!({ "lint": { "enabled": true, "level": "strict" } }))
            .unwrap();
        store
            .add_scope("/repo/**", json!({ "lint": { "level": "loose" } }))
            .unwrap();

        // Both patterns match; the later registration wins at the
        // conflicting leaf
        let resolved = store.resolve(Some(Path::new("/repo/tests/test_a.py")), Some("lint"));
        assert_eq!(resolved["enabled"], true);
        assert_eq!(resolved["level"], "loose");

        // Only the broad pattern matches here
        let resolved = store.resolve(Some(Path::new("/repo/src/a.py")), Some("lint"));
        assert_eq!(resolved["enabled"], false);
        assert_eq!(resolved["level"], "loose");
    }

    #[test]
    fn test_resolve_without_scope_ignores_scoped_overrides() {
        let store = ConfigurationStore::new(json!({ "a": 1 }));
        store.add_scope("**", json!({ "a": 2 })).unwrap();

        assert_eq!(store.resolve(None, Some("a")), json!(1));
    }

    #[test]
    fn test_missing_section_is_null() {
        let store = ConfigurationStore::new(json!({ "python": {} }));
        assert_eq!(store.resolve(None, Some("python.analysis.mode")), Value::Null);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let store = ConfigurationStore::default();
        assert!(matches!(
            store.add_scope("[invalid", json!({})),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_listeners_receive_reasons() {
        use std::sync::{Arc, Mutex};

        let store = ConfigurationStore::default();
        let reasons = Arc::new(Mutex::new(Vec::new()));
        {
            let reasons = Arc::clone(&reasons);
            store.on_change(move |reason| {
                reasons.lock().unwrap().push(reason.to_string());
            });
        }

        store.update_global(json!({ "a": 1 }));
        store.add_scope("**/*.py", json!({})).unwrap();

        let reasons = reasons.lock().unwrap();
        assert_eq!(reasons.as_slice(), ["update_global", "add_scope:**/*.py"]);
    }
}
