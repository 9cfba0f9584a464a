//! Merge engine for configuration fragments.
//!
//! Two modes are supported:
//! - **deep_merge**: mappings are merged recursively, incoming leaves win
//! - **override**: the incoming value replaces the existing one wholesale
//!
//! Arrays are always replaced, never concatenated. Every changed leaf is
//! reported as a [`Conflict`]; in strict mode any conflict is fatal.

use crate::error::{ConfError, ConfResult};
use crate::keypath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::info;

/// How a write combines with what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Recurse into mappings present on both sides (default).
    #[default]
    DeepMerge,
    /// Replace the existing value at the path.
    Override,
}

impl MergeMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deep_merge" | "deep-merge" | "merge" => Some(MergeMode::DeepMerge),
            "override" => Some(MergeMode::Override),
            _ => None,
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMode::DeepMerge => write!(f, "deep_merge"),
            MergeMode::Override => write!(f, "override"),
        }
    }
}

/// An existing value changed by a write.
///
/// A stored null counts as unset: writing over it is never a conflict, so
/// placeholders declared as `null` can be filled in strict mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub key: String,
    pub old: Value,
    pub new: Value,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "override {} = {} (formerly {})", self.key, self.new, self.old)
    }
}

/// Deep merge two JSON values, with `overlay` taking precedence over `base`.
///
/// - Objects are merged recursively: keys in overlay override keys in base
/// - Arrays, strings, numbers, booleans, nulls are replaced entirely
///
/// # Example
/// ```
/// use serde_json::json;
/// use conftree::merge::deep_merge;
///
/// let base = json!({
///     "server": { "port": 8080, "host": "localhost" },
///     "features": ["a", "b"]
/// });
/// let overlay = json!({
///     "server": { "port": 9000 },
///     "features": ["c"]
/// });
/// let result = deep_merge(base, overlay);
/// assert_eq!(result, json!({"server": {"port": 9000, "host": "localhost"}, "features": ["c"]}));
/// ```
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    let mut ignored = Vec::new();
    merge_into(&mut base, overlay, "", &mut ignored);
    base
}

/// Merge multiple values in order, with later values taking precedence.
///
/// Equivalent to folding `deep_merge` over the list.
pub fn deep_merge_all(values: impl IntoIterator<Item = Value>) -> Value {
    values.into_iter().fold(Value::Null, deep_merge)
}

/// Merge `incoming` into `dst` in place, recording changed leaves under `path`.
pub fn merge_into(dst: &mut Value, incoming: Value, path: &str, conflicts: &mut Vec<Conflict>) {
    match (dst, incoming) {
        // Both are objects: merge recursively
        (Value::Object(dst_map), Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                let child_path = keypath::join(path, &key);
                match dst_map.get_mut(&key) {
                    Some(existing) => merge_into(existing, value, &child_path, conflicts),
                    None => {
                        dst_map.insert(key, value);
                    }
                }
            }
        }
        // Any other case: incoming replaces dst entirely
        (dst, incoming) => {
            if !dst.is_null() && *dst != incoming {
                conflicts.push(Conflict {
                    key: path.to_string(),
                    old: dst.clone(),
                    new: incoming.clone(),
                });
            }
            *dst = incoming;
        }
    }
}

/// Applies fragments and single writes with a fixed mode and conflict policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Merger {
    pub mode: MergeMode,
    pub strict: bool,
}

impl Merger {
    pub fn new(mode: MergeMode, strict: bool) -> Self {
        Self { mode, strict }
    }

    /// Apply a whole fragment. Top-level keys are key-paths, so
    /// `{"k2.k4.k6": 1}` writes a nested leaf.
    ///
    /// An empty (null) fragment is a no-op; any other non-mapping is rejected.
    pub fn apply(&self, tree: &mut Value, fragment: Value, source: &str) -> ConfResult<Vec<Conflict>> {
        let map = match fragment {
            Value::Object(map) => map,
            Value::Null => return Ok(Vec::new()),
            other => {
                return Err(ConfError::invalid_fragment(
                    source,
                    format!("expected a mapping at the top level, found {}", other),
                ));
            }
        };

        self.guarded(tree, source, |staged| {
            let mut conflicts = Vec::new();
            for (key, value) in map {
                conflicts.extend(keypath::write(staged, &key, value, self.mode));
            }
            conflicts
        })
    }

    /// Write a single value at `path` using this merger's mode.
    pub fn set(&self, tree: &mut Value, path: &str, value: Value, source: &str) -> ConfResult<Vec<Conflict>> {
        self.set_with_mode(tree, path, value, self.mode, source)
    }

    /// Write a single value at `path` using an explicit mode.
    pub fn set_with_mode(
        &self,
        tree: &mut Value,
        path: &str,
        value: Value,
        mode: MergeMode,
        source: &str,
    ) -> ConfResult<Vec<Conflict>> {
        self.guarded(tree, source, |staged| keypath::write(staged, path, value, mode))
    }

    /// Run `write` and report its conflicts. In strict mode the write is staged
    /// on a copy so a rejected write leaves `tree` untouched.
    fn guarded<F>(&self, tree: &mut Value, source: &str, write: F) -> ConfResult<Vec<Conflict>>
    where
        F: FnOnce(&mut Value) -> Vec<Conflict>,
    {
        if self.strict {
            let mut staged = tree.clone();
            let conflicts = write(&mut staged);
            if let Some(conflict) = conflicts.first() {
                return Err(ConfError::strict_conflict(conflict).with_details(format!("from {}", source)));
            }
            *tree = staged;
            Ok(conflicts)
        } else {
            let conflicts = write(tree);
            for conflict in &conflicts {
                info!(source = %source, "    {}", conflict);
            }
            Ok(conflicts)
        }
    }
}
