//! Key-path addressing over nested configuration mappings.
//!
//! A key-path is a dot-separated string (`neural_net.layer_sizes`). The empty
//! path addresses the root. Only mappings are traversed; sequences are leaves.

use crate::merge::{self, Conflict, MergeMode};
use serde_json::{Map, Value};

/// Segment separator.
pub const SEPARATOR: char = '.';

/// Trailing marker on the final segment that forces override mode for one write.
pub const FORCE_OVERRIDE: char = '=';

/// Reversible stand-in for `.` where a path must be a plain identifier
/// (environment variable names, some argument parsers).
pub const DOT_ESCAPE: &str = "__";

/// Join a parent path and a child key.
pub fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}{}{}", parent, SEPARATOR, key)
    }
}

/// Split a path into segments. The root path has no segments.
pub fn split(path: &str) -> Vec<&str> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split(SEPARATOR).collect()
    }
}

/// Strip `count` trailing segments. Returns `None` when that walks above the root.
pub fn strip_trailing(path: &str, count: usize) -> Option<String> {
    let segments = split(path);
    let keep = segments.len().checked_sub(count)?;
    Some(segments[..keep].join("."))
}

/// Whether `path` addresses an existing node. Never fails.
pub fn exists(tree: &Value, path: &str) -> bool {
    read(tree, path).is_some()
}

/// Read the node at `path`. `None` means absent; a stored null is `Some(Value::Null)`.
pub fn read<'a>(tree: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = tree;
    for segment in split(path) {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

/// Write `value` at `path`, creating intermediate mappings as needed.
///
/// The terminal assignment follows `mode`, except that a final segment
/// ending in [`FORCE_OVERRIDE`] is always written in override mode.
/// Returns every existing value that changed.
pub fn write(tree: &mut Value, path: &str, value: Value, mode: MergeMode) -> Vec<Conflict> {
    let (path, mode) = match path.strip_suffix(FORCE_OVERRIDE) {
        Some(stripped) => (stripped, MergeMode::Override),
        None => (path, mode),
    };
    let mut conflicts = Vec::new();

    let segments = split(path);
    let Some((last, parents)) = segments.split_last() else {
        assign(tree, value, "", mode, &mut conflicts);
        return conflicts;
    };

    let mut node = tree;
    let mut walked = String::new();
    for segment in parents {
        node = ensure_object(node, &walked, &mut conflicts)
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        walked = join(&walked, segment);
    }

    let key = join(&walked, last);
    let map = ensure_object(node, &walked, &mut conflicts);
    match map.get_mut(*last) {
        Some(existing) => assign(existing, value, &key, mode, &mut conflicts),
        None => {
            map.insert(last.to_string(), value);
        }
    }
    conflicts
}

fn assign(
    existing: &mut Value,
    value: Value,
    key: &str,
    mode: MergeMode,
    conflicts: &mut Vec<Conflict>,
) {
    match mode {
        MergeMode::Override => {
            if !existing.is_null() && *existing != value {
                conflicts.push(Conflict {
                    key: key.to_string(),
                    old: existing.clone(),
                    new: value.clone(),
                });
            }
            *existing = value;
        }
        MergeMode::DeepMerge => merge::merge_into(existing, value, key, conflicts),
    }
}

/// Turn `node` into a mapping if it is not one already.
fn ensure_object<'a>(
    node: &'a mut Value,
    path: &str,
    conflicts: &mut Vec<Conflict>,
) -> &'a mut Map<String, Value> {
    if !node.is_object() {
        let old = std::mem::replace(node, Value::Object(Map::new()));
        if !old.is_null() {
            conflicts.push(Conflict {
                key: path.to_string(),
                old,
                new: Value::Object(Map::new()),
            });
        }
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with a mapping"),
    }
}

/// Deepest existing mapping along `path` and the keys it holds.
pub fn nearest_ancestor(tree: &Value, path: &str) -> (String, Vec<String>) {
    let mut node = tree;
    let mut walked = String::new();
    for segment in split(path) {
        match node.as_object().and_then(|map| map.get(segment)) {
            Some(child) if child.is_object() => {
                node = child;
                walked = join(&walked, segment);
            }
            _ => break,
        }
    }
    let keys = node
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    (walked, keys)
}

/// All leaves as `(path, value)` pairs in tree order. Empty mappings yield nothing.
pub fn flatten(tree: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into(tree, "", &mut out);
    out
}

fn flatten_into(node: &Value, prefix: &str, out: &mut Vec<(String, Value)>) {
    match node {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, &join(prefix, key), out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

/// Copy of `tree` without the nodes addressed by `except_keys`.
pub fn strip_keys<S: AsRef<str>>(tree: &Value, except_keys: &[S]) -> Value {
    strip_keys_at(tree, except_keys, "")
}

fn strip_keys_at<S: AsRef<str>>(node: &Value, except_keys: &[S], prefix: &str) -> Value {
    let Value::Object(map) = node else {
        return node.clone();
    };
    let mut out = Map::new();
    for (key, child) in map {
        let path = join(prefix, key);
        if except_keys.iter().any(|k| k.as_ref() == path) {
            continue;
        }
        out.insert(key.clone(), strip_keys_at(child, except_keys, &path));
    }
    Value::Object(out)
}

/// Copy of `tree` restricted to the nodes addressed by `limit_keys` and their ancestors.
pub fn with_keys<S: AsRef<str>>(tree: &Value, limit_keys: &[S]) -> Value {
    with_keys_at(tree, limit_keys, "").unwrap_or_else(|| Value::Object(Map::new()))
}

fn with_keys_at<S: AsRef<str>>(node: &Value, limit_keys: &[S], prefix: &str) -> Option<Value> {
    let map = node.as_object()?;
    let mut out = Map::new();
    for (key, child) in map {
        let path = join(prefix, key);
        if limit_keys.iter().any(|k| k.as_ref() == path) {
            out.insert(key.clone(), child.clone());
        } else if let Some(nested) = with_keys_at(child, limit_keys, &path) {
            out.insert(key.clone(), nested);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Replace `.` with [`DOT_ESCAPE`].
pub fn escape(path: &str) -> String {
    path.replace(SEPARATOR, DOT_ESCAPE)
}

/// Inverse of [`escape`].
pub fn unescape(name: &str) -> String {
    name.replace(DOT_ESCAPE, ".")
}
