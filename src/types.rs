//! Type registry: expected primitive kinds per key-path.
//!
//! Declarations come from explicit fragments and `<stem>_types.yaml` side
//! files. They are deep-merged into one [`TypeTree`] whose leaves are kind
//! names (`int`, `float`, `str`, `list`, `bool`, `none`).

use crate::error::{ConfError, ConfResult};
use crate::keypath;
use crate::merge::MergeMode;
use crate::resolve;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;
use tracing::debug;

/// Suffix appended to a file stem to find its type declarations.
pub const TYPES_SUFFIX: &str = "_types";

/// Primitive kinds a leaf may be declared as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Int,
    Float,
    Str,
    List,
    Bool,
    #[serde(rename = "none")]
    Null,
}

impl TypeKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "int" | "integer" => Some(TypeKind::Int),
            "float" => Some(TypeKind::Float),
            "str" | "string" => Some(TypeKind::Str),
            "list" => Some(TypeKind::List),
            "bool" | "boolean" => Some(TypeKind::Bool),
            "none" | "null" => Some(TypeKind::Null),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Int => "int",
            TypeKind::Float => "float",
            TypeKind::Str => "str",
            TypeKind::List => "list",
            TypeKind::Bool => "bool",
            TypeKind::Null => "none",
        }
    }

    /// Runtime kind of a stored value. Mappings have no kind.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(TypeKind::Null),
            Value::Bool(_) => Some(TypeKind::Bool),
            Value::Number(n) if n.is_f64() => Some(TypeKind::Float),
            Value::Number(_) => Some(TypeKind::Int),
            Value::String(_) => Some(TypeKind::Str),
            Value::Array(_) => Some(TypeKind::List),
            Value::Object(_) => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        Self::of(value) == Some(*self)
    }

    /// Convert a command-line or environment string into this kind.
    pub fn coerce(&self, raw: &str) -> Result<Value, String> {
        let trimmed = raw.trim();
        match self {
            TypeKind::Str => Ok(Value::String(raw.to_string())),
            TypeKind::Int => trimmed
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("'{}' is not an int: {}", raw, e)),
            TypeKind::Float => trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{}' is not a float", raw)),
            TypeKind::Bool => match trimmed.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a bool", raw)),
            },
            TypeKind::List => match serde_yaml::from_str::<Value>(trimmed) {
                Ok(list @ Value::Array(_)) => Ok(list),
                _ => Err(format!("'{}' is not a list (use [a, b, ...])", raw)),
            },
            TypeKind::Null => match trimmed.to_lowercase().as_str() {
                "" | "~" | "null" | "none" => Ok(Value::Null),
                _ => Err(format!("'{}' is not none", raw)),
            },
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Side-tree of declared kinds, addressed by the same key-paths as the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeTree {
    root: Value,
}

impl Default for TypeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTree {
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }

    /// Build a tree from one declaration fragment.
    pub fn from_value(declared: Value) -> ConfResult<Self> {
        let mut tree = Self::new();
        tree.merge_at("", declared)?;
        Ok(tree)
    }

    /// Deep-merge declarations rooted at `path`.
    ///
    /// Every declared leaf must name a known kind; names are normalized
    /// (`integer` is stored as `int`). A null fragment is ignored.
    pub fn merge_at(&mut self, path: &str, declared: Value) -> ConfResult<()> {
        if declared.is_null() {
            return Ok(());
        }
        if path.is_empty() && !declared.is_object() {
            return Err(ConfError::invalid_type_kind("", &declared.to_string())
                .with_details("root type declarations must be a mapping"));
        }
        let normalized = normalize(declared, path)?;
        keypath::write(&mut self.root, path, normalized, MergeMode::DeepMerge);
        Ok(())
    }

    /// Declared kind of the leaf at `path`.
    pub fn get(&self, path: &str) -> Option<TypeKind> {
        keypath::read(&self.root, path)?
            .as_str()
            .and_then(TypeKind::from_str)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.as_object().is_none_or(|map| map.is_empty())
    }

    /// All declared leaves in tree order.
    pub fn leaves(&self) -> Vec<(String, TypeKind)> {
        keypath::flatten(&self.root)
            .into_iter()
            .filter_map(|(path, kind)| Some((path, kind.as_str().and_then(TypeKind::from_str)?)))
            .collect()
    }

    /// Check every declared leaf against `tree`.
    ///
    /// Leaves absent from `tree` and reference leaves (`${..}`, `@..`,
    /// `_callable` nodes) are skipped.
    pub fn validate(&self, tree: &Value) -> ConfResult<()> {
        for (path, kind) in self.leaves() {
            let Some(value) = keypath::read(tree, &path) else {
                debug!(key = %path, "Declared type has no configuration value");
                continue;
            };
            if resolve::is_reference(value) {
                continue;
            }
            if !kind.matches(value) {
                let actual = TypeKind::of(value).map_or("mapping", |k| k.as_str());
                return Err(ConfError::type_mismatch(&path, kind.as_str(), actual, value));
            }
        }
        Ok(())
    }

    /// Declare the runtime kind of every leaf in `tree` that has no declaration yet.
    ///
    /// Returns the number of entries added.
    pub fn fill_missing(&mut self, tree: &Value) -> ConfResult<usize> {
        let mut added = 0;
        self.fill_at(tree, "", &mut added)?;
        if added > 0 {
            debug!(added, "Inferred missing type declarations");
        }
        Ok(added)
    }

    fn fill_at(&mut self, node: &Value, path: &str, added: &mut usize) -> ConfResult<()> {
        match node {
            Value::Object(map) => {
                // A leaf declaration covering a whole mapping stops the descent.
                if !path.is_empty()
                    && keypath::read(&self.root, path).is_some_and(|declared| !declared.is_object())
                {
                    return Ok(());
                }
                for (key, child) in map {
                    self.fill_at(child, &keypath::join(path, key), added)?;
                }
                Ok(())
            }
            leaf => {
                if keypath::exists(&self.root, path) {
                    return Ok(());
                }
                let kind = TypeKind::of(leaf)
                    .ok_or_else(|| ConfError::invalid_type_kind(path, &leaf.to_string()))?;
                keypath::write(
                    &mut self.root,
                    path,
                    Value::String(kind.as_str().to_string()),
                    MergeMode::Override,
                );
                *added += 1;
                Ok(())
            }
        }
    }
}

fn normalize(declared: Value, path: &str) -> ConfResult<Value> {
    match declared {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                let child_path = keypath::join(path, &key);
                out.insert(key, normalize(child, &child_path)?);
            }
            Ok(Value::Object(out))
        }
        Value::String(name) => TypeKind::from_str(&name)
            .map(|kind| Value::String(kind.as_str().to_string()))
            .ok_or_else(|| ConfError::invalid_type_kind(path, &name)),
        other => Err(ConfError::invalid_type_kind(path, &other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn batch_conf() -> Value {
        json!({
            "batch_size": 32,
            "samples_per_batch": {
                "labelled": 16,
                "gen": {"generator1": 8, "generator2": 8},
            },
        })
    }

    #[test]
    fn test_kind_names() {
        for kind in [
            TypeKind::Int,
            TypeKind::Float,
            TypeKind::Str,
            TypeKind::List,
            TypeKind::Bool,
            TypeKind::Null,
        ] {
            assert_eq!(TypeKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(TypeKind::from_str("Integer"), Some(TypeKind::Int));
        assert_eq!(TypeKind::from_str("dict"), None);
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(TypeKind::of(&json!(3)), Some(TypeKind::Int));
        assert_eq!(TypeKind::of(&json!(3.5)), Some(TypeKind::Float));
        assert_eq!(TypeKind::of(&json!("3")), Some(TypeKind::Str));
        assert_eq!(TypeKind::of(&json!([3])), Some(TypeKind::List));
        assert_eq!(TypeKind::of(&json!(true)), Some(TypeKind::Bool));
        assert_eq!(TypeKind::of(&json!(null)), Some(TypeKind::Null));
        assert_eq!(TypeKind::of(&json!({})), None);
    }

    #[test]
    fn test_merge_declarations() {
        let mut types = TypeTree::from_value(json!({"batch_size": "int"})).unwrap();
        types
            .merge_at(
                "",
                json!({"samples_per_batch": {"labelled": "int", "gen": {"generator1": "int"}}}),
            )
            .unwrap();
        types
            .merge_at("samples_per_batch.gen", json!({"generator2": "integer"}))
            .unwrap();

        assert_eq!(
            types.as_value(),
            &json!({
                "batch_size": "int",
                "samples_per_batch": {
                    "labelled": "int",
                    "gen": {"generator1": "int", "generator2": "int"},
                },
            })
        );
        assert_eq!(types.get("samples_per_batch.gen.generator2"), Some(TypeKind::Int));
        assert_eq!(types.get("samples_per_batch.gen"), None);
    }

    #[test]
    fn test_scalar_declaration_at_path() {
        let mut types = TypeTree::new();
        types.merge_at("neural_net.k1.k3.k4", json!("int")).unwrap();
        assert_eq!(types.as_value(), &json!({"neural_net": {"k1": {"k3": {"k4": "int"}}}}));
    }

    #[test]
    fn test_invalid_kind_is_rejected() {
        let err = TypeTree::from_value(json!({"a": {"b": "tuple"}})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTypeKind);
        assert_eq!(err.key.as_deref(), Some("a.b"));

        let err = TypeTree::from_value(json!({"a": 5})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTypeKind);
    }

    #[test]
    fn test_validate() {
        let types = TypeTree::from_value(json!({"batch_size": "int"})).unwrap();
        types.validate(&batch_conf()).unwrap();

        let err = types.validate(&json!({"batch_size": "32"})).unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
        assert!(err.message.contains("batch_size"));
        assert!(err.message.contains("int"));
        assert!(err.message.contains("str"));
        assert!(err.message.contains("\"32\""));
    }

    #[test]
    fn test_validate_skips_missing_and_references() {
        let types = TypeTree::from_value(json!({"a": "int", "b": "int", "c": "float"})).unwrap();
        types
            .validate(&json!({"a": "${other}", "c": "@models.rate"}))
            .unwrap();
    }

    #[test]
    fn test_validate_float_is_not_int() {
        let types = TypeTree::from_value(json!({"lr": "float"})).unwrap();
        assert!(types.validate(&json!({"lr": 0.1})).is_ok());
        assert!(types.validate(&json!({"lr": 1})).is_err());
    }

    #[test]
    fn test_fill_missing() {
        let mut types = TypeTree::from_value(json!({"batch_size": "int"})).unwrap();
        let added = types
            .fill_missing(&json!({
                "batch_size": 32,
                "name": "x",
                "rate": 0.5,
                "layers": [1, 2],
                "flag": false,
                "nothing": null,
                "nested": {"deep": 1},
            }))
            .unwrap();
        assert_eq!(added, 6);
        assert_eq!(types.get("name"), Some(TypeKind::Str));
        assert_eq!(types.get("rate"), Some(TypeKind::Float));
        assert_eq!(types.get("layers"), Some(TypeKind::List));
        assert_eq!(types.get("flag"), Some(TypeKind::Bool));
        assert_eq!(types.get("nothing"), Some(TypeKind::Null));
        assert_eq!(types.get("nested.deep"), Some(TypeKind::Int));

        // idempotent
        assert_eq!(types.fill_missing(&batch_conf()).unwrap(), 3);
        assert_eq!(types.fill_missing(&batch_conf()).unwrap(), 0);
    }

    #[test]
    fn test_coerce() {
        assert_eq!(TypeKind::Int.coerce("9").unwrap(), json!(9));
        assert!(TypeKind::Int.coerce("nine").is_err());
        assert_eq!(TypeKind::Float.coerce("0.25").unwrap(), json!(0.25));
        assert_eq!(TypeKind::Str.coerce("9").unwrap(), json!("9"));
        assert_eq!(TypeKind::Bool.coerce("Yes").unwrap(), json!(true));
        assert_eq!(TypeKind::List.coerce("[20, 15, 10]").unwrap(), json!([20, 15, 10]));
        assert!(TypeKind::List.coerce("20").is_err());
        assert_eq!(TypeKind::Null.coerce("~").unwrap(), Value::Null);
    }
}
