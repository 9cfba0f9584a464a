//! Configuration source collaborator.
//!
//! The engine never touches the filesystem itself; it asks a [`SourceLoader`]
//! to load and save structured documents. [`YamlSource`] is the default.

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors raised by a source collaborator.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to serialize configuration for {}: {source}", path.display())]
    Serialize {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Loads and saves configuration documents by locator.
pub trait SourceLoader: Send + Sync {
    /// Load a document. An empty document loads as `Value::Null`.
    fn load(&self, locator: &Path) -> Result<Value, SourceError>;

    /// Save a document, replacing any existing one.
    fn save(&self, locator: &Path, value: &Value) -> Result<(), SourceError>;

    /// Whether a document exists at `locator`.
    fn exists(&self, locator: &Path) -> bool {
        locator.exists()
    }
}

/// YAML files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSource;

impl SourceLoader for YamlSource {
    fn load(&self, locator: &Path) -> Result<Value, SourceError> {
        debug!(path = %locator.display(), "Reading configuration file");
        let content = std::fs::read_to_string(locator).map_err(|source| SourceError::Read {
            path: locator.to_path_buf(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_yaml::from_str::<Value>(&content).map_err(|source| SourceError::Parse {
            path: locator.to_path_buf(),
            source,
        })
    }

    fn save(&self, locator: &Path, value: &Value) -> Result<(), SourceError> {
        debug!(path = %locator.display(), "Writing configuration file");
        let content = serde_yaml::to_string(value).map_err(|source| SourceError::Serialize {
            path: locator.to_path_buf(),
            source,
        })?;
        std::fs::write(locator, content).map_err(|source| SourceError::Write {
            path: locator.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load_preserves_order_and_strings() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conf.yaml");
        let value = json!({
            "zeta": 1,
            "alpha": {"ref": "${zeta}", "obj": "@models.Encoder()"},
            "list": [1, 2.5, "three", null, true]
        });

        YamlSource.save(&path, &value).unwrap();
        let loaded = YamlSource.load(&path).unwrap();
        assert_eq!(loaded, value);

        let keys: Vec<&String> = loaded.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "list"]);
    }

    #[test]
    fn test_empty_file_loads_as_null() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.yaml");
        std::fs::write(&path, "\n").unwrap();
        assert_eq!(YamlSource.load(&path).unwrap(), Value::Null);
    }

    #[test]
    fn test_scalar_document() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("v4.yaml");
        std::fs::write(&path, "4\n").unwrap();
        assert_eq!(YamlSource.load(&path).unwrap(), json!(4));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let temp = TempDir::new().unwrap();
        let err = YamlSource.load(&temp.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, SourceError::Read { .. }));
        assert!(err.to_string().contains("nope.yaml"));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.yaml");
        std::fs::write(&path, "key: [unclosed\n").unwrap();
        assert!(matches!(
            YamlSource.load(&path).unwrap_err(),
            SourceError::Parse { .. }
        ));
    }
}
