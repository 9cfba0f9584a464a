//! Structured error types for configuration resolution.

use crate::merge::Conflict;
use crate::source::SourceError;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Lookup errors
    MissingKey,
    UnresolvableReference,
    InvalidReference,
    CyclicReference,

    // Merge and validation errors
    StrictConflict,
    TypeMismatch,
    InvalidTypeKind,
    InvalidFragment,
    InvalidOverride,
    NestingTooDeep,

    // Construction errors
    UnsupportedNesting,
    ConstructionFailed,

    // Scope errors
    OverlayMisuse,

    // Collaborator and internal errors
    SourceError,
    InternalError,
}

/// Structured configuration error.
#[derive(Debug, Clone, Serialize)]
pub struct ConfError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ConfError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            key: None,
            details: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    // Convenience constructors

    /// `ancestor` is the deepest existing node on the way to `key`, `siblings`
    /// are the keys found there.
    pub fn missing_key(key: &str, ancestor: &str, siblings: &[String]) -> Self {
        let location = if ancestor.is_empty() {
            "the root".to_string()
        } else {
            format!("'{}'", ancestor)
        };
        Self::new(
            ErrorCode::MissingKey,
            format!(
                "no config '{}' found; keys at {}: [{}]",
                key,
                location,
                siblings.join(", ")
            ),
        )
        .with_key(key)
    }

    pub fn strict_conflict(conflict: &Conflict) -> Self {
        Self::new(ErrorCode::StrictConflict, format!("can't {}", conflict)).with_key(&conflict.key)
    }

    pub fn type_mismatch(key: &str, expected: &str, actual: &str, value: &Value) -> Self {
        Self::new(
            ErrorCode::TypeMismatch,
            format!(
                "config '{}' should be of type {} but is {} ({})",
                key, expected, actual, value
            ),
        )
        .with_key(key)
    }

    pub fn invalid_type_kind(key: &str, kind: &str) -> Self {
        Self::new(
            ErrorCode::InvalidTypeKind,
            format!(
                "invalid type '{}' for '{}'; expected one of int, float, str, list, bool, none",
                kind, key
            ),
        )
        .with_key(key)
    }

    pub fn overlay_misuse() -> Self {
        Self::new(
            ErrorCode::OverlayMisuse,
            "overlay stack top does not match the overlay being exited; \
             scoped overrides were exited out of order or from another task",
        )
    }

    pub fn unsupported_nesting(key: &str) -> Self {
        Self::new(
            ErrorCode::UnsupportedNesting,
            format!(
                "'{}' constructs an object inside the arguments of another object, which is \
                 not supported. Define it as its own entry (e.g. `my_obj: \"@MyType()\"`) and \
                 refer to it with an interpolation (`\"${{my_obj}}\"`)",
                key
            ),
        )
        .with_key(key)
    }

    pub fn unresolvable(name: &str, key: &str) -> Self {
        Self::new(
            ErrorCode::UnresolvableReference,
            format!("'{}' is not registered (referenced from '{}')", name, key),
        )
        .with_key(key)
    }

    pub fn invalid_reference(key: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidReference,
            format!("invalid reference at '{}': {}", key, reason),
        )
        .with_key(key)
    }

    pub fn cyclic_reference(chain: &[String], target: &str) -> Self {
        Self::new(
            ErrorCode::CyclicReference,
            format!(
                "interpolation cycle: {} -> {}",
                chain.join(" -> "),
                target
            ),
        )
        .with_key(target)
    }

    pub fn construction_failed(name: &str, key: &str, err: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ConstructionFailed,
            format!("constructing '{}' for '{}' failed: {}", name, key, err),
        )
        .with_key(key)
    }

    pub fn invalid_fragment(source: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidFragment,
            format!("configuration from {} is invalid: {}", source, reason),
        )
    }

    pub fn invalid_override(arg: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidOverride,
            format!("invalid override '{}': {}", arg, reason),
        )
    }

    pub fn nesting_too_deep(key: &str, max_depth: usize) -> Self {
        Self::new(
            ErrorCode::NestingTooDeep,
            format!(
                "file references nest deeper than {} levels at '{}'; check for a reference cycle",
                max_depth, key
            ),
        )
        .with_key(key)
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref details) = self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfError {}

impl From<SourceError> for ConfError {
    fn from(err: SourceError) -> Self {
        Self::new(ErrorCode::SourceError, err.to_string())
    }
}

// Allow using ? with anyhow errors by converting them
impl From<anyhow::Error> for ConfError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ConfError>() {
            Ok(conf_err) => conf_err,
            Err(err) => ConfError::internal(err),
        }
    }
}

/// Result type for configuration operations.
pub type ConfResult<T> = std::result::Result<T, ConfError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_key_lists_siblings() {
        let err = ConfError::missing_key("k2.k9", "k2", &["k21".to_string(), "k22".to_string()]);
        assert_eq!(err.code, ErrorCode::MissingKey);
        assert_eq!(err.key.as_deref(), Some("k2.k9"));
        assert!(err.message.contains("'k2'"));
        assert!(err.message.contains("k21, k22"));
    }

    #[test]
    fn test_missing_key_at_root() {
        let err = ConfError::missing_key("nope", "", &["a".to_string()]);
        assert!(err.message.contains("the root"));
    }

    #[test]
    fn test_strict_conflict_message() {
        let conflict = Conflict {
            key: "batch_size".to_string(),
            old: json!(32),
            new: json!(64),
        };
        let err = ConfError::strict_conflict(&conflict);
        assert_eq!(err.code, ErrorCode::StrictConflict);
        assert_eq!(err.to_string(), "can't override batch_size = 64 (formerly 32)");
    }

    #[test]
    fn test_code_serializes_screaming_snake_case() {
        let json = serde_json::to_value(ErrorCode::OverlayMisuse).unwrap();
        assert_eq!(json, json!("OVERLAY_MISUSE"));
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_code() {
        let err: anyhow::Error = ConfError::overlay_misuse().into();
        let back = ConfError::from(err);
        assert_eq!(back.code, ErrorCode::OverlayMisuse);

        let other = ConfError::from(anyhow::anyhow!("boom"));
        assert_eq!(other.code, ErrorCode::InternalError);
    }

    #[test]
    fn test_details_in_display() {
        let err = ConfError::internal("x").with_details("while loading");
        assert_eq!(err.to_string(), "x (while loading)");
    }
}
