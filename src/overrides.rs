//! Environment and command-line overrides.
//!
//! Both collaborators produce flat `key-path = string` pairs. Key-paths may
//! be escaped with [`keypath::DOT_ESCAPE`] where `.` is not allowed in a
//! name. Strings are coerced to their declared kind before merging.

use crate::error::{ConfError, ConfResult};
use crate::keypath;
use crate::types::{TypeKind, TypeTree};
use serde_json::Value;

/// Prefix of environment variables holding overrides.
pub const ENV_PREFIX: &str = "CONFTREE_";

/// Reserved: directory holding the base configuration and patches.
pub const ENV_CONF_DIR: &str = "CONFTREE_CONF_DIR";

/// Reserved: base configuration file name, without extension.
pub const ENV_BASE_CONF: &str = "CONFTREE_BASE_CONF";

/// An override before coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOverride {
    pub key: String,
    pub value: String,
}

impl RawOverride {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether this override selects a file to splice rather than a value.
    pub fn is_file_ref(&self) -> bool {
        keypath::split(&self.key).last() == Some(&crate::files::FILE_KEY)
    }
}

/// Overrides from environment variables named `CONFTREE_<escaped key-path>`.
///
/// The reserved variables are skipped. Key case is kept as written.
pub fn from_env<I, K, V>(vars: I) -> Vec<RawOverride>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut out: Vec<RawOverride> = vars
        .into_iter()
        .filter_map(|(name, value)| {
            let name = name.as_ref();
            if name == ENV_CONF_DIR || name == ENV_BASE_CONF {
                return None;
            }
            let key = name.strip_prefix(ENV_PREFIX)?;
            (!key.is_empty()).then(|| RawOverride::new(keypath::unescape(key), value))
        })
        .collect();
    // Process environments are unordered; apply in a stable order.
    out.sort_by(|a, b| a.key.cmp(&b.key));
    out
}

/// Overrides from arguments of the form `--key=value` or `--key value`.
pub fn from_args<I, S>(args: I) -> ConfResult<Vec<RawOverride>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Vec::new();
    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        let Some(body) = arg.strip_prefix("--") else {
            return Err(ConfError::invalid_override(arg, "expected --<key>=<value>"));
        };
        let (key, value) = match body.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => {
                let value = match args.peek().map(|next| AsRef::<str>::as_ref(next)) {
                    Some(next) if !next.starts_with("--") => next.to_string(),
                    _ => return Err(ConfError::invalid_override(arg, "missing value")),
                };
                args.next();
                (body.to_string(), value)
            }
        };
        if key.is_empty() {
            return Err(ConfError::invalid_override(arg, "empty key"));
        }
        out.push(RawOverride::new(keypath::unescape(&key), value));
    }
    Ok(out)
}

/// Coerce with a declared kind. Undeclared values stay strings.
pub fn coerce(raw: &RawOverride, kind: Option<TypeKind>) -> ConfResult<Value> {
    match kind {
        Some(kind) => kind
            .coerce(&raw.value)
            .map_err(|reason| ConfError::invalid_override(&format!("{}={}", raw.key, raw.value), reason)),
        None => Ok(Value::String(raw.value.clone())),
    }
}

/// Coerce using a declared kind when there is one, else the kind of the
/// value currently stored at the key when the string converts to it, else
/// keep the string.
pub fn coerce_hinted(raw: &RawOverride, declared: &TypeTree, tree: &Value) -> ConfResult<Value> {
    if let Some(kind) = declared.get(&raw.key) {
        return coerce(raw, Some(kind));
    }
    let inferred = keypath::read(tree, &raw.key)
        .and_then(TypeKind::of)
        .filter(|kind| *kind != TypeKind::Null);
    Ok(inferred
        .and_then(|kind| kind.coerce(&raw.value).ok())
        .unwrap_or_else(|| Value::String(raw.value.clone())))
}
