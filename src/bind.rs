//! Parameter binding.
//!
//! A [`Binding`] describes where each parameter of a function reads its
//! value from. Resolving it against a [`Conf`] yields the arguments to call
//! with; arguments the caller supplies are never looked up.
//!
//! ```ignore
//! let binding = Binding::new()
//!     .subkeys("model")
//!     .param("encoder", bind::value())
//!     .param("lr", bind::key_or(".optim.lr", 0.1));
//! let args = binding.resolve(&conf, Args::new())?;
//! ```

use crate::conf::Conf;
use crate::error::{ConfError, ConfResult, ErrorCode};
use crate::keypath;
use crate::resolve::{Args, Resolved};
use serde_json::Value;

/// Where one parameter reads its value from.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// The parameter's own name, under the binding's subkeys. Required.
    Value,
    /// Like [`Param::Value`], with a fallback when absent.
    Default(Value),
    /// An explicit key-path. A leading `.` makes it relative to the subkeys.
    Key(String),
    /// Like [`Param::Key`], with a fallback when absent.
    KeyOr(String, Value),
}

pub fn value() -> Param {
    Param::Value
}

pub fn value_or(default: impl Into<Value>) -> Param {
    Param::Default(default.into())
}

pub fn key(path: impl Into<String>) -> Param {
    Param::Key(path.into())
}

pub fn key_or(path: impl Into<String>, default: impl Into<Value>) -> Param {
    Param::KeyOr(path.into(), default.into())
}

/// Parameter sources for one function.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    subkeys: Option<String>,
    params: Vec<(String, Param)>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for parameters read by name. May contain `${...}`.
    pub fn subkeys(mut self, prefix: impl Into<String>) -> Self {
        self.subkeys = Some(prefix.into()).filter(|prefix| !prefix.is_empty());
        self
    }

    pub fn param(mut self, name: impl Into<String>, param: Param) -> Self {
        let name = name.into();
        self.params.retain(|(existing, _)| *existing != name);
        self.params.push((name, param));
        self
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.params.iter().map(|(name, param)| (name.as_str(), param))
    }

    /// Arguments for a call: `supplied` plus every bound parameter the
    /// caller left out.
    pub fn resolve(&self, conf: &Conf, supplied: Args) -> ConfResult<Args> {
        let subkeys = match &self.subkeys {
            Some(prefix) => conf.interpolate_str(prefix)?,
            None => String::new(),
        };

        let mut args = supplied;
        for (name, param) in &self.params {
            if args.contains(name) {
                continue;
            }
            let resolved = self
                .lookup(conf, &subkeys, name, param)
                .map_err(|err| err.with_details(format!("binding parameter '{}'", name)))?;
            args.insert(name.clone(), resolved);
        }
        Ok(args)
    }

    /// Same as [`Binding::resolve`] against the task's current configuration.
    pub fn resolve_current(&self, supplied: Args) -> ConfResult<Args> {
        let conf = Conf::current().ok_or_else(|| {
            ConfError::new(
                ErrorCode::InternalError,
                "no current configuration; bind parameters inside Conf::scope",
            )
        })?;
        self.resolve(&conf, supplied)
    }

    fn lookup(&self, conf: &Conf, subkeys: &str, name: &str, param: &Param) -> ConfResult<Resolved> {
        match param {
            Param::Value => conf.get(&keypath::join(subkeys, name)),
            Param::Default(default) => conf.get_or(&keypath::join(subkeys, name), default.clone()),
            Param::Key(path) => conf.get(&self.key_path(conf, subkeys, path)?),
            Param::KeyOr(path, default) => {
                conf.get_or(&self.key_path(conf, subkeys, path)?, default.clone())
            }
        }
    }

    fn key_path(&self, conf: &Conf, subkeys: &str, path: &str) -> ConfResult<String> {
        let path = match path.strip_prefix(keypath::SEPARATOR) {
            Some(relative) => keypath::join(subkeys, relative),
            None => path.to_string(),
        };
        conf.interpolate_str(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conf() -> Conf {
        Conf::from_value(json!({
            "key1": "val1",
            "key2": "val2",
            "nested": {"key1": "nested1", "deep": {"x": 3}},
            "which": "nested",
        }))
        .unwrap()
    }

    #[test]
    fn test_value_reads_own_name() {
        let args = Binding::new().param("key1", value()).resolve(&conf(), Args::new()).unwrap();
        assert_eq!(args.get("key1").unwrap(), &"val1");
    }

    #[test]
    fn test_supplied_arguments_win() {
        let args = Binding::new()
            .param("key1", value())
            .resolve(&conf(), Args::new().with("key1", "mine"))
            .unwrap();
        assert_eq!(args.get("key1").unwrap(), &"mine");
    }

    #[test]
    fn test_subkeys_and_relative_keys() {
        let binding = Binding::new()
            .subkeys("${which}")
            .param("key1", value())
            .param("x", key(".deep.x"))
            .param("top", key("key2"));
        let args = binding.resolve(&conf(), Args::new()).unwrap();
        assert_eq!(args.get("key1").unwrap(), &"nested1");
        assert_eq!(args.get("x").unwrap().as_i64(), Some(3));
        assert_eq!(args.get("top").unwrap(), &"val2");
    }

    #[test]
    fn test_defaults() {
        let binding = Binding::new()
            .param("absent", value_or("default"))
            .param("key1", value_or("default"))
            .param("other", key_or("no.such", 7i64));
        let args = binding.resolve(&conf(), Args::new()).unwrap();
        assert_eq!(args.get("absent").unwrap(), &"default");
        assert_eq!(args.get("key1").unwrap(), &"val1");
        assert_eq!(args.get("other").unwrap().as_i64(), Some(7));
    }

    #[test]
    fn test_missing_required_parameter() {
        let err = Binding::new().param("absent", value()).resolve(&conf(), Args::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingKey);
        assert!(err.details.unwrap().contains("absent"));
    }

    #[test]
    fn test_resolve_current() {
        let binding = Binding::new().param("key2", value());
        assert!(binding.resolve_current(Args::new()).is_err());
        let args = conf().sync_scope(|| binding.resolve_current(Args::new())).unwrap();
        assert_eq!(args.get("key2").unwrap(), &"val2");
    }
}
