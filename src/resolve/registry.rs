//! Named objects and constructors that `@name` references select.

use super::value::{Args, Callable, Instance};
use crate::conf::Conf;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// A registered symbol.
#[derive(Debug, Clone)]
pub enum Entry {
    /// Returned as-is by `@name`; cannot be constructed.
    Object(Instance),
    /// Returned uncalled by `@name`, invoked by `@name()` or `_callable`.
    Constructor(Callable),
}

/// Mapping from string identifiers to application-supplied handles.
///
/// Filled once at startup and shared read-only by every configuration
/// built from it.
#[derive(Clone, Default)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain object under `name`.
    pub fn register_object<T>(&mut self, name: &str, value: T) -> &mut Self
    where
        T: Any + Send + Sync,
    {
        self.entries
            .insert(name.to_string(), Entry::Object(Instance::new(name, value)));
        self
    }

    /// Register a constructor under `name`.
    ///
    /// The constructor receives the named arguments written next to
    /// `_callable` and the configuration handle it is resolved from, so it
    /// can fill remaining parameters itself (see [`crate::bind`]).
    pub fn register_constructor<T, F>(&mut self, name: &str, constructor: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&Args, &Conf) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let instance_name = name.to_string();
        let callable = Callable::new(name, move |args: &Args, conf: &Conf| {
            constructor(args, conf).map(|value| Instance::new(instance_name.as_str(), value))
        });
        self.register_callable(callable)
    }

    pub fn register_callable(&mut self, callable: Callable) -> &mut Self {
        self.entries
            .insert(callable.name().to_string(), Entry::Constructor(callable));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("names", &self.names()).finish()
    }
}
