//! Values produced by resolution.
//!
//! Plain configuration data stays JSON-shaped; constructed singletons and
//! registered symbols are carried as type-erased, reference-counted handles
//! so that two reads of the same singleton can be compared by identity.

use crate::conf::Conf;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A constructed or registered object.
#[derive(Clone)]
pub struct Instance {
    name: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Instance {
    pub fn new<T: Any + Send + Sync>(name: impl Into<String>, value: T) -> Self {
        Self::from_arc(name, Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(name: impl Into<String>, value: Arc<T>) -> Self {
        Self {
            name: name.into(),
            inner: value,
        }
    }

    /// Registry name this object was produced from.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast::<T>().ok()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance({})", self.name)
    }
}

/// Signature of a registered constructor.
pub type ConstructorFn = dyn Fn(&Args, &Conf) -> anyhow::Result<Instance> + Send + Sync;

/// A registered constructor, returned uncalled by a plain `@name` reference.
#[derive(Clone)]
pub struct Callable {
    name: String,
    func: Arc<ConstructorFn>,
}

impl Callable {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Args, &Conf) -> anyhow::Result<Instance> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &Args, conf: &Conf) -> anyhow::Result<Instance> {
        (self.func)(args, conf)
    }

    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({})", self.name)
    }
}

/// A fully resolved configuration value.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// Scalar leaf: null, bool, number or string.
    Value(Value),
    List(Vec<Resolved>),
    Map(IndexMap<String, Resolved>),
    Object(Instance),
    Callable(Callable),
}

impl Resolved {
    pub fn null() -> Self {
        Resolved::Value(Value::Null)
    }

    /// Plain data form. `None` when any part is an object or callable.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Resolved::Value(v) => Some(v.clone()),
            Resolved::List(items) => items
                .iter()
                .map(Resolved::to_value)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Resolved::Map(map) => {
                let mut out = Map::new();
                for (key, child) in map {
                    out.insert(key.clone(), child.to_value()?);
                }
                Some(Value::Object(out))
            }
            Resolved::Object(_) | Resolved::Callable(_) => None,
        }
    }

    /// Deserialize the plain data form into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        let value = self
            .to_value()
            .ok_or_else(|| anyhow::anyhow!("value holds constructed objects"))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Resolved::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(Value::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_value().and_then(Value::as_bool)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Resolved::Value(Value::Null))
    }

    pub fn as_list(&self) -> Option<&[Resolved]> {
        match self {
            Resolved::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Resolved>> {
        match self {
            Resolved::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Child of a resolved mapping.
    pub fn get(&self, key: &str) -> Option<&Resolved> {
        self.as_map()?.get(key)
    }

    pub fn as_object(&self) -> Option<&Instance> {
        match self {
            Resolved::Object(instance) => Some(instance),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Resolved::Callable(callable) => Some(callable),
            _ => None,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.as_object()?.downcast::<T>()
    }

    /// Whether both values are the same constructed object.
    pub fn same_instance(&self, other: &Resolved) -> bool {
        match (self, other) {
            (Resolved::Object(a), Resolved::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Value> for Resolved {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => Resolved::List(items.into_iter().map(Resolved::from).collect()),
            Value::Object(map) => Resolved::Map(
                map.into_iter()
                    .map(|(key, child)| (key, Resolved::from(child)))
                    .collect(),
            ),
            scalar => Resolved::Value(scalar),
        }
    }
}

impl From<Instance> for Resolved {
    fn from(instance: Instance) -> Self {
        Resolved::Object(instance)
    }
}

impl From<&str> for Resolved {
    fn from(s: &str) -> Self {
        Resolved::Value(Value::String(s.to_string()))
    }
}

impl From<String> for Resolved {
    fn from(s: String) -> Self {
        Resolved::Value(Value::String(s))
    }
}

impl From<i64> for Resolved {
    fn from(n: i64) -> Self {
        Resolved::Value(Value::from(n))
    }
}

impl From<f64> for Resolved {
    fn from(n: f64) -> Self {
        Resolved::Value(Value::from(n))
    }
}

impl From<bool> for Resolved {
    fn from(b: bool) -> Self {
        Resolved::Value(Value::Bool(b))
    }
}

impl PartialEq for Resolved {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Resolved::Value(a), Resolved::Value(b)) => a == b,
            (Resolved::List(a), Resolved::List(b)) => a == b,
            (Resolved::Map(a), Resolved::Map(b)) => a == b,
            (Resolved::Object(a), Resolved::Object(b)) => a.ptr_eq(b),
            (Resolved::Callable(a), Resolved::Callable(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl PartialEq<Value> for Resolved {
    fn eq(&self, other: &Value) -> bool {
        self.to_value().as_ref() == Some(other)
    }
}

impl PartialEq<&str> for Resolved {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

/// Named arguments passed to a constructor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(IndexMap<String, Resolved>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Resolved>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Resolved>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Resolved> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Resolved)> {
        self.0.iter()
    }

    /// Deserialize a plain-data argument.
    pub fn value<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        self.get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument '{}'", name))?
            .deserialize()
            .map_err(|e| anyhow::anyhow!("argument '{}': {}", name, e))
    }

    /// Downcast an object argument.
    pub fn object<T: Any + Send + Sync>(&self, name: &str) -> anyhow::Result<Arc<T>> {
        self.get(name)
            .ok_or_else(|| anyhow::anyhow!("missing argument '{}'", name))?
            .downcast::<T>()
            .ok_or_else(|| {
                anyhow::anyhow!("argument '{}' is not a {}", name, std::any::type_name::<T>())
            })
    }
}

impl FromIterator<(String, Resolved)> for Args {
    fn from_iter<I: IntoIterator<Item = (String, Resolved)>>(iter: I) -> Self {
        Args(iter.into_iter().collect())
    }
}

impl IntoIterator for Args {
    type Item = (String, Resolved);
    type IntoIter = indexmap::map::IntoIter<String, Resolved>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Extend<(String, Resolved)> for Args {
    fn extend<I: IntoIterator<Item = (String, Resolved)>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}
