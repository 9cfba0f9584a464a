//! Reference resolution.
//!
//! Every read goes through [`Resolver::lookup`]: overlays first, then the
//! singleton cache, then the merged tree. Raw values are turned into
//! [`Resolved`] values by [`Resolver::resolve`]:
//!
//! - `"${path}"` resolves the referenced path (relative forms allowed)
//! - `"text ${path} text"` renders a string from scalar targets
//! - `"@name"` returns the registered symbol
//! - `"@name()"` and `{_callable: "@name()", ...args}` construct a singleton,
//!   memoized per key-path
//! - lists resolve element-wise without memoization, mappings key-wise

pub mod interpolation;
pub mod registry;
pub mod value;

pub use registry::{Entry, Registry};
pub use value::{Args, Callable, Instance, Resolved};

use crate::conf::Conf;
use crate::error::{ConfError, ConfResult};
use crate::keypath;
use crate::overlay::{Frame, FrameStack, Touch};
use interpolation::Reference;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Control key marking a mapping as a construction.
pub const CALLABLE_KEY: &str = "_callable";

/// Path prefix that bypasses the singleton cache for one `get`.
pub const NO_CACHE: char = '!';

/// Whether `value` is a reference leaf rather than plain data.
pub fn is_reference(value: &Value) -> bool {
    match value {
        Value::String(s) => s.starts_with(interpolation::REFERENCE_PREFIX) || interpolation::contains(s),
        Value::Object(map) => map.contains_key(CALLABLE_KEY),
        _ => false,
    }
}

/// Constructed singletons keyed by key-path.
#[derive(Debug, Default)]
pub struct SingletonCache {
    entries: Mutex<HashMap<String, Resolved>>,
}

impl SingletonCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Resolved> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    /// Store `value` unless another construction got there first; returns the stored entry.
    pub fn insert_if_absent(&self, path: &str, value: Resolved) -> Resolved {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_insert(value)
            .clone()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Topmost overlay frame a resolution has read from.
///
/// Holds the frame index plus one, zero when no frame contributed. A
/// construction resets it before building and reads it afterwards, so the
/// result is memoized no lower than the frames it depends on.
#[derive(Debug, Default)]
pub(crate) struct FrameUse(AtomicUsize);

impl FrameUse {
    fn note(&self, index: usize) {
        self.0.fetch_max(index + 1, Ordering::Relaxed);
    }

    /// Start a nested construction; returns the enclosing reading.
    fn begin(&self) -> usize {
        self.0.swap(0, Ordering::Relaxed)
    }

    /// End a nested construction started with `outer`; returns the topmost
    /// frame index it read from.
    fn end(&self, outer: usize) -> Option<usize> {
        let inner = self.0.load(Ordering::Relaxed);
        self.0.fetch_max(outer, Ordering::Relaxed);
        inner.checked_sub(1)
    }
}

/// Where a construction at the current path is memoized.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Memo {
    Base,
    /// Cache of the frame at this index of the stack snapshot.
    Frame(usize),
    Off,
}

/// Per-node resolution state.
#[derive(Clone, Copy)]
struct Ctx {
    memo: Memo,
    /// The current path addresses this node (false inside lists).
    stable: bool,
    /// Resolving the arguments of a construction.
    in_args: bool,
    /// Singleton cache enabled for this read.
    cached: bool,
}

/// A read over one snapshot of a configuration and its overlay stack.
///
/// No lock is held while resolving, so constructors may read the
/// configuration they are built from.
pub(crate) struct Resolver<'a> {
    conf: &'a Conf,
    tree: Arc<Value>,
    frames: FrameStack,
    /// Shared with the constructor handle when this read runs inside one.
    frame_use: Arc<FrameUse>,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(conf: &'a Conf) -> Self {
        Self {
            conf,
            tree: conf.tree_snapshot(),
            frames: conf.overlay_snapshot(),
            frame_use: conf.frame_use().unwrap_or_default(),
        }
    }

    /// Resolve `path`. `None` means absent. A leading [`NO_CACHE`] skips the
    /// singleton cache for this path and its subtree.
    pub(crate) fn get(&self, path: &str) -> ConfResult<Option<Resolved>> {
        let (path, cached) = match path.strip_prefix(NO_CACHE) {
            Some(rest) => (rest, false),
            None => (path, true),
        };
        self.lookup(path, cached, &mut Vec::new())
    }

    /// Raw value at `path` as seen through the overlays, with the index of
    /// the frame that contributed last.
    pub(crate) fn raw(&self, path: &str) -> Option<(Value, Touch, Option<usize>)> {
        let mut raw = keypath::read(&self.tree, path).cloned();
        let mut touch = Touch::Untouched;
        let mut owner = None;
        for (index, frame) in self.frames.iter().enumerate() {
            let applied = frame.apply(path, &mut raw);
            if applied != Touch::Untouched {
                touch = touch.max(applied);
                owner = Some(index);
            }
        }
        if let Some(index) = owner {
            self.frame_use.note(index);
        }
        raw.map(|raw| (raw, touch, owner))
    }

    fn lookup(&self, path: &str, cached: bool, trail: &mut Vec<String>) -> ConfResult<Option<Resolved>> {
        if trail.iter().any(|seen| seen == path) {
            return Err(ConfError::cyclic_reference(trail.as_slice(), path));
        }
        trail.push(path.to_string());
        let result = self.lookup_untracked(path, cached, trail);
        trail.pop();
        result
    }

    fn lookup_untracked(
        &self,
        path: &str,
        cached: bool,
        trail: &mut Vec<String>,
    ) -> ConfResult<Option<Resolved>> {
        let Some((raw, touch, owner)) = self.raw(path) else {
            return Ok(None);
        };

        // Overlay entries at or above the path win over memoized singletons;
        // entries below it only apply to a singleton not yet built.
        if cached {
            let lowest = match (touch, owner) {
                (Touch::Direct, Some(index)) => Some(index),
                _ => None,
            };
            if let Some(hit) = self.memoized_hit(path, lowest) {
                return Ok(Some(hit));
            }
        }

        let memo = match (cached, owner) {
            (false, _) => Memo::Off,
            (true, Some(index)) => Memo::Frame(index),
            (true, None) => Memo::Base,
        };
        let ctx = Ctx {
            memo,
            stable: true,
            in_args: false,
            cached,
        };
        self.resolve(path, raw, ctx, trail).map(Some)
    }

    fn resolve(&self, path: &str, raw: Value, ctx: Ctx, trail: &mut Vec<String>) -> ConfResult<Resolved> {
        match raw {
            Value::String(s) => self.resolve_str(path, s, ctx, trail),
            Value::Array(items) => {
                let element = Ctx {
                    memo: Memo::Off,
                    stable: false,
                    ..ctx
                };
                items
                    .into_iter()
                    .map(|item| self.resolve(path, item, element, trail))
                    .collect::<ConfResult<Vec<_>>>()
                    .map(Resolved::List)
            }
            Value::Object(map) if map.contains_key(CALLABLE_KEY) => {
                if ctx.in_args {
                    return Err(ConfError::unsupported_nesting(path));
                }
                self.construct_mapping(path, map, ctx, trail)
            }
            Value::Object(map) => self.resolve_mapping(path, map, ctx, trail),
            scalar => Ok(Resolved::Value(scalar)),
        }
    }

    fn resolve_mapping(
        &self,
        path: &str,
        map: Map<String, Value>,
        ctx: Ctx,
        trail: &mut Vec<String>,
    ) -> ConfResult<Resolved> {
        let mut out = indexmap::IndexMap::with_capacity(map.len());
        for (key, child) in map {
            let child_path = keypath::join(path, &key);
            // Children of an addressable node are read through `lookup` so that
            // overlays and memoized singletons apply to them as to a direct read.
            let resolved = if ctx.stable && !ctx.in_args {
                match self.lookup(&child_path, ctx.cached, trail)? {
                    Some(resolved) => resolved,
                    None => self.resolve(&child_path, child, ctx, trail)?,
                }
            } else {
                self.resolve(&child_path, child, Ctx { memo: Memo::Off, ..ctx }, trail)?
            };
            out.insert(key, resolved);
        }
        Ok(Resolved::Map(out))
    }

    fn resolve_str(&self, path: &str, s: String, ctx: Ctx, trail: &mut Vec<String>) -> ConfResult<Resolved> {
        if let Some(inner) = interpolation::whole(&s) {
            let target = interpolation::target_path(path, inner)
                .map_err(|reason| ConfError::invalid_reference(path, reason))?;
            debug!(key = %path, target = %target, "Interpolating");
            return self.lookup(&target, true, trail)?.ok_or_else(|| self.missing(&target));
        }
        if interpolation::contains(&s) {
            return self.render(path, &s, trail).map(Resolved::from);
        }
        match interpolation::parse_reference(&s) {
            None => Ok(Resolved::Value(Value::String(s))),
            Some(Err(reason)) => Err(ConfError::invalid_reference(path, reason)),
            Some(Ok(Reference::Symbol(name))) => match self.conf.registry().get(name) {
                Some(Entry::Object(instance)) => Ok(Resolved::Object(instance.clone())),
                Some(Entry::Constructor(callable)) => Ok(Resolved::Callable(callable.clone())),
                None => Err(ConfError::unresolvable(name, path)),
            },
            Some(Ok(Reference::Construct(name))) => {
                if ctx.in_args {
                    return Err(ConfError::unsupported_nesting(path));
                }
                self.memoized(path, ctx, trail, |_| self.construct(path, name, &Args::new()))
            }
        }
    }

    fn construct_mapping(
        &self,
        path: &str,
        mut map: Map<String, Value>,
        ctx: Ctx,
        trail: &mut Vec<String>,
    ) -> ConfResult<Resolved> {
        let target = map.remove(CALLABLE_KEY).unwrap_or(Value::Null);
        let name = match target.as_str().and_then(interpolation::parse_reference) {
            Some(Ok(reference)) => reference.name().to_string(),
            Some(Err(reason)) => return Err(ConfError::invalid_reference(path, reason)),
            None => match target.as_str() {
                Some(bare) if !bare.is_empty() => bare.to_string(),
                _ => {
                    return Err(ConfError::invalid_reference(
                        path,
                        format!("'{}' must name a registered constructor", CALLABLE_KEY),
                    ));
                }
            },
        };

        let arg_ctx = Ctx {
            memo: Memo::Off,
            stable: false,
            in_args: true,
            cached: ctx.cached,
        };
        self.memoized(path, ctx, trail, |trail| {
            let mut args = Args::new();
            for (key, raw) in map {
                let arg_path = keypath::join(path, &key);
                let resolved = self.resolve(&arg_path, raw, arg_ctx, trail)?;
                args.insert(key, resolved);
            }
            self.construct(path, &name, &args)
        })
    }

    fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index).map(|frame| &**frame)
    }

    /// Memoized construction at `path` visible to this read: the topmost
    /// frame cache holding one, then the base cache. With `lowest` set, only
    /// frames from that index up are consulted.
    fn memoized_hit(&self, path: &str, lowest: Option<usize>) -> Option<Resolved> {
        let floor = lowest.unwrap_or(0);
        for (index, frame) in self.frames.iter().enumerate().skip(floor).rev() {
            if let Some(hit) = frame.cache().get(path) {
                self.frame_use.note(index);
                return Some(hit);
            }
        }
        match lowest {
            Some(_) => None,
            None => self.conf.singletons().get(path),
        }
    }

    fn cached(&self, path: &str, ctx: Ctx) -> Option<Resolved> {
        if !ctx.stable {
            return None;
        }
        match ctx.memo {
            Memo::Base => self.memoized_hit(path, None),
            Memo::Frame(index) => self.memoized_hit(path, Some(index)),
            Memo::Off => None,
        }
    }

    /// Build once per key-path. The result goes to the cache of the topmost
    /// frame the build read from (or the owning frame, if higher), else to
    /// the base cache.
    fn memoized<F>(&self, path: &str, ctx: Ctx, trail: &mut Vec<String>, build: F) -> ConfResult<Resolved>
    where
        F: FnOnce(&mut Vec<String>) -> ConfResult<Resolved>,
    {
        if let Some(hit) = self.cached(path, ctx) {
            return Ok(hit);
        }
        let outer = self.frame_use.begin();
        let built = build(trail);
        let read_from = self.frame_use.end(outer);
        let built = built?;
        if !ctx.stable {
            return Ok(built);
        }

        let memo = match (ctx.memo, read_from) {
            (Memo::Off, _) => Memo::Off,
            (memo, None) => memo,
            (Memo::Base, Some(read)) => Memo::Frame(read),
            (Memo::Frame(owner), Some(read)) => Memo::Frame(owner.max(read)),
        };
        Ok(match memo {
            Memo::Base => self.conf.singletons().insert_if_absent(path, built),
            Memo::Frame(index) => match self.frame(index) {
                Some(frame) => frame.cache().insert_if_absent(path, built),
                None => built,
            },
            Memo::Off => built,
        })
    }

    fn construct(&self, path: &str, name: &str, args: &Args) -> ConfResult<Resolved> {
        let callable = match self.conf.registry().get(name) {
            Some(Entry::Constructor(callable)) => callable.clone(),
            Some(Entry::Object(_)) => {
                return Err(ConfError::invalid_reference(
                    path,
                    format!("'{}' is an object, not a constructor", name),
                ));
            }
            None => return Err(ConfError::unresolvable(name, path)),
        };
        debug!(key = %path, callable = %name, args = args.len(), "Constructing singleton");
        callable
            .call(args, &self.conf.tracked(self.frame_use.clone()))
            .map(Resolved::Object)
            .map_err(|err| match err.downcast::<ConfError>() {
                Ok(conf_err) => conf_err,
                Err(err) => ConfError::construction_failed(name, path, err),
            })
    }

    /// Replace every `${...}` in `s` with its scalar target.
    pub(crate) fn render(&self, path: &str, s: &str, trail: &mut Vec<String>) -> ConfResult<String> {
        let mut out = s.to_string();
        for (outer, inner) in interpolation::occurrences(s) {
            let target = interpolation::target_path(path, inner)
                .map_err(|reason| ConfError::invalid_reference(path, reason))?;
            let resolved = self.lookup(&target, true, trail)?.ok_or_else(|| self.missing(&target))?;
            let text = match resolved.as_value() {
                Some(Value::String(text)) => text.clone(),
                Some(scalar) => scalar.to_string(),
                None => {
                    return Err(ConfError::invalid_reference(
                        path,
                        format!("'{}' inside a string must refer to a scalar", outer),
                    ));
                }
            };
            out = out.replacen(outer, &text, 1);
        }
        Ok(out)
    }

    /// Missing-key error naming the nearest existing ancestor.
    pub(crate) fn missing(&self, path: &str) -> ConfError {
        let visible = crate::overlay::apply_all(&self.tree, &self.frames);
        let (ancestor, siblings) = keypath::nearest_ancestor(&visible, path);
        ConfError::missing_key(path, &ancestor, &siblings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_reference() {
        assert!(is_reference(&json!("${a}")));
        assert!(is_reference(&json!("x-${a}")));
        assert!(is_reference(&json!("@models.Encoder()")));
        assert!(is_reference(&json!({"_callable": "@E()", "num": 1})));
        assert!(!is_reference(&json!("plain")));
        assert!(!is_reference(&json!({"num": 1})));
        assert!(!is_reference(&json!(3)));
    }

    #[test]
    fn test_cache_keeps_first_entry() {
        let cache = SingletonCache::new();
        let first = Resolved::from(Instance::new("a", 1i64));
        let second = Resolved::from(Instance::new("a", 2i64));
        let stored = cache.insert_if_absent("k", first.clone());
        assert!(stored.same_instance(&first));
        let stored = cache.insert_if_absent("k", second);
        assert!(stored.same_instance(&first));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
