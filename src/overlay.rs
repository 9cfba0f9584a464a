//! Scoped overrides.
//!
//! An [`Overlay`] is a mapping of key-paths to raw values. Entering it with
//! [`Conf::modified`] pushes a [`Frame`] onto the handle's overlay stack and
//! returns an [`OverlayGuard`]; leaving restores the stack that was current
//! before the push. Frames are read most-recent-first and their values go
//! through the same resolver as the base tree, rooted at the overridden path.
//!
//! The stack is persistent: pushing builds a new `Arc<Vec<_>>`, so readers
//! take a cheap snapshot and never hold the lock while resolving.

use crate::conf::Conf;
use crate::error::{ConfError, ConfResult};
use crate::keypath;
use crate::merge::MergeMode;
use crate::resolve::SingletonCache;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

/// Snapshot of the overlay stack, bottom first.
pub type FrameStack = Arc<Vec<Arc<Frame>>>;

pub(crate) fn empty_stack() -> FrameStack {
    Arc::new(Vec::new())
}

/// Override mapping built from a value and named pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    entries: IndexMap<String, Value>,
}

impl Overlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay from a mapping whose keys are key-paths. Null is empty.
    pub fn from_value(mapping: Value) -> ConfResult<Self> {
        match mapping {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => {
                let mut overlay = Self::new();
                for (key, value) in map {
                    overlay.insert(key, value)?;
                }
                Ok(overlay)
            }
            other => Err(ConfError::invalid_fragment(
                "overlay",
                format!("expected a mapping, found {}", other),
            )),
        }
    }

    /// Add a named pair. Later pairs replace earlier ones with the same key.
    pub fn set(mut self, key: &str, value: impl Into<Value>) -> ConfResult<Self> {
        self.insert(key.to_string(), value.into())?;
        Ok(self)
    }

    fn insert(&mut self, key: String, value: Value) -> ConfResult<()> {
        let key = key
            .strip_suffix(keypath::FORCE_OVERRIDE)
            .map(str::to_string)
            .unwrap_or(key);
        if key.is_empty() {
            return Err(ConfError::invalid_fragment("overlay", "empty key"));
        }
        // Keep insertion order meaningful: a replaced key moves to the end.
        self.entries.shift_remove(&key);
        self.entries.insert(key, value);
        Ok(())
    }

    pub fn entries(&self) -> &IndexMap<String, Value> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> IndexMap<String, Value> {
        self.entries
    }
}

/// How a frame affects one key-path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Touch {
    Untouched,
    /// Only entries below the path were written into it.
    Descendant,
    /// An entry at the path or one of its ancestors replaced it.
    Direct,
}

/// One active overlay with its own singleton cache.
#[derive(Debug)]
pub struct Frame {
    entries: IndexMap<String, Value>,
    cache: SingletonCache,
}

impl Frame {
    pub(crate) fn new(overlay: Overlay) -> Self {
        Self {
            entries: overlay.entries,
            cache: SingletonCache::new(),
        }
    }

    pub fn entries(&self) -> &IndexMap<String, Value> {
        &self.entries
    }

    pub(crate) fn cache(&self) -> &SingletonCache {
        &self.cache
    }

    /// Apply this frame's entries to the raw value at `path`.
    ///
    /// An entry at `path` or above it replaces the value (entries replace
    /// their whole subtree); entries below it are written into it.
    pub(crate) fn apply(&self, path: &str, raw: &mut Option<Value>) -> Touch {
        let mut touch = Touch::Untouched;
        for (key, value) in &self.entries {
            if key == path {
                *raw = Some(value.clone());
                touch = Touch::Direct;
            } else if let Some(rest) = below(key, path) {
                *raw = keypath::read(value, rest).cloned();
                touch = Touch::Direct;
            } else if let Some(rel) = below(path, key) {
                let target = raw.get_or_insert_with(|| Value::Object(Map::new()));
                keypath::write(target, rel, value.clone(), MergeMode::Override);
                touch = touch.max(Touch::Descendant);
            }
        }
        touch
    }
}

/// Remainder of `path` below `ancestor`, if `ancestor` is a proper ancestor.
fn below<'p>(ancestor: &str, path: &'p str) -> Option<&'p str> {
    if ancestor.is_empty() {
        return (!path.is_empty()).then_some(path);
    }
    path.strip_prefix(ancestor)?.strip_prefix(keypath::SEPARATOR)
}

/// Raw tree as seen through every frame of `stack`.
pub(crate) fn apply_all(tree: &Value, stack: &[Arc<Frame>]) -> Value {
    let mut out = tree.clone();
    for frame in stack {
        for (key, value) in &frame.entries {
            keypath::write(&mut out, key, value.clone(), MergeMode::Override);
        }
    }
    out
}

/// Active overlay. Leaving restores the prior stack.
///
/// Prefer [`OverlayGuard::exit`], which reports misuse as an error. Dropping
/// an active guard restores too, and panics on misuse unless the thread is
/// already unwinding.
#[must_use = "the overlay is removed when the guard is dropped"]
pub struct OverlayGuard {
    stack: Arc<Mutex<FrameStack>>,
    frame: Arc<Frame>,
    prior: FrameStack,
    active: bool,
}

impl OverlayGuard {
    pub(crate) fn enter(conf: &Conf, overlay: Overlay) -> Self {
        let frame = Arc::new(Frame::new(overlay));
        let cell = conf.overlay_cell();
        let mut stack = cell.lock().unwrap_or_else(PoisonError::into_inner);
        let prior = stack.clone();
        let mut next: Vec<Arc<Frame>> = prior.iter().cloned().collect();
        next.push(frame.clone());
        *stack = Arc::new(next);
        debug!(depth = stack.len(), keys = frame.entries.len(), "Entered overlay");
        drop(stack);

        Self {
            stack: cell,
            frame,
            prior,
            active: true,
        }
    }

    /// Keys overridden by this overlay.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.frame.entries.keys().map(String::as_str)
    }

    /// Leave the overlay.
    ///
    /// Fails with `OVERLAY_MISUSE`, leaving the stack as it is, when the top
    /// of the stack is not this overlay.
    pub fn exit(mut self) -> ConfResult<()> {
        self.active = false;
        self.restore()
    }

    fn restore(&self) -> ConfResult<()> {
        let mut stack = self.stack.lock().unwrap_or_else(PoisonError::into_inner);
        match stack.last() {
            Some(top) if Arc::ptr_eq(top, &self.frame) => {
                *stack = self.prior.clone();
                debug!(depth = stack.len(), "Left overlay");
                Ok(())
            }
            _ => Err(ConfError::overlay_misuse()),
        }
    }
}

impl Drop for OverlayGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(err) = self.restore() {
            if std::thread::panicking() {
                error!(error = %err, "Overlay misuse detected while unwinding");
            } else {
                panic!("{}", err);
            }
        }
    }
}
