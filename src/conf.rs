//! The configuration handle.
//!
//! A [`Conf`] owns one merged tree with its type declarations and singleton
//! cache, plus an overlay stack. Clones share the tree and caches. Each
//! clone carries its own overlay stack, starting from the overlays active
//! when it was made, so a handle moved into another task never sees the
//! overlays that task's siblings enter.

use crate::error::{ConfError, ConfResult, ErrorCode};
use crate::files::{self, FileSources};
use crate::keypath;
use crate::merge::{Conflict, MergeMode, Merger};
use crate::overlay::{self, FrameStack, Overlay, OverlayGuard};
use crate::resolve::{FrameUse, Registry, Resolved, Resolver, SingletonCache};
use crate::source::SourceLoader;
use crate::types::{TypeKind, TypeTree};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::Any;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

tokio::task_local! {
    static CURRENT: Conf;
}

/// Everything the loader hands over.
pub(crate) struct ConfParts {
    pub tree: Value,
    pub types: TypeTree,
    pub registry: Arc<Registry>,
    pub source: Arc<dyn SourceLoader>,
    pub base_dir: PathBuf,
    pub merger: Merger,
    pub conf_patches: Vec<String>,
    pub file_sources: FileSources,
    pub conflicts: Vec<Conflict>,
}

struct ConfInner {
    tree: RwLock<Arc<Value>>,
    types: RwLock<TypeTree>,
    singletons: SingletonCache,
    registry: Arc<Registry>,
    source: Arc<dyn SourceLoader>,
    base_dir: PathBuf,
    merger: Merger,
    conf_patches: Vec<String>,
    file_sources: RwLock<FileSources>,
    conflicts: Mutex<Vec<Conflict>>,
}

/// Handle to a loaded configuration.
pub struct Conf {
    inner: Arc<ConfInner>,
    overlays: Arc<Mutex<FrameStack>>,
    /// Set on the handle passed to a constructor; records which overlay
    /// frames the construction read from.
    frame_use: Option<Arc<FrameUse>>,
}

impl Clone for Conf {
    /// Same configuration, with an overlay stack of its own that starts
    /// from the overlays active on `self`.
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            overlays: Arc::new(Mutex::new(self.overlay_snapshot())),
            frame_use: None,
        }
    }
}

impl std::fmt::Debug for Conf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conf")
            .field("tree", &self.tree_snapshot())
            .field("overlays", &self.overlay_snapshot().len())
            .field("merge_mode", &self.inner.merger.mode)
            .field("strict", &self.inner.merger.strict)
            .finish()
    }
}

impl Conf {
    pub(crate) fn assemble(parts: ConfParts) -> Self {
        Self {
            inner: Arc::new(ConfInner {
                tree: RwLock::new(Arc::new(parts.tree)),
                types: RwLock::new(parts.types),
                singletons: SingletonCache::new(),
                registry: parts.registry,
                source: parts.source,
                base_dir: parts.base_dir,
                merger: parts.merger,
                conf_patches: parts.conf_patches,
                file_sources: RwLock::new(parts.file_sources),
                conflicts: Mutex::new(parts.conflicts),
            }),
            overlays: Arc::new(Mutex::new(overlay::empty_stack())),
            frame_use: None,
        }
    }

    /// Configuration from one in-memory fragment, without environment overrides.
    pub fn from_value(fragment: Value) -> ConfResult<Self> {
        crate::loader::ConfLoader::new()
            .conf(fragment)
            .env_overrides(false)
            .load()
    }

    // Reads

    /// Resolve `path`. Fails with `MISSING_KEY` when absent.
    ///
    /// A leading `!` bypasses the singleton cache: constructions under the
    /// path are built fresh and not memoized.
    pub fn get(&self, path: &str) -> ConfResult<Resolved> {
        let resolver = Resolver::new(self);
        resolver
            .get(path)?
            .ok_or_else(|| resolver.missing(path.trim_start_matches(crate::resolve::NO_CACHE)))
    }

    /// Resolve `path`, or return `default` when it is absent.
    pub fn get_or(&self, path: &str, default: impl Into<Resolved>) -> ConfResult<Resolved> {
        Ok(self.try_get(path)?.unwrap_or_else(|| default.into()))
    }

    /// Resolve `path`; `None` when absent.
    pub fn try_get(&self, path: &str) -> ConfResult<Option<Resolved>> {
        Resolver::new(self).get(path)
    }

    /// Resolve `path` and deserialize its plain-data form.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> ConfResult<T> {
        let resolved = self.get(path)?;
        resolved.deserialize().map_err(|err| {
            ConfError::new(
                ErrorCode::TypeMismatch,
                format!(
                    "config '{}' can't be read as {}: {}",
                    path,
                    std::any::type_name::<T>(),
                    err
                ),
            )
            .with_key(path)
        })
    }

    /// Resolve `path` to a constructed object of type `T`.
    pub fn get_object<T: Any + Send + Sync>(&self, path: &str) -> ConfResult<Arc<T>> {
        self.get(path)?.downcast::<T>().ok_or_else(|| {
            ConfError::new(
                ErrorCode::TypeMismatch,
                format!("config '{}' is not a {}", path, std::any::type_name::<T>()),
            )
            .with_key(path)
        })
    }

    /// Whether `path` exists, overlays included. Never resolves anything.
    pub fn contains(&self, path: &str) -> bool {
        Resolver::new(self).raw(path).is_some()
    }

    /// Unresolved value at `path` as seen through the overlays.
    pub fn get_raw(&self, path: &str) -> Option<Value> {
        Resolver::new(self).raw(path).map(|(raw, _, _)| raw)
    }

    /// Render every `${...}` in `s` against this configuration.
    pub fn interpolate_str(&self, s: &str) -> ConfResult<String> {
        Resolver::new(self).render("", s, &mut Vec::new())
    }

    // Writes

    /// Write `value` at `path` with the configured merge mode.
    ///
    /// `_file` nodes in `value` are expanded first. Already memoized
    /// singletons are kept.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> ConfResult<()> {
        self.set_with_mode(path, value, self.inner.merger.mode)
    }

    /// Write `value` at `path` with an explicit merge mode.
    pub fn set_with_mode(&self, path: &str, value: impl Into<Value>, mode: MergeMode) -> ConfResult<()> {
        let (path, mut value) = files::lift_file_key(path, value.into());
        let path = path.as_str();
        if files::has_file_refs(&value) {
            let target = path.trim_end_matches(keypath::FORCE_OVERRIDE);
            let spliced = files::expand_at(
                &mut value,
                target,
                &self.inner.base_dir,
                self.inner.source.as_ref(),
            )?;
            self.inner
                .file_sources
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(spliced);
        }

        let mut tree = self.inner.tree.write().unwrap_or_else(PoisonError::into_inner);
        let conflicts = self
            .inner
            .merger
            .set_with_mode(Arc::make_mut(&mut *tree), path, value, mode, "set")?;
        drop(tree);
        debug!(key = %path, mode = %mode, "Set configuration value");
        self.inner
            .conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(conflicts);
        Ok(())
    }

    // Whole-tree views

    /// Unresolved tree with active overlays applied. Reference strings and
    /// `_callable` nodes keep their written form.
    pub fn to_value(&self) -> Value {
        overlay::apply_all(&self.tree_snapshot(), &self.overlay_snapshot())
    }

    /// [`Conf::to_value`] restricted to `limit_keys` (all keys when empty),
    /// optionally flattened to `{"a.b": leaf}`.
    pub fn to_dict<S: AsRef<str>>(&self, limit_keys: &[S], flat: bool) -> Value {
        let mut tree = self.to_value();
        if !limit_keys.is_empty() {
            tree = keypath::with_keys(&tree, limit_keys);
        }
        if flat {
            tree = Value::Object(keypath::flatten(&tree).into_iter().collect::<Map<_, _>>());
        }
        tree
    }

    /// Save [`Conf::to_value`] without `except_keys` through the source collaborator.
    pub fn write_conf<S: AsRef<str>>(&self, locator: &Path, except_keys: &[S]) -> ConfResult<()> {
        let tree = keypath::strip_keys(&self.to_value(), except_keys);
        self.inner.source.save(locator, &tree)?;
        debug!(
            path = %locator.display(),
            keys = tree.as_object().map_or(0, Map::len),
            "Wrote configuration"
        );
        Ok(())
    }

    // Types

    pub fn types(&self) -> TypeTree {
        self.inner
            .types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_type(&self, path: &str) -> Option<TypeKind> {
        self.inner
            .types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
    }

    /// Check the base tree against the declared types.
    pub fn validate_types(&self) -> ConfResult<()> {
        let tree = self.tree_snapshot();
        self.inner
            .types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .validate(&tree)
    }

    /// Declare the runtime kind of every undeclared leaf; returns how many were added.
    pub fn set_missing_types(&self) -> ConfResult<usize> {
        let tree = self.tree_snapshot();
        self.inner
            .types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fill_missing(&tree)
    }

    // Provenance

    /// Patches applied after the base configuration, in order.
    pub fn conf_patches(&self) -> &[String] {
        &self.inner.conf_patches
    }

    /// Spliced key-paths and the files they came from.
    pub fn file_sources(&self) -> FileSources {
        self.inner
            .file_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every reported conflict so far, in order.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.inner
            .conflicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn merge_mode(&self) -> MergeMode {
        self.inner.merger.mode
    }

    pub fn is_strict(&self) -> bool {
        self.inner.merger.strict
    }

    /// Number of memoized singletons outside overlays.
    pub fn singleton_count(&self) -> usize {
        self.inner.singletons.len()
    }

    // Overlays

    /// Handle for another task: same configuration, own overlay stack.
    /// Same as [`Clone::clone`].
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Enter a scoped overlay. It stays active until the guard exits or drops.
    ///
    /// `_file` nodes in overlay values are expanded on entry.
    pub fn modified(&self, overlay: Overlay) -> ConfResult<OverlayGuard> {
        let mut expanded = Overlay::new();
        for (key, value) in overlay.into_entries() {
            let (key, mut value) = files::lift_file_key(&key, value);
            if files::has_file_refs(&value) {
                files::expand_at(&mut value, &key, &self.inner.base_dir, self.inner.source.as_ref())?;
            }
            expanded = expanded.set(&key, value)?;
        }
        Ok(OverlayGuard::enter(self, expanded))
    }

    /// Run `f` with `overlay` active; the overlay is removed even if `f` panics.
    pub fn with_overrides<R>(&self, overlay: Overlay, f: impl FnOnce(&Conf) -> R) -> ConfResult<R> {
        let guard = self.modified(overlay)?;
        let result = f(self);
        guard.exit()?;
        Ok(result)
    }

    /// Number of active overlays on this handle.
    pub fn overlay_depth(&self) -> usize {
        self.overlay_snapshot().len()
    }

    // Current configuration of a task

    /// Run `fut` with this configuration as the task's current one.
    ///
    /// The scope gets its own overlay stack, starting from the overlays
    /// active on this handle. Overlays entered inside the scope are not
    /// seen by other scopes, even ones bound to the same configuration.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self.fork(), fut).await
    }

    /// Run `f` with this configuration as the current one. The scope gets
    /// its own overlay stack, as with [`Conf::scope`].
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self.fork(), f)
    }

    /// The configuration bound by the innermost enclosing scope.
    ///
    /// Every handle returned within one scope shares that scope's overlay
    /// stack, so an overlay entered through one is visible through the others.
    pub fn current() -> Option<Conf> {
        CURRENT.try_with(Conf::share).ok()
    }

    // Internals

    pub(crate) fn tree_snapshot(&self) -> Arc<Value> {
        self.inner
            .tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn overlay_snapshot(&self) -> FrameStack {
        self.overlays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The overlay stack itself, for guards that restore it on exit.
    pub(crate) fn overlay_cell(&self) -> Arc<Mutex<FrameStack>> {
        self.overlays.clone()
    }

    /// Handle sharing this handle's overlay stack.
    fn share(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            overlays: self.overlays.clone(),
            frame_use: None,
        }
    }

    /// Handle for a constructor call: shares the overlay stack and reports
    /// overlay reads into `frame_use`.
    pub(crate) fn tracked(&self, frame_use: Arc<FrameUse>) -> Self {
        Self {
            inner: self.inner.clone(),
            overlays: self.overlays.clone(),
            frame_use: Some(frame_use),
        }
    }

    pub(crate) fn frame_use(&self) -> Option<Arc<FrameUse>> {
        self.frame_use.clone()
    }

    pub(crate) fn singletons(&self) -> &SingletonCache {
        &self.inner.singletons
    }
}
