//! `_file` expansion.
//!
//! A mapping node holding a `_file` key is replaced by the document the
//! key names, loaded through the [`SourceLoader`]. Keys written next to
//! `_file` are dropped (logged at warn level). Spliced content is scanned
//! again, so files may reference further files.

use crate::error::{ConfError, ConfResult};
use crate::keypath;
use crate::source::SourceLoader;
use crate::types::TYPES_SUFFIX;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Control key naming a file to splice in.
pub const FILE_KEY: &str = "_file";

/// Extension appended to file names given without one.
pub const DEFAULT_EXTENSION: &str = "yaml";

/// Maximum chain of files referencing files.
pub const MAX_FILE_DEPTH: usize = 64;

/// Spliced key-paths and the files they were loaded from, in splice order.
pub type FileSources = IndexMap<String, PathBuf>;

/// Locator for `name` relative to `base_dir`, with the default extension
/// when `name` has none.
pub fn locator(base_dir: &Path, name: &str) -> PathBuf {
    let path = base_dir.join(name);
    if path.extension().is_none() {
        path.with_extension(DEFAULT_EXTENSION)
    } else {
        path
    }
}

/// Type side-file for a configuration file: `shallow.yaml` -> `shallow_types.yaml`.
pub fn types_locator(locator: &Path) -> Option<PathBuf> {
    let stem = locator.file_stem()?.to_str()?;
    let mut name = format!("{}{}", stem, TYPES_SUFFIX);
    if let Some(ext) = locator.extension().and_then(|ext| ext.to_str()) {
        name.push('.');
        name.push_str(ext);
    }
    Some(locator.with_file_name(name))
}

/// Expand every `_file` node in `tree`.
pub fn expand(tree: &mut Value, base_dir: &Path, source: &dyn SourceLoader) -> ConfResult<FileSources> {
    expand_at(tree, "", base_dir, source)
}

/// Expand every `_file` node in `node`, which sits at `path` in its tree.
/// Returned key-paths are absolute.
pub fn expand_at(
    node: &mut Value,
    path: &str,
    base_dir: &Path,
    source: &dyn SourceLoader,
) -> ConfResult<FileSources> {
    let mut sources = FileSources::new();
    let mut expander = Expander {
        base_dir,
        source,
        sources: &mut sources,
    };
    expander.walk(node, path, 0)?;
    if !sources.is_empty() {
        debug!(count = sources.len(), "Expanded file references");
    }
    Ok(sources)
}

/// Move a trailing `_file` segment into the value: writing `name` at
/// `a.b._file` is writing `{_file: name}` at `a.b`.
pub fn lift_file_key(path: &str, value: Value) -> (String, Value) {
    let target = path.trim_end_matches(keypath::FORCE_OVERRIDE);
    let mut segments = keypath::split(target);
    if segments.len() < 2 || segments.last() != Some(&FILE_KEY) {
        return (path.to_string(), value);
    }
    segments.pop();
    let mut lifted = segments.join(".");
    if target.len() < path.len() {
        lifted.push(keypath::FORCE_OVERRIDE);
    }
    let mut node = Map::new();
    node.insert(FILE_KEY.to_string(), value);
    (lifted, Value::Object(node))
}

/// Whether `node` holds a `_file` key anywhere.
pub fn has_file_refs(node: &Value) -> bool {
    match node {
        Value::Object(map) => map.contains_key(FILE_KEY) || map.values().any(has_file_refs),
        Value::Array(items) => items.iter().any(has_file_refs),
        _ => false,
    }
}

struct Expander<'a> {
    base_dir: &'a Path,
    source: &'a dyn SourceLoader,
    sources: &'a mut FileSources,
}

impl Expander<'_> {
    fn walk(&mut self, node: &mut Value, path: &str, depth: usize) -> ConfResult<()> {
        match node {
            Value::Object(map) => {
                if let Some(file) = map.get(FILE_KEY).cloned() {
                    let dropped: Vec<String> = map.keys().filter(|k| *k != FILE_KEY).cloned().collect();
                    return self.splice(node, path, file, &dropped, depth);
                }
                for (key, child) in map.iter_mut() {
                    self.walk(child, &keypath::join(path, key), depth)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    self.walk(item, &keypath::join(path, &index.to_string()), depth)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn splice(
        &mut self,
        node: &mut Value,
        path: &str,
        file: Value,
        dropped: &[String],
        depth: usize,
    ) -> ConfResult<()> {
        if depth >= MAX_FILE_DEPTH {
            return Err(ConfError::nesting_too_deep(path, MAX_FILE_DEPTH));
        }
        let Some(name) = file.as_str().filter(|name| !name.is_empty()) else {
            return Err(ConfError::invalid_fragment(
                &format!("'{}'", keypath::join(path, FILE_KEY)),
                format!("'{}' must be a file name, found {}", FILE_KEY, file),
            ));
        };
        for key in dropped {
            warn!(
                key = %keypath::join(path, key),
                file = %name,
                "Dropping key written next to {}", FILE_KEY
            );
        }

        let locator = locator(self.base_dir, name);
        debug!(key = %path, file = %locator.display(), "Splicing file");
        *node = self.source.load(&locator)?;
        self.sources.insert(path.to_string(), locator);
        self.walk(node, path, depth + 1)
    }
}
