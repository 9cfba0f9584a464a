//! Configuration loader.
//!
//! Builds a [`Conf`] from its sources, merging stage by stage into one tree:
//!
//! 1. base: in-memory fragments, else explicit files, else `<conf_dir>/<base_conf>.yaml`
//! 2. conf patches from `<conf_dir>`, in listed order
//! 3. explicit overrides
//! 4. environment overrides (`CONFTREE_*`)
//! 5. command-line overrides
//! 6. `_file` expansion
//! 7. command-line overrides again, coerced to their declared types
//!
//! Type declarations are then validated and missing ones inferred, and
//! registered validators run against the finished configuration.

use crate::conf::{Conf, ConfParts};
use crate::error::{ConfError, ConfResult};
use crate::files;
use crate::keypath;
use crate::merge::{Conflict, MergeMode, Merger};
use crate::overrides::{self, ENV_BASE_CONF, ENV_CONF_DIR};
use crate::resolve::Registry;
use crate::source::{SourceLoader, YamlSource};
use crate::types::TypeTree;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default directory holding the base configuration and patches.
pub const DEFAULT_CONF_DIR: &str = "config";

/// Default base configuration name.
pub const DEFAULT_BASE_CONF: &str = "_base";

/// Where configuration files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfPaths {
    pub conf_dir: PathBuf,
    pub base_conf: String,
}

impl Default for ConfPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfPaths {
    /// Discover paths from the process environment and defaults.
    pub fn discover() -> Self {
        Self::from_vars(process_env())
    }

    /// Discover paths from the given variables and defaults.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut paths = Self::with_dir(DEFAULT_CONF_DIR, DEFAULT_BASE_CONF);
        for (name, value) in vars {
            match name.as_ref() {
                ENV_CONF_DIR => paths.conf_dir = PathBuf::from(value.into()),
                ENV_BASE_CONF => paths.base_conf = value.into(),
                _ => {}
            }
        }
        paths
    }

    /// Create paths with explicit values (useful for testing).
    pub fn with_dir(conf_dir: impl Into<PathBuf>, base_conf: impl Into<String>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
            base_conf: base_conf.into(),
        }
    }

    pub fn base_locator(&self) -> PathBuf {
        files::locator(&self.conf_dir, &self.base_conf)
    }

    pub fn patch_locator(&self, name: &str) -> PathBuf {
        files::locator(&self.conf_dir, name)
    }
}

fn process_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

type Validator = Box<dyn Fn(&Conf) -> anyhow::Result<()> + Send + Sync>;

/// Builder for a [`Conf`].
pub struct ConfLoader {
    conf: Vec<Value>,
    conf_files: Vec<PathBuf>,
    conf_dir: Option<PathBuf>,
    base_conf: Option<String>,
    conf_patches: Vec<String>,
    overrides: Vec<Value>,
    merge_mode: MergeMode,
    strict: bool,
    types: Vec<Value>,
    env_overrides: bool,
    env_vars: Option<Vec<(String, String)>>,
    cli_args: Option<Vec<String>>,
    registry: Arc<Registry>,
    source: Arc<dyn SourceLoader>,
    validators: Vec<Validator>,
}

impl Default for ConfLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfLoader {
    pub fn new() -> Self {
        Self {
            conf: Vec::new(),
            conf_files: Vec::new(),
            conf_dir: None,
            base_conf: None,
            conf_patches: Vec::new(),
            overrides: Vec::new(),
            merge_mode: MergeMode::default(),
            strict: false,
            types: Vec::new(),
            env_overrides: true,
            env_vars: None,
            cli_args: None,
            registry: Arc::new(Registry::new()),
            source: Arc::new(YamlSource),
            validators: Vec::new(),
        }
    }

    /// Add an in-memory fragment. Fragments replace file sources.
    pub fn conf(mut self, fragment: Value) -> Self {
        self.conf.push(fragment);
        self
    }

    /// Add a configuration file, used when no in-memory fragment is given.
    pub fn conf_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf_files.push(path.into());
        self
    }

    pub fn conf_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.conf_dir = Some(dir.into());
        self
    }

    pub fn base_conf(mut self, name: impl Into<String>) -> Self {
        self.base_conf = Some(name.into());
        self
    }

    /// Add a named patch, loaded from the configuration directory.
    pub fn conf_patch(mut self, name: impl Into<String>) -> Self {
        self.conf_patches.push(name.into());
        self
    }

    pub fn conf_patches<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conf_patches.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add caller-supplied overrides, applied after patches.
    pub fn overrides(mut self, overrides: Value) -> Self {
        self.overrides.push(overrides);
        self
    }

    pub fn merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge_mode = mode;
        self
    }

    /// Make every conflicting write an error.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Add explicit type declarations. They merge before type side-files.
    pub fn types(mut self, declared: Value) -> Self {
        self.types.push(declared);
        self
    }

    /// Enable or disable environment overrides (enabled by default).
    pub fn env_overrides(mut self, enabled: bool) -> Self {
        self.env_overrides = enabled;
        self
    }

    /// Read overrides and reserved variables from `vars` instead of the process environment.
    pub fn env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Apply `--key=value` arguments. Not applied unless supplied.
    pub fn cli_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cli_args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn registry(mut self, registry: impl Into<Arc<Registry>>) -> Self {
        self.registry = registry.into();
        self
    }

    pub fn source(mut self, source: impl SourceLoader + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    /// Run `check` against the loaded configuration.
    pub fn validator<F>(mut self, check: F) -> Self
    where
        F: Fn(&Conf) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.validators.push(Box::new(check));
        self
    }

    /// Load and merge every source into a configuration.
    pub fn load(self) -> ConfResult<Conf> {
        let env = self.env_vars.clone().unwrap_or_else(process_env);
        let discovered = ConfPaths::from_vars(env.iter().map(|(k, v)| (k.as_str(), v.clone())));
        let paths = ConfPaths {
            conf_dir: self.conf_dir.clone().unwrap_or(discovered.conf_dir),
            base_conf: self.base_conf.clone().unwrap_or(discovered.base_conf),
        };

        let mut stage = Stage::new(Merger::new(self.merge_mode, self.strict));
        let source = self.source.as_ref();

        // Base configuration
        let base_dir = if !self.conf.is_empty() {
            for (index, fragment) in self.conf.iter().enumerate() {
                stage.apply(fragment.clone(), &format!("conf[{}]", index))?;
            }
            paths.conf_dir.clone()
        } else if !self.conf_files.is_empty() {
            for file in &self.conf_files {
                stage.apply_file(source, "", file)?;
            }
            self.conf_files[0]
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| paths.conf_dir.clone())
        } else {
            stage.apply_file(source, "", &paths.base_locator())?;
            paths.conf_dir.clone()
        };

        for name in &self.conf_patches {
            info!(patch = %name, "Applying conf patch");
            stage.apply_file(source, "", &paths.patch_locator(name))?;
        }

        for overrides in &self.overrides {
            stage.apply(overrides.clone(), "overrides")?;
        }

        let mut declared = TypeTree::new();
        for fragment in &self.types {
            declared.merge_at("", fragment.clone())?;
        }

        if self.env_overrides {
            let env_overrides = overrides::from_env(env.iter().map(|(k, v)| (k.as_str(), v.clone())));
            if !env_overrides.is_empty() {
                info!(count = env_overrides.len(), "Applying environment overrides");
            }
            for raw in &env_overrides {
                let value = overrides::coerce_hinted(raw, &declared, &stage.tree)?;
                stage.set(&raw.key, value, "environment")?;
            }
        }

        let cli_overrides = match &self.cli_args {
            Some(args) => overrides::from_args(args)?,
            None => Vec::new(),
        };
        if !cli_overrides.is_empty() {
            info!(count = cli_overrides.len(), "Applying command-line overrides");
        }
        for raw in &cli_overrides {
            let value = overrides::coerce_hinted(raw, &declared, &stage.tree)?;
            stage.set(&raw.key, value, "command line")?;
        }

        let file_sources = files::expand(&mut stage.tree, &base_dir, source)?;

        // Type declarations: explicit, then side-files of loaded files, then
        // side-files of spliced files at their splice path.
        let mut types = declared;
        let side_files = stage
            .loaded
            .iter()
            .map(|(path, locator)| (path.as_str(), locator.as_path()))
            .chain(file_sources.iter().map(|(path, locator)| (path.as_str(), locator.as_path())));
        for (path, locator) in side_files {
            load_side_types(source, &mut types, path, locator)?;
        }

        // Spliced files replace whole nodes, so command-line values written
        // below a `_file` node are applied once more, now with full types.
        for raw in cli_overrides.iter().filter(|raw| !raw.is_file_ref()) {
            let value = overrides::coerce_hinted(raw, &types, &stage.tree)?;
            keypath::write(&mut stage.tree, &raw.key, value, MergeMode::Override);
        }

        types.validate(&stage.tree)?;
        types.fill_missing(&stage.tree)?;

        let conf = Conf::assemble(ConfParts {
            tree: stage.tree,
            types,
            registry: self.registry,
            source: self.source,
            base_dir,
            merger: stage.merger,
            conf_patches: self.conf_patches,
            file_sources,
            conflicts: stage.conflicts,
        });

        for (index, check) in self.validators.iter().enumerate() {
            debug!(validator = index, "Running validator");
            check(&conf).map_err(|err| {
                ConfError::from(err).with_details(format!("validator #{}", index))
            })?;
        }

        info!(
            patches = conf.conf_patches().len(),
            files = conf.file_sources().len(),
            "Configuration loaded"
        );
        Ok(conf)
    }
}

/// Tree under construction plus what was recorded along the way.
struct Stage {
    merger: Merger,
    tree: Value,
    conflicts: Vec<Conflict>,
    /// Files merged at the root, for type side-file lookup.
    loaded: Vec<(String, PathBuf)>,
}

impl Stage {
    fn new(merger: Merger) -> Self {
        Self {
            merger,
            tree: Value::Object(Map::new()),
            conflicts: Vec::new(),
            loaded: Vec::new(),
        }
    }

    fn apply(&mut self, fragment: Value, source: &str) -> ConfResult<()> {
        let conflicts = self.merger.apply(&mut self.tree, fragment, source)?;
        self.conflicts.extend(conflicts);
        Ok(())
    }

    fn apply_file(&mut self, source: &dyn SourceLoader, path: &str, locator: &Path) -> ConfResult<()> {
        let fragment = source.load(locator)?;
        self.apply(fragment, &locator.display().to_string())?;
        self.loaded.push((path.to_string(), locator.to_path_buf()));
        Ok(())
    }

    fn set(&mut self, key: &str, value: Value, source: &str) -> ConfResult<()> {
        let conflicts = self.merger.set(&mut self.tree, key, value, source)?;
        self.conflicts.extend(conflicts);
        Ok(())
    }
}

fn load_side_types(
    source: &dyn SourceLoader,
    types: &mut TypeTree,
    path: &str,
    locator: &Path,
) -> ConfResult<()> {
    let Some(types_locator) = files::types_locator(locator) else {
        return Ok(());
    };
    if !source.exists(&types_locator) {
        return Ok(());
    }
    debug!(key = %path, file = %types_locator.display(), "Loading type declarations");
    types.merge_at(path, source.load(&types_locator)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::types::TypeKind;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn test_paths_from_vars() {
        let paths = ConfPaths::from_vars(vec![(ENV_CONF_DIR, "cfg"), (ENV_BASE_CONF, "main")]);
        assert_eq!(paths, ConfPaths::with_dir("cfg", "main"));
        assert_eq!(paths.base_locator(), PathBuf::from("cfg/main.yaml"));

        let defaults = ConfPaths::from_vars(Vec::<(String, String)>::new());
        assert_eq!(defaults, ConfPaths::with_dir("config", "_base"));
    }

    #[test]
    fn test_fragments_win_over_files() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "_base.yaml", "from_file: 1\n");
        let conf = ConfLoader::new()
            .conf_dir(temp.path())
            .conf(json!({"from_dict": 1}))
            .env_vars(no_env())
            .load()
            .unwrap();
        assert!(conf.contains("from_dict"));
        assert!(!conf.contains("from_file"));
    }

    #[test]
    fn test_base_and_patches_in_order() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "_base.yaml", "a: 1\nb: {c: 2, d: 3}\n");
        write(temp.path(), "p1.yaml", "b: {c: 20}\n");
        write(temp.path(), "p2.yaml", "b.d: 30\nb.c: 200\n");

        let conf = ConfLoader::new()
            .conf_dir(temp.path())
            .conf_patches(["p1", "p2"])
            .env_vars(no_env())
            .load()
            .unwrap();

        assert_eq!(conf.to_value(), json!({"a": 1, "b": {"c": 200, "d": 30}}));
        assert_eq!(conf.conf_patches(), ["p1".to_string(), "p2".to_string()]);
        assert_eq!(conf.conflicts().len(), 3);
    }

    #[test]
    fn test_missing_base_file_fails() {
        let temp = TempDir::new().unwrap();
        let err = ConfLoader::new()
            .conf_dir(temp.path())
            .env_vars(no_env())
            .load()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SourceError);
    }

    #[test]
    fn test_env_overrides_with_reserved_vars() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "main.yaml", "epochs: 10\nnn: {lr: 0.1}\n");

        let conf = ConfLoader::new()
            .env_vars(vec![
                (ENV_CONF_DIR.to_string(), temp.path().display().to_string()),
                (ENV_BASE_CONF.to_string(), "main".to_string()),
                ("CONFTREE_epochs".to_string(), "20".to_string()),
                ("CONFTREE_nn__lr".to_string(), "0.5".to_string()),
            ])
            .load()
            .unwrap();

        assert_eq!(conf.get("epochs").unwrap(), json!(20));
        assert_eq!(conf.get("nn.lr").unwrap(), json!(0.5));
    }

    #[test]
    fn test_env_overrides_can_be_disabled() {
        let conf = ConfLoader::new()
            .conf(json!({"epochs": 10}))
            .env_vars(vec![("CONFTREE_epochs", "20")])
            .env_overrides(false)
            .load()
            .unwrap();
        assert_eq!(conf.get("epochs").unwrap(), json!(10));
    }

    #[test]
    fn test_cli_overrides_coerced_by_side_file_types() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "_base.yaml", "nn:\n  _file: shallow\n");
        write(temp.path(), "shallow.yaml", "layers: [10]\nname: shallow\n");
        write(temp.path(), "shallow_types.yaml", "layers: list\nname: str\nsize: int\n");

        let conf = ConfLoader::new()
            .conf_dir(temp.path())
            .env_vars(no_env())
            .cli_args(["--nn.layers=[20, 15]", "--nn__size", "9"])
            .load()
            .unwrap();

        assert_eq!(conf.get("nn.layers").unwrap(), json!([20, 15]));
        assert_eq!(conf.get("nn.size").unwrap(), json!(9));
        assert_eq!(conf.get_type("nn.size"), Some(TypeKind::Int));
    }

    #[test]
    fn test_cli_selects_file() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "_base.yaml", "nn:\n  _file: shallow\n");
        write(temp.path(), "shallow.yaml", "depth: 1\n");
        write(temp.path(), "deep.yaml", "depth: 5\n");

        let conf = ConfLoader::new()
            .conf_dir(temp.path())
            .env_vars(no_env())
            .cli_args(["--nn._file=deep"])
            .load()
            .unwrap();

        assert_eq!(conf.get("nn.depth").unwrap(), json!(5));
        assert_eq!(conf.file_sources().get("nn"), Some(&temp.path().join("deep.yaml")));
    }

    #[test]
    fn test_type_validation_fails_load() {
        let err = ConfLoader::new()
            .conf(json!({"batch_size": "32"}))
            .types(json!({"batch_size": "int"}))
            .env_vars(no_env())
            .load()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
    }

    #[test]
    fn test_strict_load_rejects_conflicting_fragments() {
        let err = ConfLoader::new()
            .conf(json!({"a": 1}))
            .conf(json!({"a": 2}))
            .strict(true)
            .env_vars(no_env())
            .load()
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StrictConflict);
    }

    #[test]
    fn test_validators_run() {
        let err = ConfLoader::new()
            .conf(json!({"epochs": 0}))
            .env_vars(no_env())
            .validator(|conf| {
                let epochs: i64 = conf.get_as("epochs")?;
                anyhow::ensure!(epochs > 0, "epochs must be positive");
                Ok(())
            })
            .load()
            .unwrap_err();
        assert!(err.to_string().contains("epochs must be positive"));
        assert!(err.to_string().contains("validator #0"));
    }
}
