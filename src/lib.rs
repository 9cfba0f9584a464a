//! Hierarchical configuration resolver.
//!
//! A configuration is a tree of YAML-like data assembled from a base file,
//! named patches, `_file` splices, environment variables and command-line
//! overrides. Reads resolve `${path}` interpolations, `@name` symbols and
//! `_callable` constructions (memoized per key-path), optionally through a
//! stack of scoped overlays.
//!
//! ```ignore
//! let conf = ConfLoader::new().conf_dir("config").conf_patch("big").load()?;
//! let lr: f64 = conf.get_as("optim.lr")?;
//! ```

pub mod bind;
pub mod cli;
pub mod conf;
pub mod error;
pub mod files;
pub mod format;
pub mod keypath;
pub mod loader;
pub mod logging;
pub mod merge;
pub mod overlay;
pub mod overrides;
pub mod resolve;
pub mod source;
pub mod types;

pub use bind::{Binding, Param};
pub use conf::Conf;
pub use error::{ConfError, ConfResult, ErrorCode};
pub use loader::{ConfLoader, ConfPaths};
pub use merge::{Conflict, MergeMode};
pub use overlay::{Overlay, OverlayGuard};
pub use resolve::{Args, Callable, Instance, Registry, Resolved};
pub use source::{SourceError, SourceLoader, YamlSource};
pub use types::{TypeKind, TypeTree};
