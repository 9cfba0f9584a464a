//! CLI command definitions for conftree
//!
//! The `Cli` struct carries the global source flags shared by every
//! subcommand. Configuration overrides follow a `--` separator, e.g.
//! `conftree show -- --nn.lr=0.01`.

use crate::loader::ConfLoader;
use crate::merge::MergeMode;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Merge mode as a command-line value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum MergeModeArg {
    /// Merge mappings recursively (default)
    #[default]
    DeepMerge,
    /// Replace the node at each written path
    Override,
}

impl From<MergeModeArg> for MergeMode {
    fn from(arg: MergeModeArg) -> Self {
        match arg {
            MergeModeArg::DeepMerge => MergeMode::DeepMerge,
            MergeModeArg::Override => MergeMode::Override,
        }
    }
}

/// Output format as a command-line value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FormatArg {
    #[default]
    Yaml,
    Json,
    Flat,
}

/// Hierarchical configuration resolver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding the base configuration and patches
    #[arg(short, long, global = true, value_name = "DIR")]
    pub conf_dir: Option<PathBuf>,

    /// Base configuration name, without extension
    #[arg(short, long, global = true, value_name = "NAME")]
    pub base: Option<String>,

    /// Configuration file to load instead of the base (repeatable)
    #[arg(short, long = "file", global = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,

    /// Patch names to merge over the base, in order
    #[arg(short, long = "patch", global = true, value_name = "NAME", value_delimiter = ',')]
    pub patches: Vec<String>,

    /// How overrides combine with existing values
    #[arg(short, long, value_enum, default_value_t = MergeModeArg::DeepMerge, global = true)]
    pub merge_mode: MergeModeArg,

    /// Fail on any conflicting write
    #[arg(long, global = true)]
    pub strict: bool,

    /// Ignore CONFTREE_* environment overrides
    #[arg(long, global = true)]
    pub no_env: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    /// Output format
    #[arg(long, value_enum, default_value_t = FormatArg::Yaml, global = true)]
    pub format: FormatArg,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the merged configuration (default if no subcommand given)
    Show {
        /// Key-paths to leave out
        #[arg(long, value_delimiter = ',')]
        except: Vec<String>,

        /// Key-paths to keep; everything else is left out
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,

        /// Print one line per leaf
        #[arg(long)]
        flat: bool,

        /// Overrides as --key=value
        #[arg(last = true)]
        overrides: Vec<String>,
    },

    /// Resolve one key-path and print it
    Get {
        /// Key-path to resolve; a leading `!` skips the singleton cache
        path: String,

        /// Overrides as --key=value
        #[arg(last = true)]
        overrides: Vec<String>,
    },

    /// Write the merged configuration to a file
    Write {
        /// Output file
        #[arg(value_name = "FILE")]
        output: PathBuf,

        /// Key-paths to leave out
        #[arg(long, value_delimiter = ',')]
        except: Vec<String>,

        /// Overrides as --key=value
        #[arg(last = true)]
        overrides: Vec<String>,
    },

    /// Print the declared types
    Types {
        /// Overrides as --key=value
        #[arg(last = true)]
        overrides: Vec<String>,
    },
}

impl Command {
    /// Trailing `--key=value` overrides of any subcommand.
    pub fn overrides(&self) -> &[String] {
        match self {
            Command::Show { overrides, .. }
            | Command::Get { overrides, .. }
            | Command::Write { overrides, .. }
            | Command::Types { overrides } => overrides,
        }
    }
}

impl Cli {
    /// Loader configured from the global flags and `overrides`.
    pub fn loader(&self, overrides: &[String]) -> ConfLoader {
        let mut loader = ConfLoader::new()
            .merge_mode(self.merge_mode.into())
            .strict(self.strict)
            .env_overrides(!self.no_env)
            .conf_patches(self.patches.iter().cloned())
            .cli_args(overrides.iter().cloned());
        if let Some(dir) = &self.conf_dir {
            loader = loader.conf_dir(dir);
        }
        if let Some(base) = &self.base {
            loader = loader.base_conf(base);
        }
        for file in &self.files {
            loader = loader.conf_file(file);
        }
        loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_show_with_overrides() {
        let cli = Cli::parse_from([
            "conftree", "--conf-dir", "cfg", "-p", "a,b", "show", "--flat", "--", "--k1=v1", "--k2", "v2",
        ]);
        assert_eq!(cli.conf_dir, Some(PathBuf::from("cfg")));
        assert_eq!(cli.patches, vec!["a", "b"]);
        let command = cli.command.unwrap();
        assert_eq!(command.overrides(), ["--k1=v1", "--k2", "v2"]);
        assert!(matches!(command, Command::Show { flat: true, .. }));
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::parse_from(["conftree"]);
        assert_eq!(cli.merge_mode, MergeModeArg::DeepMerge);
        assert_eq!(cli.log, "2");
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parse_get_and_merge_mode() {
        let cli = Cli::parse_from(["conftree", "--merge-mode", "override", "get", "nn.lr"]);
        assert_eq!(MergeMode::from(cli.merge_mode), MergeMode::Override);
        assert!(matches!(cli.command, Some(Command::Get { ref path, .. }) if path == "nn.lr"));
    }
}
