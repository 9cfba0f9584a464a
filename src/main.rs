//! conftree command line
//!
//! Loads a configuration the same way a program embedding the library
//! would and prints it.

use anyhow::Result;
use clap::Parser;
use conftree::cli::{Cli, Command, FormatArg};
use conftree::format::OutputFormat;
use conftree::keypath;
use conftree::logging::{LogTarget, init_logging};
use conftree::Conf;
use serde_json::Value;
use std::path::Path;
use tracing::info;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let target: LogTarget = cli.log.parse()?;
    init_logging(&target, cli.verbose)?;

    let overrides = cli.command.as_ref().map(Command::overrides).unwrap_or(&[]);
    let conf = cli.loader(overrides).load()?;
    let format = match cli.format {
        FormatArg::Yaml => OutputFormat::Yaml,
        FormatArg::Json => OutputFormat::Json,
        FormatArg::Flat => OutputFormat::Flat,
    };

    match &cli.command {
        Some(Command::Show {
            except, only, flat, ..
        }) => {
            let format = if *flat { OutputFormat::Flat } else { format };
            run_show(&conf, except, only, format)?;
        }
        None => run_show(&conf, &[], &[], format)?,
        Some(Command::Get { path, .. }) => run_get(&conf, path, format)?,
        Some(Command::Write { output, except, .. }) => run_write(&conf, output, except)?,
        Some(Command::Types { .. }) => {
            print!("{}", format.render(conf.types().as_value())?);
        }
    }
    Ok(())
}

/// Print the unresolved tree; references stay as written.
fn run_show(conf: &Conf, except: &[String], only: &[String], format: OutputFormat) -> Result<()> {
    let mut tree = keypath::strip_keys(&conf.to_value(), except);
    if !only.is_empty() {
        tree = keypath::with_keys(&tree, only);
    }
    print!("{}", format.render(&tree)?);
    Ok(())
}

/// Print the resolved value at `path`. Constructed objects print their registered name.
fn run_get(conf: &Conf, path: &str, format: OutputFormat) -> Result<()> {
    let resolved = conf.get(path)?;
    let value = resolved.to_value().unwrap_or_else(|| {
        Value::String(match (resolved.as_object(), resolved.as_callable()) {
            (Some(object), _) => format!("<object {}>", object.name()),
            (_, Some(callable)) => format!("<callable {}>", callable.name()),
            _ => "<unprintable>".to_string(),
        })
    });
    print!("{}", format.render(&value)?);
    Ok(())
}

fn run_write(conf: &Conf, output: &Path, except: &[String]) -> Result<()> {
    conf.write_conf(output, except)?;
    info!(file = %output.display(), "Configuration written");
    Ok(())
}
