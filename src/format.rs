//! Output formatting for the command line.

use crate::keypath;
use serde_json::Value;

/// Output format for printed configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
    /// One `key.path: value` line per leaf.
    Flat,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Some(OutputFormat::Yaml),
            "json" => Some(OutputFormat::Json),
            "flat" => Some(OutputFormat::Flat),
            _ => None,
        }
    }

    /// Render `value`. Output always ends with a newline.
    pub fn render(self, value: &Value) -> anyhow::Result<String> {
        let mut out = match self {
            OutputFormat::Yaml => serde_yaml::to_string(value)?,
            OutputFormat::Json => serde_json::to_string_pretty(value)?,
            OutputFormat::Flat => format_flat(value),
        };
        if !out.ends_with('\n') {
            out.push('\n');
        }
        Ok(out)
    }
}

/// Format leaves as `key.path: value` lines. Strings are printed bare.
pub fn format_flat(value: &Value) -> String {
    let leaves = keypath::flatten(value);
    if !value.is_object() || leaves.is_empty() {
        return format_scalar(value);
    }
    leaves
        .iter()
        .map(|(key, leaf)| format!("{}: {}", key, format_scalar(leaf)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
