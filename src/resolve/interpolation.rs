//! Parsing of `${...}` interpolations and `@name` references.

use crate::keypath;
use regex_lite::Regex;
use std::sync::LazyLock;

static INTERPOLATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^{}]*)\}").expect("interpolation pattern is valid"));

/// Marker opening an interpolation.
pub const OPEN: &str = "${";

/// Prefix of a registry reference.
pub const REFERENCE_PREFIX: char = '@';

/// Suffix turning a reference into a construction.
pub const CALL_SUFFIX: &str = "()";

/// Inner text when `s` is exactly one interpolation, e.g. `${a.b}` -> `a.b`.
pub fn whole(s: &str) -> Option<&str> {
    let captures = INTERPOLATION.captures(s)?;
    let outer = captures.get(0)?;
    if outer.start() == 0 && outer.end() == s.len() {
        captures.get(1).map(|inner| inner.as_str())
    } else {
        None
    }
}

/// Whether `s` contains an interpolation anywhere.
pub fn contains(s: &str) -> bool {
    INTERPOLATION.is_match(s)
}

/// Every interpolation in `s` as `(outer, inner)` pairs, in order.
pub fn occurrences(s: &str) -> Vec<(&str, &str)> {
    INTERPOLATION
        .captures_iter(s)
        .filter_map(|c| Some((c.get(0)?.as_str(), c.get(1)?.as_str())))
        .collect()
}

/// Absolute key-path addressed by `inner` when read from `current`.
///
/// A run of N leading dots strips N trailing segments from `current`
/// before appending the rest; no leading dot means an absolute path.
pub fn target_path(current: &str, inner: &str) -> Result<String, String> {
    let inner = inner.trim();
    let rest = inner.trim_start_matches(keypath::SEPARATOR);
    let dots = inner.len() - rest.len();
    if dots == 0 {
        return Ok(rest.to_string());
    }
    let base = keypath::strip_trailing(current, dots).ok_or_else(|| {
        format!(
            "'${{{}}}' climbs {} levels from '{}', above the root",
            inner, dots, current
        )
    })?;
    Ok(keypath::join(&base, rest))
}

/// Parsed `@...` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference<'a> {
    /// `@name`: the registered symbol itself.
    Symbol(&'a str),
    /// `@name()`: a zero-argument construction.
    Construct(&'a str),
}

impl<'a> Reference<'a> {
    pub fn name(&self) -> &'a str {
        match *self {
            Reference::Symbol(name) | Reference::Construct(name) => name,
        }
    }
}

/// Parse a string starting with `@`. Returns `None` for other strings.
pub fn parse_reference(s: &str) -> Option<Result<Reference<'_>, String>> {
    let body = s.strip_prefix(REFERENCE_PREFIX)?;
    let (name, construct) = match body.strip_suffix(CALL_SUFFIX) {
        Some(name) => (name, true),
        None => (body, false),
    };
    if name.is_empty() {
        return Some(Err(format!("'{}' names no symbol", s)));
    }
    if name.contains(char::is_whitespace) || name.contains(['(', ')']) {
        return Some(Err(format!(
            "'{}' is not a valid reference; use '@name' or '@name()'",
            s
        )));
    }
    Some(Ok(if construct {
        Reference::Construct(name)
    } else {
        Reference::Symbol(name)
    }))
}
