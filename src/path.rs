//! Assignment target paths.
//!
//! Reads go through JSONPath (see [`crate::context`]); writes need a
//! concrete location, so `save` targets, template outputs and loop
//! bindings are parsed into a [`VariablePath`] instead.
//!
//! Accepted forms:
//!
//! ```text
//! $.ctx.user.id        explicit root
//! $['globals']['x']    bracket notation
//! globals.items[0]     known root without `$.`
//! orderId              bare name, stored under `ctx`
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Root every bare assignment target falls into.
pub const DEFAULT_ROOT: &str = "ctx";

/// Roots that may be addressed without the `$.` prefix.
pub const KNOWN_ROOTS: [&str; 5] = ["env", "globals", "ctx", "case", "this"];

/// One step below the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed write location inside a [`crate::VariableContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablePath {
    pub root: String,
    pub segments: Vec<Segment>,
}

impl VariablePath {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (explicit_root, body) = if let Some(rest) = trimmed.strip_prefix('$') {
            (true, rest.strip_prefix('.').unwrap_or(rest))
        } else {
            (false, trimmed)
        };

        let mut segments = parse_segments(body)
            .ok_or_else(|| Error::InvalidPath(input.to_string()))?;

        let root = match segments.first() {
            Some(Segment::Key(first))
                if explicit_root || KNOWN_ROOTS.contains(&first.as_str()) =>
            {
                let root = first.clone();
                segments.remove(0);
                root
            }
            Some(Segment::Key(_)) => DEFAULT_ROOT.to_string(),
            _ => return Err(Error::InvalidPath(input.to_string())),
        };

        Ok(Self { root, segments })
    }

    /// A path naming a single key directly below `root`.
    pub fn child(root: &str, key: &str) -> Self {
        Self {
            root: root.to_string(),
            segments: vec![Segment::Key(key.to_string())],
        }
    }
}

impl fmt::Display for VariablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$.{}", self.root)?;
        for segment in &self.segments {
            match segment {
                Segment::Key(key)
                    if !key.is_empty()
                        && key
                            .chars()
                            .all(|c| c.is_alphanumeric() || c == '_' || c == '-') =>
                {
                    write!(f, ".{key}")?
                }
                Segment::Key(key) => write!(f, "['{key}']")?,
                Segment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

fn parse_segments(body: &str) -> Option<Vec<Segment>> {
    let chars: Vec<char> = body.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                // `a..b` and trailing dots are not addressable
                if i + 1 >= chars.len() || chars[i + 1] == '.' || segments.is_empty() {
                    return None;
                }
                i += 1;
            }
            '[' => {
                let close = chars[i..].iter().position(|c| *c == ']')? + i;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();
                let quoted = inner.len() >= 2
                    && ((inner.starts_with('\'') && inner.ends_with('\''))
                        || (inner.starts_with('"') && inner.ends_with('"')));
                if quoted {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    segments.push(Segment::Index(inner.parse().ok()?));
                }
                i = close + 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                let key: String = chars[start..i].iter().collect();
                segments.push(Segment::Key(key.trim().to_string()));
            }
        }
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}
