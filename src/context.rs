//! The variable namespace a test case runs against.
//!
//! A context holds named roots (`env`, `globals`, `ctx`, `case`,
//! `this`, plus any custom root) whose values are plain JSON trees.
//! Because every value is a [`serde_json::Value`], cloning a context
//! is always a full structural copy; the only shared piece is `env`,
//! which is read-only and held behind an [`Arc`].

use crate::error::{Error, Result};
use crate::path::{Segment, VariablePath};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub const ENV: &str = "env";
pub const GLOBALS: &str = "globals";
pub const CTX: &str = "ctx";
pub const CASE: &str = "case";
pub const THIS: &str = "this";

/// Largest array index a write may create.
pub const MAX_ARRAY_INDEX: usize = 10_000;

/// Outcome of a single write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Modified,
}

/// Paths a step added or modified, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextChanges {
    pub added: Vec<String>,
    pub modified: Vec<String>,
}

impl ContextChanges {
    pub fn record(&mut self, path: &VariablePath, change: Change) {
        let path = path.to_string();
        let bucket = match change {
            Change::Added => &mut self.added,
            Change::Modified => &mut self.modified,
        };
        if !bucket.contains(&path) {
            bucket.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty()
    }
}

#[derive(Debug)]
pub struct VariableContext {
    env: Arc<Value>,
    roots: IndexMap<String, Value>,
    diagnostics: Mutex<Vec<String>>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::with_env(Arc::new(Value::Object(Map::new())))
    }

    /// Create a context sharing an existing `env` tree.
    pub fn with_env(env: Arc<Value>) -> Self {
        let mut roots = IndexMap::new();
        roots.insert(GLOBALS.to_string(), Value::Object(Map::new()));
        roots.insert(CTX.to_string(), Value::Object(Map::new()));
        Self {
            env,
            roots,
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn env(&self) -> &Arc<Value> {
        &self.env
    }

    pub fn root(&self, name: &str) -> Option<&Value> {
        if name == ENV {
            return Some(self.env.as_ref());
        }
        self.roots.get(name)
    }

    /// Names of all mutable roots, in insertion order.
    pub fn root_names(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    pub fn set_root(&mut self, name: &str, value: Value) -> Result<()> {
        if name == ENV {
            return Err(Error::ReadOnlyRoot(name.to_string()));
        }
        self.roots.insert(name.to_string(), value);
        Ok(())
    }

    /// Drop a root. `globals` and `ctx` are reset to an empty object
    /// instead of disappearing.
    pub fn remove_root(&mut self, name: &str) -> Option<Value> {
        if name == GLOBALS || name == CTX {
            return self
                .roots
                .insert(name.to_string(), Value::Object(Map::new()));
        }
        self.roots.shift_remove(name)
    }

    pub fn get_path(&self, path: &VariablePath) -> Option<&Value> {
        let mut current = self.root(&path.root)?;
        for segment in &path.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at `path`, creating intermediate objects as
    /// needed. Scalars in the way are replaced. Indices above
    /// [`MAX_ARRAY_INDEX`] are rejected.
    pub fn set_path(&mut self, path: &VariablePath, value: Value) -> Result<Change> {
        if path.root == ENV {
            return Err(Error::ReadOnlyRoot(path.root.clone()));
        }
        let out_of_range = path
            .segments
            .iter()
            .any(|s| matches!(s, Segment::Index(idx) if *idx > MAX_ARRAY_INDEX));
        if out_of_range {
            return Err(Error::InvalidPath(path.to_string()));
        }
        let existed = self.get_path(path).is_some();
        let root = self
            .roots
            .entry(path.root.clone())
            .or_insert_with(|| Value::Object(Map::new()));

        let Some((last, parents)) = path.segments.split_last() else {
            *root = value;
            return Ok(if existed { Change::Modified } else { Change::Added });
        };

        let mut current = root;
        for (segment, next) in parents.iter().zip(path.segments.iter().skip(1)) {
            current = descend(current, segment, matches!(next, Segment::Index(_)));
        }
        match last {
            Segment::Key(key) => {
                ensure_object(current).insert(key.clone(), value);
            }
            Segment::Index(idx) => {
                *slot_at(ensure_array(current), *idx) = value;
            }
        }

        Ok(if existed { Change::Modified } else { Change::Added })
    }

    pub fn remove_path(&mut self, path: &VariablePath) -> Option<Value> {
        let (last, parents) = path.segments.split_last()?;
        let mut current = self.roots.get_mut(&path.root)?;
        for segment in parents {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get_mut(key)?,
                (Segment::Index(idx), Value::Array(items)) => items.get_mut(*idx)?,
                _ => return None,
            };
        }
        match (last, current) {
            (Segment::Key(key), Value::Object(map)) => map.shift_remove(key),
            (Segment::Index(idx), Value::Array(items)) if *idx < items.len() => {
                Some(items.remove(*idx))
            }
            _ => None,
        }
    }

    /// Evaluate a JSONPath expression (`$.ctx.items[*].id`) and
    /// return every match. An empty result means the path was not
    /// found.
    pub fn query(&self, expr: &str) -> std::result::Result<Vec<Value>, String> {
        let expr = expr.trim();
        if !expr.starts_with('$') {
            return Err(format!("path '{expr}' must start with '$'"));
        }

        let selected: std::result::Result<Vec<Value>, _> = match split_root(expr) {
            Some((root, tail)) => {
                let Some(value) = self.root(root) else {
                    return Ok(Vec::new());
                };
                jsonpath_lib::select(value, &format!("${tail}"))
                    .map(|found| found.into_iter().cloned().collect())
            }
            None => {
                let tree = self.snapshot();
                jsonpath_lib::select(&tree, expr)
                    .map(|found| found.into_iter().cloned().collect())
            }
        };

        selected.map_err(|e| format!("invalid path '{expr}': {e:?}"))
    }

    /// The whole namespace as one JSON object.
    pub fn snapshot(&self) -> Value {
        let mut tree = Map::new();
        tree.insert(ENV.to_string(), self.env.as_ref().clone());
        for (name, value) in &self.roots {
            tree.insert(name.clone(), value.clone());
        }
        Value::Object(tree)
    }

    /// A context for a template invocation: shares `env`, copies
    /// `globals`, and starts with an empty `ctx`.
    pub fn isolated(&self) -> Self {
        let mut sub = Self::with_env(Arc::clone(&self.env));
        if let Some(globals) = self.roots.get(GLOBALS) {
            sub.roots.insert(GLOBALS.to_string(), globals.clone());
        }
        sub
    }

    /// Append a line to the execution log of the running step.
    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        warn!("{line}");
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    pub fn take_diagnostics(&self) -> Vec<String> {
        std::mem::take(
            &mut *self
                .diagnostics
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl Default for VariableContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for VariableContext {
    /// Structural copy of every mutable root; `env` stays shared and
    /// the diagnostic log starts empty.
    fn clone(&self) -> Self {
        Self {
            env: Arc::clone(&self.env),
            roots: self.roots.clone(),
            diagnostics: Mutex::new(Vec::new()),
        }
    }
}

/// Split `$.root.rest` into `("root", ".rest")`. Returns `None` for
/// expressions that do not start with a plain root name, such as
/// `$..id` or `$[*]`.
fn split_root(expr: &str) -> Option<(&str, &str)> {
    let body = expr.strip_prefix("$.")?;
    let end = body
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(body.len());
    if end == 0 {
        return None;
    }
    Some((&body[..end], &body[end..]))
}

fn descend<'a>(current: &'a mut Value, segment: &Segment, next_is_index: bool) -> &'a mut Value {
    let empty = || {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        }
    };
    match segment {
        Segment::Key(key) => {
            let slot = ensure_object(current)
                .entry(key.clone())
                .or_insert_with(empty);
            if slot.is_null() {
                *slot = empty();
            }
            slot
        }
        Segment::Index(idx) => {
            let slot = slot_at(ensure_array(current), *idx);
            if slot.is_null() {
                *slot = empty();
            }
            slot
        }
    }
}

/// Pad `items` with nulls up to `idx` and return that slot.
fn slot_at(items: &mut Vec<Value>, idx: usize) -> &mut Value {
    let len = idx.checked_add(1).unwrap_or(usize::MAX);
    if items.len() < len {
        items.resize(len, Value::Null);
    }
    &mut items[idx]
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn ensure_array(value: &mut Value) -> &mut Vec<Value> {
    if !value.is_array() {
        *value = Value::Array(Vec::new());
    }
    match value {
        Value::Array(items) => items,
        _ => unreachable!("value was just replaced with an array"),
    }
}
