//! Step execution model.
//!
//! A [`Step`] is a variant payload (`http`, `wait`, `use`, ...) plus
//! the fields every step shares: `id`, `name`, `description`, the
//! `save` mapping and the `assert` list. Executing a step runs the
//! variant, applies `save`, then evaluates the assertions, so
//! assertions can see saved values.

use crate::assertion::{take_discriminator, Assertion, AssertionResult};
use crate::context::{ContextChanges, VariableContext};
use crate::http::HttpTransport;
use crate::path::VariablePath;
use crate::registry;
use crate::template::TemplateCatalog;
use crate::token::{has_tokens, resolve_string, resolve_value};
use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Collaborators available to every step while it runs.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub transport: Arc<dyn HttpTransport>,
    pub templates: TemplateCatalog,
    /// Directory relative file references are resolved against.
    pub base_dir: PathBuf,
}

impl Runtime {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            templates: TemplateCatalog::default(),
            base_dir: PathBuf::from("."),
        }
    }

    pub fn with_templates(mut self, templates: TemplateCatalog) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn resolve_file(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

/// Variant behaviour of a step.
#[async_trait]
pub trait StepBehavior: fmt::Debug + Send + Sync {
    /// Run the variant. `Err` is a fault that aborts the rest of the
    /// test case; an unsuccessful outcome is an ordinary failure.
    async fn execute(&self, rt: &Runtime, ctx: &mut VariableContext) -> Result<StepOutcome>;
}

/// Marker for step variants that can be built from a JSON document.
pub trait StepType: StepBehavior + DeserializeOwned + 'static {
    const DISCRIMINATOR: Option<&'static str> = None;
}

/// What a variant reports back to the shared step lifecycle.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<Value>,
    pub inner: Vec<StepResult>,
    /// Writes the variant made to the caller's context.
    pub changes: ContextChanges,
}

impl StepOutcome {
    pub fn passed() -> Self {
        Self {
            success: true,
            error: None,
            details: None,
            inner: Vec::new(),
            changes: ContextChanges::default(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::passed()
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach child results. The outcome fails when any child failed.
    pub fn with_inner(mut self, inner: Vec<StepResult>) -> Self {
        let failed = inner.iter().filter(|r| !r.success).count();
        if failed > 0 {
            self.success = false;
            self.error
                .get_or_insert_with(|| format!("{failed} inner step(s) failed"));
        }
        self.inner = inner;
        self
    }

    pub fn with_changes(mut self, changes: ContextChanges) -> Self {
        self.changes = changes;
        self
    }
}

/// Result of one step execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub assertions: Vec<AssertionResult>,
    pub changes: ContextChanges,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inner: Vec<StepResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl StepResult {
    /// A step that raised a fault instead of completing.
    pub fn fault(step: &Step, error: &anyhow::Error, elapsed: Duration, logs: Vec<String>) -> Self {
        Self {
            id: step.id.clone(),
            name: step.label(),
            kind: step.kind.clone(),
            success: false,
            error: Some(format!("{error:#}")),
            duration_ms: elapsed.as_millis() as u64,
            assertions: Vec::new(),
            changes: ContextChanges::default(),
            details: None,
            inner: Vec::new(),
            logs,
        }
    }

    /// A synthetic entry grouping the results of one loop iteration.
    pub fn iteration(index: usize, elapsed: Duration, inner: Vec<StepResult>) -> Self {
        let success = inner.iter().all(|r| r.success);
        Self {
            id: None,
            name: format!("iteration {index}"),
            kind: "iteration".to_string(),
            success,
            error: None,
            duration_ms: elapsed.as_millis() as u64,
            assertions: Vec::new(),
            changes: ContextChanges::default(),
            details: None,
            inner,
            logs: Vec::new(),
        }
    }

    /// Failed assertions of this step and all nested steps.
    pub fn failed_assertions(&self) -> Vec<&AssertionResult> {
        let mut failed: Vec<&AssertionResult> =
            self.assertions.iter().filter(|a| !a.success).collect();
        for child in &self.inner {
            failed.extend(child.failed_assertions());
        }
        failed
    }
}

pub struct Step {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub assert: Vec<Assertion>,
    /// Target path → value expression, applied in order.
    pub save: IndexMap<String, Value>,
    kind: String,
    behavior: Box<dyn StepBehavior>,
}

impl Step {
    /// Canonical discriminator of the variant.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn behavior(&self) -> &dyn StepBehavior {
        self.behavior.as_ref()
    }

    /// Name used in results and logs: `name`, then `id`, then the
    /// discriminator.
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.id.clone())
            .unwrap_or_else(|| self.kind.clone())
    }

    pub async fn execute(&self, rt: &Runtime, ctx: &mut VariableContext) -> Result<StepResult> {
        let start = Instant::now();
        let label = self.label();
        debug!("Running {} step '{}'", self.kind, label);

        let outcome = self
            .behavior
            .execute(rt, ctx)
            .await
            .with_context(|| format!("{} step '{}' failed", self.kind, label))?;

        let mut changes = outcome.changes;
        for (target, expr) in &self.save {
            let target = if has_tokens(target) {
                resolve_string(target, ctx)
            } else {
                target.clone()
            };
            let path = VariablePath::parse(&target)
                .with_context(|| format!("invalid save target in step '{label}'"))?;
            let value = resolve_value(expr, ctx);
            let change = ctx.set_path(&path, value)?;
            debug!("Saved {} ({:?})", path, change);
            changes.record(&path, change);
        }

        let assertions: Vec<AssertionResult> =
            self.assert.iter().map(|a| a.execute(ctx)).collect();
        let failed = assertions.iter().filter(|a| !a.success).count();

        let success = outcome.success && failed == 0;
        let error = outcome
            .error
            .or_else(|| (failed > 0).then(|| format!("{failed} assertion(s) failed")));
        if !success {
            warn!(
                "Step '{}' failed: {}",
                label,
                error.as_deref().unwrap_or("unknown error")
            );
        }

        Ok(StepResult {
            id: self.id.clone(),
            name: label,
            kind: self.kind.clone(),
            success,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
            assertions,
            changes,
            details: outcome.details,
            inner: outcome.inner,
            logs: ctx.take_diagnostics(),
        })
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("type", &self.kind)
            .field("id", &self.id)
            .field("name", &self.name)
            .field("behavior", &self.behavior)
            .field("save", &self.save)
            .field("assert", &self.assert)
            .finish()
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;
        let kind = take_discriminator(&mut fields, "step").map_err(D::Error::custom)?;

        let id = take_field::<Option<String>, D>(&mut fields, "id")?;
        let name = take_field::<Option<String>, D>(&mut fields, "name")?;
        let description = take_field::<Option<String>, D>(&mut fields, "description")?;
        let assert = take_field::<Option<Vec<Assertion>>, D>(&mut fields, "assert")?;
        let save = take_field::<Option<IndexMap<String, Value>>, D>(&mut fields, "save")?;

        let kind = registry::step_discriminator(&kind).map_err(D::Error::custom)?;
        let behavior = registry::construct_step(&kind, fields).map_err(D::Error::custom)?;

        Ok(Self {
            id,
            name,
            description,
            assert: assert.unwrap_or_default(),
            save: save.unwrap_or_default(),
            kind,
            behavior,
        })
    }
}

fn take_field<'de, T, D>(
    fields: &mut Map<String, Value>,
    key: &str,
) -> std::result::Result<T, D::Error>
where
    T: DeserializeOwned + Default,
    D: Deserializer<'de>,
{
    match fields.shift_remove(key) {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| D::Error::custom(format!("field '{key}': {e}"))),
        None => Ok(T::default()),
    }
}

/// Run `steps` in order against `ctx`. A fault in any step stops the
/// sequence and is returned; ordinary failures do not.
pub async fn run_steps(
    steps: &[Step],
    rt: &Runtime,
    ctx: &mut VariableContext,
) -> Result<Vec<StepResult>> {
    let mut results = Vec::with_capacity(steps.len());
    for step in steps {
        results.push(step.execute(rt, ctx).await?);
    }
    Ok(results)
}
