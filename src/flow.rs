//! Control flow steps: `wait`, `assert`, `for` and `while`.

use crate::assertion::{describe_type, Assertion};
use crate::context::VariableContext;
use crate::path::VariablePath;
use crate::registry::{Steps, TypeDescriptor, BUILTIN_STEPS};
use crate::step::{run_steps, Runtime, Step, StepBehavior, StepOutcome, StepResult, StepType};
use crate::token::{resolve_value, stringify};
use anyhow::{bail, Result};
use async_trait::async_trait;
use linkme::distributed_slice;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

/// Suspends the running case for `ms` milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct WaitStep {
    #[serde(alias = "duration")]
    pub ms: Value,
}

impl StepType for WaitStep {}

#[distributed_slice(BUILTIN_STEPS)]
static REGISTER_WAIT: fn() -> TypeDescriptor<Steps> = TypeDescriptor::<Steps>::of::<WaitStep>;

#[async_trait]
impl StepBehavior for WaitStep {
    async fn execute(&self, _rt: &Runtime, ctx: &mut VariableContext) -> Result<StepOutcome> {
        let ms = millis(&resolve_value(&self.ms, ctx), "wait duration")?;
        debug!("Waiting {} ms", ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(StepOutcome::passed().with_details(json!({ "ms": ms })))
    }
}

/// Only evaluates the step's `assert` list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssertStep {}

impl StepType for AssertStep {}

#[distributed_slice(BUILTIN_STEPS)]
static REGISTER_ASSERT: fn() -> TypeDescriptor<Steps> = TypeDescriptor::<Steps>::of::<AssertStep>;

#[async_trait]
impl StepBehavior for AssertStep {
    async fn execute(&self, _rt: &Runtime, _ctx: &mut VariableContext) -> Result<StepOutcome> {
        Ok(StepOutcome::passed())
    }
}

/// Runs `steps` once per element of `items`.
///
/// The current element and its index are bound at
/// `currentItemKey`/`currentIndexKey` (bare names land in `ctx`)
/// for the duration of the loop and restored afterwards. Objects are
/// iterated as `{key, value}` pairs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForLoopStep {
    pub items: Value,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default = "default_item_key")]
    pub current_item_key: String,
    #[serde(default = "default_index_key")]
    pub current_index_key: String,
}

fn default_item_key() -> String {
    "item".to_string()
}

fn default_index_key() -> String {
    "index".to_string()
}

impl StepType for ForLoopStep {
    const DISCRIMINATOR: Option<&'static str> = Some("for");
}

#[distributed_slice(BUILTIN_STEPS)]
static REGISTER_FOR_LOOP: fn() -> TypeDescriptor<Steps> = TypeDescriptor::<Steps>::of::<ForLoopStep>;

#[async_trait]
impl StepBehavior for ForLoopStep {
    async fn execute(&self, rt: &Runtime, ctx: &mut VariableContext) -> Result<StepOutcome> {
        let items = match resolve_value(&self.items, ctx) {
            Value::Array(items) => items,
            Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect(),
            // a path that matched nothing
            Value::Null => Vec::new(),
            Value::String(s) if s.is_empty() => Vec::new(),
            other => bail!(
                "'items' must resolve to an array, got {} '{}'",
                describe_type(&other),
                stringify(&other)
            ),
        };

        let item_path = VariablePath::parse(&self.current_item_key)?;
        let index_path = VariablePath::parse(&self.current_index_key)?;
        let saved_item = ctx.get_path(&item_path).cloned();
        let saved_index = ctx.get_path(&index_path).cloned();

        let count = items.len();
        let mut inner = Vec::with_capacity(count);
        let mut fault = None;
        for (index, item) in items.into_iter().enumerate() {
            debug!("Loop iteration {}/{}", index + 1, count);
            ctx.set_path(&item_path, item)?;
            ctx.set_path(&index_path, json!(index))?;

            let start = Instant::now();
            match run_steps(&self.steps, rt, ctx).await {
                Ok(results) => inner.push(StepResult::iteration(index, start.elapsed(), results)),
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }
        }

        restore(ctx, &item_path, saved_item)?;
        restore(ctx, &index_path, saved_index)?;
        if let Some(e) = fault {
            return Err(e);
        }

        Ok(StepOutcome::passed()
            .with_details(json!({ "iterations": count }))
            .with_inner(inner))
    }
}

fn restore(ctx: &mut VariableContext, path: &VariablePath, previous: Option<Value>) -> Result<()> {
    match previous {
        Some(value) => {
            ctx.set_path(path, value)?;
        }
        None => {
            ctx.remove_path(path);
        }
    }
    Ok(())
}

/// Runs `steps` while `condition` holds, for at most `timeoutMs`
/// milliseconds of wall-clock time. A round still running at the
/// deadline is cancelled.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhileStep {
    pub condition: Assertion,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default = "default_timeout")]
    pub timeout_ms: Value,
}

fn default_timeout() -> Value {
    json!(30_000)
}

impl StepType for WhileStep {}

#[distributed_slice(BUILTIN_STEPS)]
static REGISTER_WHILE: fn() -> TypeDescriptor<Steps> = TypeDescriptor::<Steps>::of::<WhileStep>;

#[async_trait]
impl StepBehavior for WhileStep {
    async fn execute(&self, rt: &Runtime, ctx: &mut VariableContext) -> Result<StepOutcome> {
        let timeout = millis(&resolve_value(&self.timeout_ms, ctx), "while timeout")?;
        let start = Instant::now();
        let deadline = start + Duration::from_millis(timeout);

        let mut inner = Vec::new();
        let mut iterations = 0usize;
        loop {
            let check = self.condition.execute(ctx);
            if !check.success {
                debug!("While condition ended after {} iteration(s)", iterations);
                return Ok(StepOutcome::passed()
                    .with_details(json!({ "iterations": iterations, "condition": check.redacted() }))
                    .with_inner(inner));
            }
            if Instant::now() >= deadline {
                return Ok(StepOutcome::failed(format!(
                    "condition still true after {timeout} ms ({iterations} iteration(s))"
                ))
                .with_details(json!({ "iterations": iterations, "condition": check.redacted() }))
                .with_inner(inner));
            }

            let round = Instant::now();
            let Ok(results) =
                tokio::time::timeout_at(deadline.into(), run_steps(&self.steps, rt, ctx)).await
            else {
                debug!("While round {} cancelled at the deadline", iterations);
                return Ok(StepOutcome::failed(format!(
                    "condition still true after {timeout} ms ({iterations} iteration(s))"
                ))
                .with_details(json!({ "iterations": iterations }))
                .with_inner(inner));
            };
            let results = results?;
            if !results.is_empty() {
                inner.push(StepResult::iteration(iterations, round.elapsed(), results));
            }
            iterations += 1;
            tokio::task::yield_now().await;
        }
    }
}

/// Non-negative millisecond count from a number or numeric string.
fn millis(value: &Value, what: &str) -> Result<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(ms) if ms.is_finite() && ms >= 0.0 => Ok(ms.round() as u64),
        _ => bail!("invalid {what} '{}'", stringify(value)),
    }
}
