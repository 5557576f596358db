//! Test case and dataset execution.

use crate::context::{VariableContext, CASE, GLOBALS};
use crate::error::Result as ConfigResult;
use crate::model::{CaseResult, JTestCase, JTestDataset};
use crate::step::{Runtime, StepResult};
use crate::token::resolve_value;
use serde_json::Value;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Runs test cases against a base context.
#[derive(Debug, Clone)]
pub struct CaseExecutor {
    runtime: Runtime,
}

impl CaseExecutor {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Run `case` once, or once per dataset in declaration order.
    ///
    /// `base` is never mutated except for `globals`, which receives the
    /// value left by the last run so later cases can build on it.
    #[instrument(skip_all, fields(case = %case.name))]
    pub async fn execute(&self, case: &JTestCase, base: &mut VariableContext) -> Vec<CaseResult> {
        if case.datasets.is_empty() {
            let mut ctx = base.clone();
            let result = self.run(case, None, &mut ctx).await;
            carry_globals(base, &ctx);
            return vec![result];
        }

        let snapshot = base.clone();
        let mut previous_globals: Option<Value> = None;
        let mut results = Vec::with_capacity(case.datasets.len());
        for dataset in &case.datasets {
            let mut ctx = match build_iteration_context(&snapshot, previous_globals.as_ref(), dataset) {
                Ok(ctx) => ctx,
                Err(e) => {
                    error!("Cannot prepare dataset '{}': {}", dataset.name, e);
                    results.push(CaseResult {
                        name: case.name.clone(),
                        dataset: Some(dataset.name.clone()),
                        success: false,
                        duration_ms: 0,
                        steps: Vec::new(),
                        error: Some(e.to_string()),
                        skipped: case.steps.len(),
                    });
                    continue;
                }
            };
            results.push(self.run(case, Some(dataset), &mut ctx).await);
            previous_globals = ctx.root(GLOBALS).cloned();
        }
        carry_globals_value(base, previous_globals);
        results
    }

    async fn run(
        &self,
        case: &JTestCase,
        dataset: Option<&JTestDataset>,
        ctx: &mut VariableContext,
    ) -> CaseResult {
        let start = Instant::now();
        let title = match dataset {
            Some(dataset) => format!("{} [{}]", case.name, dataset.name),
            None => case.name.clone(),
        };
        info!("Running test case {}", title);

        let mut steps: Vec<StepResult> = Vec::with_capacity(case.steps.len());
        let mut fault = None;
        let mut skipped = 0;
        for (idx, step) in case.steps.iter().enumerate() {
            let step_start = Instant::now();
            match step.execute(&self.runtime, ctx).await {
                Ok(result) => steps.push(result),
                Err(e) => {
                    error!("Step '{}' aborted test case {}: {:#}", step.label(), title, e);
                    steps.push(StepResult::fault(
                        step,
                        &e,
                        step_start.elapsed(),
                        ctx.take_diagnostics(),
                    ));
                    fault = Some(format!("{e:#}"));
                    skipped = case.steps.len() - idx - 1;
                    break;
                }
            }
        }

        if skipped > 0 {
            warn!("Skipped {} remaining step(s) of {}", skipped, title);
        }
        let success = fault.is_none() && steps.iter().all(|s| s.success);
        let result = CaseResult {
            name: case.name.clone(),
            dataset: dataset.map(|d| d.name.clone()),
            success,
            duration_ms: start.elapsed().as_millis() as u64,
            steps,
            error: fault,
            skipped,
        };
        info!(
            "Test case {} finished ({} ms) - Success: {}",
            title, result.duration_ms, result.success
        );
        result
    }
}

/// Build the context for one dataset run from the snapshot taken
/// before the first run.
///
/// `env` is shared with the snapshot. `globals` is the value left by
/// the previous run when there is one. Every other root is a fresh
/// copy of the snapshot, and `case` holds the dataset values with
/// their tokens resolved.
pub fn build_iteration_context(
    snapshot: &VariableContext,
    previous_globals: Option<&Value>,
    dataset: &JTestDataset,
) -> ConfigResult<VariableContext> {
    let mut ctx = snapshot.clone();
    if let Some(globals) = previous_globals {
        ctx.set_root(GLOBALS, globals.clone())?;
    }
    let values = resolve_value(&Value::Object(dataset.case.clone()), &ctx);
    ctx.set_root(CASE, values)?;
    Ok(ctx)
}

fn carry_globals(base: &mut VariableContext, finished: &VariableContext) {
    carry_globals_value(base, finished.root(GLOBALS).cloned());
}

fn carry_globals_value(base: &mut VariableContext, globals: Option<Value>) {
    if let Some(globals) = globals {
        if let Err(e) = base.set_root(GLOBALS, globals) {
            warn!("Cannot carry globals forward: {}", e);
        }
    }
}
