//! Run reports.

use crate::model::{CaseResult, SuiteResult};
use crate::step::StepResult;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Renders suite results into a document.
pub trait Reporter: Send + Sync {
    fn render(&self, results: &[SuiteResult]) -> Result<String>;

    /// File extension without the dot.
    fn extension(&self) -> &'static str;

    /// Render and write `jtest-report-<timestamp>.<ext>` into `dir`.
    fn write_to(&self, dir: &Path, results: &[SuiteResult]) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create report directory: {}", dir.display()))?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("jtest-report-{stamp}.{}", self.extension()));
        fs::write(&path, self.render(results)?)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!("Report written to {}", path.display());
        Ok(path)
    }
}

/// Markdown report: a summary table, then one section per suite with
/// a step table per case and the details of failed assertions.
#[derive(Debug, Clone, Default)]
pub struct MarkdownReporter {
    generated_at: Option<DateTime<Utc>>,
}

impl MarkdownReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the timestamp printed in the header.
    pub fn at(generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at: Some(generated_at),
        }
    }

    fn case_section(out: &mut String, case: &CaseResult) -> std::fmt::Result {
        writeln!(
            out,
            "### {} {} ({} ms)\n",
            icon(case.success),
            escape(&case.title()),
            case.duration_ms
        )?;
        if let Some(error) = &case.error {
            writeln!(out, "> **Error:** {}\n", escape(error))?;
        }
        if case.steps.is_empty() {
            return Ok(());
        }

        writeln!(out, "| # | Step | Type | Result | Duration |")?;
        writeln!(out, "|---|------|------|--------|----------|")?;
        for (idx, step) in case.steps.iter().enumerate() {
            writeln!(
                out,
                "| {} | {} | {} | {} | {} ms |",
                idx + 1,
                escape(&step.name),
                step.kind,
                icon(step.success),
                step.duration_ms
            )?;
        }
        if case.skipped > 0 {
            writeln!(out, "\n_{} step(s) skipped_", case.skipped)?;
        }
        writeln!(out)?;

        for step in case.steps.iter().filter(|s| !s.success) {
            Self::failure_details(out, step)?;
        }
        Ok(())
    }

    fn failure_details(out: &mut String, step: &StepResult) -> std::fmt::Result {
        writeln!(out, "<details><summary>{}</summary>\n", escape(&step.name))?;
        if let Some(error) = &step.error {
            writeln!(out, "- {}", escape(error))?;
        }
        for assertion in step.failed_assertions() {
            writeln!(
                out,
                "- `{}`{}: expected `{}`, actual `{}`{}",
                assertion.operator,
                assertion
                    .description
                    .as_deref()
                    .map(|d| format!(" ({})", escape(d)))
                    .unwrap_or_default(),
                assertion.display_expected(),
                assertion.display_actual(),
                assertion
                    .message
                    .as_deref()
                    .map(|m| format!(" - {}", escape(m)))
                    .unwrap_or_default()
            )?;
        }
        for line in &step.logs {
            writeln!(out, "- log: {}", escape(line))?;
        }
        writeln!(out, "\n</details>\n")
    }
}

impl Reporter for MarkdownReporter {
    fn render(&self, results: &[SuiteResult]) -> Result<String> {
        let mut out = String::new();
        let generated_at = self.generated_at.unwrap_or_else(Utc::now);
        let cases: usize = results.iter().map(|s| s.cases.len()).sum();
        let passed: usize = results.iter().map(|s| s.passed_cases()).sum();

        writeln!(out, "# JTest Report\n")?;
        writeln!(out, "Generated at {}\n", generated_at.to_rfc3339())?;
        writeln!(out, "**{passed}/{cases}** test cases passed in {} suite(s).\n", results.len())?;

        writeln!(out, "| Suite | Passed | Failed | Duration | Result |")?;
        writeln!(out, "|-------|--------|--------|----------|--------|")?;
        for suite in results {
            writeln!(
                out,
                "| {} | {} | {} | {} ms | {} |",
                escape(&suite.name),
                suite.passed_cases(),
                suite.failed_cases(),
                suite.duration_ms,
                icon(suite.success)
            )?;
        }
        writeln!(out)?;

        for suite in results {
            writeln!(out, "## {} {}\n", icon(suite.success), escape(&suite.name))?;
            if let Some(file) = &suite.file {
                writeln!(out, "File: `{file}`\n")?;
            }
            if let Some(description) = &suite.description {
                writeln!(out, "{}\n", escape(description))?;
            }
            if let Some(error) = &suite.error {
                writeln!(out, "> **Error:** {}\n", escape(error))?;
            }
            for case in &suite.cases {
                Self::case_section(&mut out, case)?;
            }
        }
        Ok(out)
    }

    fn extension(&self) -> &'static str {
        "md"
    }
}

/// The results as pretty-printed JSON. Masked assertion values are
/// replaced.
#[derive(Debug, Clone, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn render(&self, results: &[SuiteResult]) -> Result<String> {
        let mut results = results.to_vec();
        for suite in &mut results {
            for case in &mut suite.cases {
                case.steps.iter_mut().for_each(mask_values);
            }
        }
        Ok(serde_json::to_string_pretty(&results)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}

fn mask_values(step: &mut StepResult) {
    for assertion in &mut step.assertions {
        *assertion = assertion.redacted();
    }
    step.inner.iter_mut().for_each(mask_values);
}

fn icon(success: bool) -> &'static str {
    if success {
        "✅"
    } else {
        "❌"
    }
}

/// Keep table cells intact.
fn escape(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::Assertion;
    use crate::context::{ContextChanges, VariableContext};
    use serde_json::json;

    fn step_result(success: bool, masked: bool) -> StepResult {
        let assertion: Assertion = serde_json::from_value(json!({
            "type": "equals",
            "actualValue": "s3cret",
            "expectedValue": "other",
            "mask": masked,
            "description": "token | value"
        }))
        .unwrap();
        StepResult {
            id: None,
            name: "login".into(),
            kind: "http".into(),
            success,
            error: (!success).then(|| "1 assertion(s) failed".to_string()),
            duration_ms: 12,
            assertions: vec![assertion.execute(&VariableContext::new())],
            changes: ContextChanges::default(),
            details: None,
            inner: Vec::new(),
            logs: vec!["Path not found: $.ctx.x".into()],
        }
    }

    fn suite(masked: bool) -> SuiteResult {
        SuiteResult {
            name: "auth".into(),
            description: Some("login flow".into()),
            file: Some("auth.json".into()),
            cases: vec![CaseResult {
                name: "sign in".into(),
                dataset: Some("admin".into()),
                success: false,
                duration_ms: 20,
                steps: vec![step_result(false, masked)],
                error: None,
                skipped: 0,
            }],
            success: false,
            duration_ms: 25,
            error: None,
        }
    }

    #[test]
    fn test_markdown_report() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let report = MarkdownReporter::at(at).render(&[suite(false)]).unwrap();

        assert!(report.starts_with("# JTest Report"));
        assert!(report.contains("2024-05-01T10:00:00+00:00"));
        assert!(report.contains("**0/1** test cases passed"));
        assert!(report.contains("| auth | 0 | 1 | 25 ms | ❌ |"));
        assert!(report.contains("### ❌ sign in [admin] (20 ms)"));
        assert!(report.contains("| 1 | login | http | ❌ | 12 ms |"));
        assert!(report.contains("(token \\| value)"));
        assert!(report.contains("actual `s3cret`"));
        assert!(report.contains("log: Path not found"));
    }

    #[test]
    fn test_masked_values_are_hidden() {
        let report = MarkdownReporter::new().render(&[suite(true)]).unwrap();
        assert!(!report.contains("s3cret"));
        assert!(report.contains("actual `****`"));

        let json = JsonReporter.render(&[suite(true)]).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(json.contains("\"mask\": true"));
    }

    #[tokio::test]
    async fn test_masked_while_condition_is_hidden() {
        let step: crate::step::Step = serde_json::from_value(json!({
            "type": "while",
            "condition": {"type": "equals", "actualValue": "hunter2", "expectedValue": "nope", "mask": true},
            "steps": [{"type": "wait", "ms": 0}]
        }))
        .unwrap();
        let rt = crate::step::Runtime::new(std::sync::Arc::new(
            crate::http::testing::StubTransport::default(),
        ));
        let mut ctx = VariableContext::new();
        let executed = step.execute(&rt, &mut ctx).await.unwrap();
        assert!(executed.success);

        let mut results = vec![suite(true)];
        results[0].cases[0].steps.push(executed);
        for rendered in [
            JsonReporter.render(&results).unwrap(),
            MarkdownReporter::new().render(&results).unwrap(),
        ] {
            assert!(!rendered.contains("hunter2"));
            assert!(!rendered.contains("s3cret"));
        }
    }

    #[test]
    fn test_write_to_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = JsonReporter
            .write_to(&dir.path().join("reports"), &[suite(false)])
            .unwrap();
        assert_eq!(path.extension().unwrap(), "json");
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written[0]["cases"][0]["dataset"], "admin");
        assert_eq!(written[0]["cases"][0]["steps"][0]["type"], "http");
    }
}
