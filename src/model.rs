//! Suite documents and run results.

use crate::step::{Step, StepResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A test suite file.
#[derive(Debug, Deserialize)]
pub struct JTestSuite {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub info: SuiteInfo,
    /// Template collection sources: paths relative to the suite file
    /// or `http(s)://` URLs.
    #[serde(default)]
    pub using: Vec<String>,
    #[serde(default)]
    pub env: Map<String, Value>,
    #[serde(default)]
    pub globals: Map<String, Value>,
    #[serde(default)]
    pub tests: Vec<JTestCase>,
}

impl JTestSuite {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse test suite")
    }

    pub fn name(&self) -> &str {
        self.info.name.as_deref().unwrap_or("unnamed suite")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct JTestCase {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// One run per dataset; none means a single run without `case`.
    #[serde(default)]
    pub datasets: Vec<JTestDataset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JTestDataset {
    pub name: String,
    /// Values of the `case` root. Tokens are resolved once when the
    /// iteration starts.
    #[serde(default)]
    pub case: Map<String, Value>,
}

/// Result of one test case run (one per dataset).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseResult {
    pub name: String,
    pub dataset: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub steps: Vec<StepResult>,
    /// Set when a fault aborted the run early.
    pub error: Option<String>,
    /// Steps not executed because of a fault.
    pub skipped: usize,
}

impl CaseResult {
    /// `name` or `name [dataset]`.
    pub fn title(&self) -> String {
        match &self.dataset {
            Some(dataset) => format!("{} [{}]", self.name, dataset),
            None => self.name.clone(),
        }
    }
}

/// Result of one suite file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteResult {
    pub name: String,
    pub description: Option<String>,
    pub file: Option<String>,
    pub cases: Vec<CaseResult>,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl SuiteResult {
    /// A suite that could not be loaded or prepared.
    pub fn failed(name: impl Into<String>, file: Option<String>, error: &anyhow::Error) -> Self {
        Self {
            name: name.into(),
            description: None,
            file,
            cases: Vec::new(),
            success: false,
            duration_ms: 0,
            error: Some(format!("{error:#}")),
        }
    }

    pub fn passed_cases(&self) -> usize {
        self.cases.iter().filter(|c| c.success).count()
    }

    pub fn failed_cases(&self) -> usize {
        self.cases.len() - self.passed_cases()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suite() {
        let suite = JTestSuite::from_json(
            r#"{
                "version": "1.0",
                "info": {"name": "orders", "description": "order API"},
                "using": ["templates.json"],
                "env": {"baseUrl": "http://localhost"},
                "globals": {"token": null},
                "tests": [{
                    "name": "create",
                    "steps": [{"type": "wait", "ms": 1}],
                    "datasets": [{"name": "small", "case": {"qty": 1}}]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(suite.name(), "orders");
        assert_eq!(suite.using, vec!["templates.json"]);
        assert_eq!(suite.tests.len(), 1);
        assert_eq!(suite.tests[0].steps[0].kind(), "wait");
        assert_eq!(suite.tests[0].datasets[0].case["qty"], 1);
    }

    #[test]
    fn test_unknown_step_type_fails_the_document() {
        let err = JTestSuite::from_json(
            r#"{"tests": [{"name": "x", "steps": [{"type": "smtp"}]}]}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown step type 'smtp'"));
    }

    #[test]
    fn test_case_title() {
        let mut result = CaseResult {
            name: "create".into(),
            dataset: None,
            success: true,
            duration_ms: 0,
            steps: Vec::new(),
            error: None,
            skipped: 0,
        };
        assert_eq!(result.title(), "create");
        result.dataset = Some("small".into());
        assert_eq!(result.title(), "create [small]");
    }
}
