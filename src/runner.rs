//! Suite execution.

use crate::context::{VariableContext, GLOBALS};
use crate::executor::CaseExecutor;
use crate::http::HttpTransport;
use crate::model::{JTestSuite, SuiteResult};
use crate::step::Runtime;
use crate::template::{TemplateCatalog, TemplateCollection, TemplateStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument};

/// Test runner trait
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Execute a parsed suite whose relative references resolve
    /// against `base_dir`.
    async fn run(&self, suite: &JTestSuite, base_dir: &Path) -> Result<SuiteResult>;
}

/// Runs suites with a shared transport and global templates.
#[derive(Debug, Clone)]
pub struct SuiteRunner {
    transport: Arc<dyn HttpTransport>,
    client: Client,
    global_templates: Arc<TemplateStore>,
    env_defaults: Map<String, Value>,
    env_overrides: Map<String, Value>,
    filter: Option<String>,
}

impl SuiteRunner {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            client: Client::new(),
            global_templates: Arc::new(TemplateStore::new()),
            env_defaults: Map::new(),
            env_overrides: Map::new(),
            filter: None,
        }
    }

    /// Client used to fetch `http(s)://` template sources.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_global_templates(mut self, templates: TemplateStore) -> Self {
        self.global_templates = Arc::new(templates);
        self
    }

    /// `env` values used when a suite does not set them.
    pub fn with_env_defaults(mut self, env: Map<String, Value>) -> Self {
        self.env_defaults = env;
        self
    }

    /// `env` values that win over the suite's own.
    pub fn with_env_overrides(mut self, env: Map<String, Value>) -> Self {
        self.env_overrides = env;
        self
    }

    /// Only run cases whose name contains `filter` (case-insensitive).
    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter.map(|f| f.to_lowercase());
        self
    }

    /// Load, parse and run one suite file. Load and parse failures
    /// produce a failed result instead of an error.
    #[instrument(skip(self), fields(file = %path.display()))]
    pub async fn run_file(&self, path: &Path) -> SuiteResult {
        let file = Some(path.display().to_string());
        let fallback_name = file_stem(path);

        let suite = match tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read test file: {}", path.display()))
            .and_then(|text| JTestSuite::from_json(&text))
        {
            Ok(suite) => suite,
            Err(e) => {
                error!("Cannot load {}: {:#}", path.display(), e);
                return SuiteResult::failed(fallback_name, file, &e);
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        match self.run(&suite, base_dir).await {
            Ok(mut result) => {
                result.file = file;
                result
            }
            Err(e) => {
                error!("Suite '{}' aborted: {:#}", suite.name(), e);
                let mut result = SuiteResult::failed(suite.name(), file, &e);
                result.description = suite.info.description.clone();
                result
            }
        }
    }

    /// Run suite files with at most `max_parallel` in flight. Results
    /// come back in completion order, one per path; a suite whose task
    /// panics is reported as a failed result for its file.
    pub async fn run_files(self: Arc<Self>, paths: Vec<PathBuf>, max_parallel: usize) -> Vec<SuiteResult> {
        let permits = Arc::new(Semaphore::new(max_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for path in paths {
            let runner = Arc::clone(&self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let suite = tokio::spawn({
                    let path = path.clone();
                    async move { runner.run_file(&path).await }
                });
                match suite.await {
                    Ok(result) => result,
                    Err(e) => {
                        let e = anyhow!("suite task failed: {}", join_message(e));
                        error!("{}: {:#}", path.display(), e);
                        SuiteResult::failed(file_stem(&path), Some(path.display().to_string()), &e)
                    }
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Suite task failed: {}", e),
            }
        }
        results
    }

    /// Initial context for a suite: `env` layered from the runner
    /// defaults, the suite and the overrides; `globals` from the suite.
    pub fn build_context(&self, suite: &JTestSuite) -> Result<VariableContext> {
        let mut env = self.env_defaults.clone();
        env.extend(suite.env.clone());
        env.extend(self.env_overrides.clone());

        let mut ctx = VariableContext::with_env(Arc::new(Value::Object(env)));
        ctx.set_root(GLOBALS, Value::Object(suite.globals.clone()))?;
        Ok(ctx)
    }

    fn selected(&self, name: &str) -> bool {
        self.filter
            .as_deref()
            .map_or(true, |filter| name.to_lowercase().contains(filter))
    }
}

#[async_trait]
impl TestRunner for SuiteRunner {
    #[instrument(skip(self, suite, base_dir), fields(name = %suite.name()))]
    async fn run(&self, suite: &JTestSuite, base_dir: &Path) -> Result<SuiteResult> {
        let start = Instant::now();
        info!("Starting test suite: {}", suite.name());

        let local = load_templates(&self.client, &suite.using, base_dir).await?;
        let catalog = TemplateCatalog::new(Arc::clone(&self.global_templates)).with_local(local);
        let runtime = Runtime::new(Arc::clone(&self.transport))
            .with_templates(catalog)
            .with_base_dir(base_dir);
        let executor = CaseExecutor::new(runtime);

        let mut ctx = self.build_context(suite)?;
        let mut cases = Vec::new();
        for case in &suite.tests {
            if !self.selected(&case.name) {
                debug!("Skipping test case '{}' (filter)", case.name);
                continue;
            }
            cases.extend(executor.execute(case, &mut ctx).await);
        }

        let result = SuiteResult {
            name: suite.name().to_string(),
            description: suite.info.description.clone(),
            file: None,
            success: cases.iter().all(|c| c.success),
            cases,
            duration_ms: start.elapsed().as_millis() as u64,
            error: None,
        };
        info!(
            "Test suite finished: {} ({} ms) - Success: {}",
            result.name, result.duration_ms, result.success
        );
        Ok(result)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "suite".to_string())
}

fn join_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Load template collections from paths (relative to `base_dir`) or
/// `http(s)://` URLs. Later sources overwrite earlier ones by name.
pub async fn load_templates(client: &Client, sources: &[String], base_dir: &Path) -> Result<TemplateStore> {
    let mut store = TemplateStore::new();
    for source in sources {
        let text = read_source(client, source, base_dir).await?;
        let collection = TemplateCollection::from_json(&text)
            .with_context(|| format!("Invalid template source '{source}'"))?;
        debug!(
            "Loaded {} template(s) from {}",
            collection.components.templates.len(),
            source
        );
        store.load(collection);
    }
    Ok(store)
}

async fn read_source(client: &Client, source: &str, base_dir: &Path) -> Result<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = client
            .get(source)
            .send()
            .await
            .with_context(|| format!("Failed to fetch template source {source}"))?
            .error_for_status()
            .with_context(|| format!("Failed to fetch template source {source}"))?;
        return response
            .text()
            .await
            .with_context(|| format!("Failed to read template source {source}"));
    }

    let path = base_dir.join(source);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read template source {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::StubTransport;
    use serde_json::json;

    fn runner() -> SuiteRunner {
        SuiteRunner::new(Arc::new(StubTransport::default()))
    }

    fn write(dir: &Path, name: &str, doc: Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, doc.to_string()).unwrap();
        path
    }

    #[test]
    fn test_env_precedence() {
        let suite = JTestSuite::from_json(
            r#"{"env": {"a": "suite", "b": "suite"}, "globals": {"g": 1}}"#,
        )
        .unwrap();
        let runner = runner()
            .with_env_defaults(json!({"a": "config", "b": "config", "c": "config"}).as_object().cloned().unwrap())
            .with_env_overrides(json!({"b": "cli"}).as_object().cloned().unwrap());

        let ctx = runner.build_context(&suite).unwrap();
        assert_eq!(ctx.env().as_ref(), &json!({"a": "suite", "b": "cli", "c": "config"}));
        assert_eq!(ctx.root(GLOBALS), Some(&json!({"g": 1})));
    }

    #[tokio::test]
    async fn test_using_resolves_relative_to_suite_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("shared")).unwrap();
        write(
            &dir.path().join("shared"),
            "templates.json",
            json!({"components": {"templates": [{
                "name": "mark",
                "steps": [{"type": "wait", "ms": 0}],
                "output": {"$.globals.marked": "{{$.ctx.label}}"},
                "params": {"label": {"type": "string", "required": true}}
            }]}}),
        );
        let suite = write(
            dir.path(),
            "suite.json",
            json!({
                "info": {"name": "templated"},
                "using": ["shared/templates.json"],
                "tests": [
                    {"name": "first", "steps": [{"type": "use", "template": "mark", "with": {"label": "x"}}]},
                    {"name": "second", "steps": [{
                        "type": "assert",
                        "assert": [{"type": "equals", "actualValue": "{{$.globals.marked}}", "expectedValue": "x"}]
                    }]}
                ]
            }),
        );

        let result = runner().run_file(&suite).await;
        assert!(result.success, "{result:#?}");
        assert_eq!(result.cases.len(), 2);
        assert_eq!(result.name, "templated");
    }

    #[tokio::test]
    async fn test_broken_files_become_failed_results() {
        let dir = tempfile::tempdir().unwrap();
        let bad_json = dir.path().join("bad.json");
        std::fs::write(&bad_json, "{ nope").unwrap();
        let missing_template = write(
            dir.path(),
            "missing.json",
            json!({"using": ["absent.json"], "tests": [{"name": "t", "steps": []}]}),
        );

        let runner = runner();
        let result = runner.run_file(&bad_json).await;
        assert!(!result.success);
        assert_eq!(result.name, "bad");
        assert!(result.error.unwrap().contains("failed to parse test suite"));

        let result = runner.run_file(&missing_template).await;
        assert!(!result.success);
        assert!(result.cases.is_empty());
        assert!(result.error.unwrap().contains("absent.json"));
    }

    #[derive(Debug, serde::Deserialize)]
    struct ExplodeStep {}

    impl crate::step::StepType for ExplodeStep {}

    #[async_trait]
    impl crate::step::StepBehavior for ExplodeStep {
        async fn execute(
            &self,
            _rt: &Runtime,
            _ctx: &mut VariableContext,
        ) -> Result<crate::step::StepOutcome> {
            panic!("step exploded");
        }
    }

    #[tokio::test]
    async fn test_panicking_suite_is_reported_as_failed() {
        crate::register_step_type::<ExplodeStep>().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let boom = write(
            dir.path(),
            "boom.json",
            json!({"tests": [{"name": "t", "steps": [{"type": "explode"}]}]}),
        );
        let fine = write(
            dir.path(),
            "fine.json",
            json!({"tests": [{"name": "t", "steps": [{"type": "wait", "ms": 0}]}]}),
        );

        let results = Arc::new(runner()).run_files(vec![boom, fine], 1).await;
        assert_eq!(results.len(), 2);
        assert!(!results.iter().all(|r| r.success));

        let failed = results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.name, "boom");
        assert!(failed.file.as_deref().unwrap().ends_with("boom.json"));
        assert!(failed.error.as_deref().unwrap().contains("step exploded"));
    }

    #[tokio::test]
    async fn test_filter_and_parallel_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..3 {
            paths.push(write(
                dir.path(),
                &format!("s{i}.json"),
                json!({"tests": [
                    {"name": "smoke check", "steps": [{"type": "wait", "ms": 5}]},
                    {"name": "slow path", "steps": [{"type": "wait", "ms": 5}]}
                ]}),
            ));
        }

        let runner = Arc::new(runner().with_filter(Some("SMOKE".to_string())));
        let results = runner.run_files(paths, 2).await;
        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(result.success);
            assert_eq!(result.cases.len(), 1);
            assert_eq!(result.cases[0].name, "smoke check");
        }
    }
}
