//! JTest CLI - data-driven JSON API test runner.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use jtest::runner::load_templates;
use jtest::{
    EngineConfig, JsonReporter, MarkdownReporter, Reporter, ReqwestTransport, SuiteLoader,
    SuiteResult, SuiteRunner,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// JTest - run JSON API test suites.
#[derive(Parser, Debug)]
#[command(name = "jtest", version, about)]
struct Cli {
    /// Suite files or directories.
    #[arg(default_value = ".")]
    paths: Vec<PathBuf>,

    /// Engine configuration file (YAML or JSON).
    #[arg(short = 'c', long = "config", env = "JTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Filter test cases by name (partial match).
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Maximum number of suite files run in parallel.
    #[arg(short = 'p', long = "parallel")]
    parallel: Option<usize>,

    /// Override an `env` value (KEY=VALUE). May be repeated.
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Directory to save the report file.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "markdown")]
    report_format: ReportFormat,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

impl ReportFormat {
    fn reporter(self) -> Box<dyn Reporter> {
        match self {
            ReportFormat::Markdown => Box::new(MarkdownReporter::new()),
            ReportFormat::Json => Box::new(JsonReporter),
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .try_init();
}

fn print_suite_result(result: &SuiteResult) {
    let status = if result.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} suite: {} ({} ms)", status, result.name, result.duration_ms);
    if let Some(error) = &result.error {
        error!("  \x1b[31mError: {}\x1b[0m", error);
    }

    for case in &result.cases {
        let mark = if case.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        info!("  {} {} ({} ms)", mark, case.title(), case.duration_ms);
        for step in case.steps.iter().filter(|s| !s.success) {
            error!(
                "     \x1b[31m{}: {}\x1b[0m",
                step.name,
                step.error.as_deref().unwrap_or("failed")
            );
            for assertion in step.failed_assertions() {
                error!(
                    "       {} expected '{}' actual '{}'",
                    assertion.operator,
                    assertion.display_expected(),
                    assertion.display_actual()
                );
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => {
            let default = Path::new("jtest.yaml");
            if default.is_file() {
                EngineConfig::load(default)
            } else {
                debug!("No configuration file, using defaults");
                Ok(EngineConfig::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.verbose);

    let config = load_config(args.config.as_deref())?;
    let config_dir = args
        .config
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut loader = SuiteLoader::new();
    for path in &args.paths {
        loader.add_path(path);
    }
    let files = loader.discover()?;
    if files.is_empty() {
        return Err(anyhow!("No test suites were found"));
    }

    let client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("failed to build HTTP client")?;
    let global_templates = load_templates(&client, &config.templates, &config_dir).await?;
    info!("Loaded {} global template(s)", global_templates.len());

    let overrides: Map<String, Value> = args
        .env
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    let runner = SuiteRunner::new(Arc::new(ReqwestTransport::with_client(client.clone())))
        .with_client(client)
        .with_global_templates(global_templates)
        .with_env_defaults(config.env.clone())
        .with_env_overrides(overrides)
        .with_filter(args.filter);

    let parallel = args.parallel.unwrap_or(config.max_parallel);
    info!("Running {} suite(s) with parallelism {}...", files.len(), parallel);
    let start = Instant::now();
    let results = Arc::new(runner).run_files(files, parallel).await;

    for result in &results {
        print_suite_result(result);
    }

    let cases: usize = results.iter().map(|r| r.cases.len()).sum();
    let passed: usize = results.iter().map(|r| r.passed_cases()).sum();
    info!(
        "Summary:\n  Suites: {}\n  Cases: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        results.len(),
        cases,
        passed,
        cases - passed,
        start.elapsed().as_millis()
    );

    if let Some(dir) = &args.report_dir {
        if let Err(e) = args.report_format.reporter().write_to(dir, &results) {
            error!("Failed to save report: {:#}", e);
        }
    }

    if !results.iter().all(|r| r.success) {
        exit(1);
    }

    Ok(())
}
