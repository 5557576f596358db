//! Engine configuration and suite file discovery.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Engine settings, read from a YAML or JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Suite files executed concurrently.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Global template collection sources.
    #[serde(default)]
    pub templates: Vec<String>,
    /// Seed values for the `env` root. Suites and the command line
    /// override them.
    #[serde(default)]
    pub env: Map<String, Value>,
}

fn default_max_parallel() -> usize {
    4
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            http_timeout_secs: default_http_timeout(),
            templates: Vec::new(),
            env: Map::new(),
        }
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading engine configuration from {}", path.display());
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse YAML; JSON documents are accepted as well.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Finds suite files on disk.
#[derive(Debug, Default)]
pub struct SuiteLoader {
    pub paths: Vec<PathBuf>,
}

impl SuiteLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Suite files named by the configured paths. Files are taken
    /// as given; directories are scanned (not recursively) for
    /// `*.json` documents that contain `tests`.
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for path in &self.paths {
            if path.is_dir() {
                found.extend(self.scan_dir(path)?);
            } else {
                found.push(path.clone());
            }
        }
        info!("Discovered {} suite file(s)", found.len());
        Ok(found)
    }

    fn scan_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if !path.is_file() || !is_json_file(&path) {
                continue;
            }
            if is_suite_document(&path) {
                files.push(path);
            } else {
                debug!("Skipping {}: not a test suite", path.display());
            }
        }
        files.sort();
        Ok(files)
    }
}

fn is_json_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Template collections and other JSON files have no `tests` array.
fn is_suite_document(path: &Path) -> bool {
    fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .is_some_and(|doc| doc.get("tests").is_some_and(Value::is_array))
}
