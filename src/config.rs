//! Settings file supplying run defaults
//!
//! Stored as pretty JSON. Missing files and missing fields fall back to
//! defaults so an old or partial file still loads.

use crate::checker::probe::{
    HttpMethod, RequestConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_ENDPOINT, DEFAULT_HEADERS,
    DEFAULT_TIMEOUT_SECS,
};
use crate::checker::parser::{KeyRule, DEFAULT_KEY_PREFIX, DEFAULT_MIN_KEY_LENGTH};
use crate::checker::runner::{RunnerOptions, DEFAULT_CONCURRENCY, DEFAULT_SAVE_INTERVAL_SECS};
use crate::checker::CheckpointStore;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default settings file path
pub const DEFAULT_CONFIG_PATH: &str = "key_checker_config.json";

/// Default history database path
pub const DEFAULT_DATABASE_URL: &str = "key_checker_history.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub key_prefix: String,
    pub min_key_length: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            min_key_length: DEFAULT_MIN_KEY_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Write checkpoints while checking
    pub auto_save: bool,
    pub save_interval_secs: u64,
    /// Directory checkpoints are written to and searched in
    pub checkpoint_dir: String,
    /// Checkpoints kept per input source after a run
    pub max_progress_files: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            auto_save: true,
            save_interval_secs: DEFAULT_SAVE_INTERVAL_SECS,
            checkpoint_dir: ".".to_string(),
            max_progress_files: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub method: HttpMethod,
    pub headers: String,
    pub body: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            method: HttpMethod::Get,
            headers: DEFAULT_HEADERS.to_string(),
            body: String::new(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub detection: DetectionConfig,
    pub progress: ProgressConfig,
    pub api: ApiConfig,
    /// History database file path
    pub database_url: String,
    /// Default tracing filter, e.g. `info` or `key_checker=debug`
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            progress: ProgressConfig::default(),
            api: ApiConfig::default(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or defaults when the file does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn key_rule(&self) -> KeyRule {
        KeyRule::new(
            self.detection.key_prefix.clone(),
            self.detection.min_key_length,
        )
    }

    pub fn request_config(&self) -> RequestConfig {
        RequestConfig::new()
            .with_endpoint(self.api.endpoint.clone())
            .with_method(self.api.method)
            .with_headers(self.api.headers.clone())
            .with_body(self.api.body.clone())
            .with_timeout(Duration::from_secs(self.detection.timeout_secs))
            .with_connect_timeout(Duration::from_secs(self.detection.connect_timeout_secs))
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.progress.checkpoint_dir)
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions::new()
            .with_concurrency(self.detection.concurrency)
            .with_timeout_secs(self.detection.timeout_secs)
            .with_save_interval(Duration::from_secs(self.progress.save_interval_secs.max(1)))
            .with_store(self.checkpoint_store())
    }
}
