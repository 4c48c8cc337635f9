// src/config/model.rs

use std::time::Duration;

use serde::Deserialize;

use crate::errors::{DispatchError, Result};
use crate::queue::QueueKeys;
use crate::worker::ExecutorOptions;

/// Worker configuration as read from TOML and the environment, before
/// defaults and validation.
///
/// ```toml
/// cache_url = "redis://127.0.0.1:6379"
/// database_url = "postgres://analysis@localhost/analysis"
/// key_prefix = "analysis"
/// lease_duration = "25m"
/// poll_timeout = "1s"
/// concurrency = 2
/// processes = 3
/// watchdog_interval = "60s"
///
/// [pipeline]
/// program = "/opt/analysis/run-analysis"
/// args = ["--model", "default"]
/// ```
///
/// Every field is optional; later layers only override what they set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWorkerConfig {
    #[serde(default)]
    pub cache_url: Option<String>,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Duration string, e.g. `"25m"`.
    #[serde(default)]
    pub lease_duration: Option<String>,

    #[serde(default)]
    pub poll_timeout: Option<String>,

    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Number of worker processes (threads with their own runtime).
    #[serde(default)]
    pub processes: Option<usize>,

    #[serde(default)]
    pub watchdog_interval: Option<String>,

    #[serde(default)]
    pub pipeline: RawPipelineSection,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPipelineSection {
    #[serde(default)]
    pub program: Option<String>,

    /// Arguments placed before `<task_id> <source_ref>`.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Explicit overrides from the command line; highest priority layer.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub concurrency: Option<usize>,
    pub processes: Option<usize>,
}

impl RawWorkerConfig {
    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(concurrency) = overrides.concurrency {
            self.concurrency = Some(concurrency);
        }
        if let Some(processes) = overrides.processes {
            self.processes = Some(processes);
        }
    }
}

pub const DEFAULT_CACHE_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_KEY_PREFIX: &str = "analysis";
pub const DEFAULT_LEASE_DURATION: &str = "25m";
pub const DEFAULT_POLL_TIMEOUT: &str = "1s";
pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_WATCHDOG_INTERVAL: &str = "60s";

/// One worker process per CPU, leaving one for everything else.
pub fn default_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Validated configuration with defaults applied.
///
/// Construct via `WorkerConfig::try_from(raw)`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub cache_url: String,
    pub database_url: Option<String>,
    pub key_prefix: String,
    pub lease_duration: Duration,
    pub poll_timeout: Duration,
    pub concurrency: usize,
    pub processes: usize,
    pub watchdog_interval: Duration,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSettings {
    pub program: Option<String>,
    pub args: Vec<String>,
}

impl WorkerConfig {
    pub fn database_url(&self) -> Result<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            DispatchError::ConfigError(
                "database_url is required (set DATABASE_URL or `database_url` in the config file)"
                    .to_string(),
            )
        })
    }

    pub fn pipeline_program(&self) -> Result<&str> {
        self.pipeline.program.as_deref().ok_or_else(|| {
            DispatchError::ConfigError(
                "pipeline program is required (set ANALYSIS_PIPELINE_PROGRAM or [pipeline].program)"
                    .to_string(),
            )
        })
    }

    pub fn queue_keys(&self) -> QueueKeys {
        QueueKeys::new(self.key_prefix.clone())
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            concurrency: self.concurrency,
            poll_timeout: self.poll_timeout,
            ..ExecutorOptions::default()
        }
    }
}
