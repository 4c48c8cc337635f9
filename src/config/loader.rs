// src/config/loader.rs

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::config::model::{CliOverrides, RawWorkerConfig, WorkerConfig};
use crate::errors::{DispatchError, Result};

pub const ENV_CACHE_URL: &str = "REDIS_URL";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_KEY_PREFIX: &str = "ANALYSIS_KEY_PREFIX";
pub const ENV_LEASE_DURATION: &str = "ANALYSIS_LEASE_DURATION";
pub const ENV_POLL_TIMEOUT: &str = "ANALYSIS_POLL_TIMEOUT";
pub const ENV_CONCURRENCY: &str = "ANALYSIS_CONCURRENCY";
pub const ENV_PROCESSES: &str = "ANALYSIS_PROCESSES";
pub const ENV_WATCHDOG_INTERVAL: &str = "ANALYSIS_WATCHDOG_INTERVAL";
pub const ENV_PIPELINE_PROGRAM: &str = "ANALYSIS_PIPELINE_PROGRAM";

/// Load a configuration file and return the raw, unvalidated layer.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawWorkerConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawWorkerConfig = toml::from_str(&contents)?;

    Ok(config)
}

/// Overlay environment variables on `raw`.
///
/// `env` looks a variable up by name, so callers (and tests) decide where
/// the environment comes from.
pub fn apply_env<F>(raw: &mut RawWorkerConfig, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let string_vars: [(&str, &mut Option<String>); 6] = [
        (ENV_CACHE_URL, &mut raw.cache_url),
        (ENV_DATABASE_URL, &mut raw.database_url),
        (ENV_KEY_PREFIX, &mut raw.key_prefix),
        (ENV_LEASE_DURATION, &mut raw.lease_duration),
        (ENV_POLL_TIMEOUT, &mut raw.poll_timeout),
        (ENV_WATCHDOG_INTERVAL, &mut raw.watchdog_interval),
    ];
    for (name, slot) in string_vars {
        if let Some(value) = env(name) {
            debug!(var = name, "config value from environment");
            *slot = Some(value);
        }
    }

    if let Some(program) = env(ENV_PIPELINE_PROGRAM) {
        raw.pipeline.program = Some(program);
    }

    if let Some(value) = env(ENV_CONCURRENCY) {
        raw.concurrency = Some(parse_count(ENV_CONCURRENCY, &value)?);
    }
    if let Some(value) = env(ENV_PROCESSES) {
        raw.processes = Some(parse_count(ENV_PROCESSES, &value)?);
    }

    Ok(())
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|e| {
        DispatchError::ConfigError(format!("{name} must be a non-negative integer, got '{value}': {e}"))
    })
}

/// File layer (if any) plus environment, looked up through `env`.
pub fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<RawWorkerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut raw = match path {
        Some(path) => load_from_path(path)?,
        None => RawWorkerConfig::default(),
    };
    apply_env(&mut raw, env)?;
    Ok(raw)
}

/// Full layering against the process environment: defaults, file,
/// environment, then CLI overrides; validated.
///
/// This is the entry point used by the binary.
pub fn load_and_validate(path: Option<&Path>, overrides: &CliOverrides) -> Result<WorkerConfig> {
    let mut raw = load_with_env(path, |name| std::env::var(name).ok())?;
    raw.apply_overrides(overrides);
    WorkerConfig::try_from(raw)
}
