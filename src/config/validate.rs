// src/config/validate.rs

use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::config::model::{
    default_processes, PipelineSettings, RawWorkerConfig, WorkerConfig, DEFAULT_CACHE_URL,
    DEFAULT_CONCURRENCY, DEFAULT_KEY_PREFIX, DEFAULT_LEASE_DURATION, DEFAULT_POLL_TIMEOUT,
    DEFAULT_WATCHDOG_INTERVAL,
};
use crate::errors::{DispatchError, Result};

impl TryFrom<RawWorkerConfig> for WorkerConfig {
    type Error = DispatchError;

    fn try_from(raw: RawWorkerConfig) -> std::result::Result<Self, Self::Error> {
        let config = WorkerConfig {
            cache_url: non_blank(raw.cache_url).unwrap_or_else(|| DEFAULT_CACHE_URL.to_string()),
            database_url: non_blank(raw.database_url),
            key_prefix: raw
                .key_prefix
                .map(|p| p.trim().to_string())
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            lease_duration: duration_field(
                "lease_duration",
                raw.lease_duration.as_deref(),
                DEFAULT_LEASE_DURATION,
            )?,
            poll_timeout: duration_field(
                "poll_timeout",
                raw.poll_timeout.as_deref(),
                DEFAULT_POLL_TIMEOUT,
            )?,
            concurrency: raw.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            processes: raw.processes.unwrap_or_else(default_processes),
            watchdog_interval: duration_field(
                "watchdog_interval",
                raw.watchdog_interval.as_deref(),
                DEFAULT_WATCHDOG_INTERVAL,
            )?,
            pipeline: PipelineSettings {
                program: non_blank(raw.pipeline.program),
                args: raw.pipeline.args,
            },
        };

        validate_config(&config)?;
        Ok(config)
    }
}

/// Check cross-field invariants of an assembled configuration.
pub fn validate_config(config: &WorkerConfig) -> Result<()> {
    if config.concurrency == 0 {
        return Err(DispatchError::ConfigError(
            "concurrency must be >= 1 (got 0)".to_string(),
        ));
    }

    if config.processes == 0 {
        return Err(DispatchError::ConfigError(
            "processes must be >= 1 (got 0)".to_string(),
        ));
    }

    if config.key_prefix.is_empty() {
        return Err(DispatchError::ConfigError(
            "key_prefix must not be empty".to_string(),
        ));
    }

    if config.lease_duration <= config.poll_timeout {
        return Err(DispatchError::ConfigError(format!(
            "lease_duration ({:?}) must be longer than poll_timeout ({:?})",
            config.lease_duration, config.poll_timeout
        )));
    }

    if config.watchdog_interval.is_zero() {
        return Err(DispatchError::ConfigError(
            "watchdog_interval must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn duration_field(name: &str, value: Option<&str>, default: &str) -> Result<Duration> {
    parse_duration(value.unwrap_or(default))
        .map_err(|e| DispatchError::ConfigError(format!("invalid {name}: {e}")))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
