// src/logging.rs

//! Logging for the worker binary.
//!
//! Every worker process is an OS thread named `worker-<n>`, so thread names
//! are printed on each line and interleaved output from several processes
//! can be told apart. Lines go to STDERR, keeping `submit` / `status` JSON on
//! stdout machine-readable.
//!
//! The filter comes from, in order:
//! 1. `--log-level` (applied to everything except the noisy dependencies)
//! 2. `ANALYSIS_WORKER_LOG`, taken as a full `EnvFilter` directive string
//!    (e.g. `"debug"` or `"analysis_worker=trace,sqlx=info"`)
//! 3. `info`

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

/// Environment variable consulted when no `--log-level` flag is given.
pub const LOG_ENV_VAR: &str = "ANALYSIS_WORKER_LOG";

/// Appended to level-only filters: sqlx logs every statement at `info`.
const QUIET_DEPENDENCIES: &str = "sqlx=warn";

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env_value = std::env::var(LOG_ENV_VAR).ok();
    let filter = build_filter(cli_level, env_value.as_deref())?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {e}"))
}

/// Resolve the filter from the CLI flag and the raw `ANALYSIS_WORKER_LOG`
/// value.
pub fn build_filter(cli_level: Option<LogLevel>, env_value: Option<&str>) -> Result<EnvFilter> {
    let directives = match (cli_level, env_value.map(str::trim)) {
        (Some(level), _) => format!("{},{QUIET_DEPENDENCIES}", level_name(level)),
        (None, Some(value)) if !value.is_empty() => value.to_string(),
        _ => format!("info,{QUIET_DEPENDENCIES}"),
    };

    EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid {LOG_ENV_VAR} filter '{directives}'"))
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}
