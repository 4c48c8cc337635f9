// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `analysis-worker`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "analysis-worker",
    version,
    about = "Dispatch queued dataset analyses to a pool of workers and track their progress.",
    long_about = None
)]
pub struct CliArgs {
    /// Optional TOML config file. Environment variables override its values.
    #[arg(long, global = true, value_name = "PATH", env = "ANALYSIS_WORKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `ANALYSIS_WORKER_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// What to do; runs the worker pool when omitted.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run worker processes until interrupted.
    Worker {
        /// Pipeline runs in flight per process.
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        /// Number of worker processes.
        #[arg(long, value_name = "N")]
        processes: Option<usize>,
    },

    /// Create a task for `SOURCE_REF` and queue it. Prints the new record.
    Submit {
        #[arg(value_name = "SOURCE_REF")]
        source_ref: String,
    },

    /// Print the current record of a task.
    Status {
        #[arg(value_name = "TASK_ID")]
        task_id: String,
    },

    /// Run one stale-lease sweep and print how many tasks were re-queued.
    Sweep,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
