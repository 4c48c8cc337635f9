// src/worker/mod.rs

//! Pipeline Executor: the bounded worker pool draining the queue.

pub mod executor;
pub mod stats;

pub use executor::{run_and_ack, ExecutorOptions, PipelineExecutor};
pub use stats::{ExecutorStats, StatsSnapshot};
