// src/config/mod.rs

//! Worker configuration.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Layer file, environment and CLI values (`loader.rs`).
//! - Apply defaults and validate invariants (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{apply_env, load_and_validate, load_from_path, load_with_env};
pub use model::{CliOverrides, PipelineSettings, RawPipelineSection, RawWorkerConfig, WorkerConfig};
pub use validate::validate_config;
