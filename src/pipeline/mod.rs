// src/pipeline/mod.rs

//! Analysis Pipeline abstraction.
//!
//! The executor talks to an [`AnalysisPipeline`] instead of a concrete
//! implementation. This keeps the dispatch core independent of what an
//! analysis actually does:
//!
//! - [`CommandPipeline`] runs an external program per task and translates its
//!   JSON-lines stdout into progress updates (production).
//! - [`StagedPipeline`] drives an in-process [`AnalysisStages`]
//!   implementation through the load / KPI / summary / report sequence.
//! - Tests provide their own scripted implementations.

pub mod command;
pub mod protocol;
pub mod staged;

use std::future::Future;
use std::pin::Pin;

use crate::progress::{ProgressSynchronizer, ProgressUpdate};

pub use command::CommandPipeline;
pub use protocol::{parse_line, EventTranslator, PipelineEvent, Translated};
pub use staged::{AnalysisStages, RenderedReport, StagedPipeline};

/// Everything a pipeline run needs to know about its task.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub task_id: String,
    pub source_ref: String,
    pub progress: ProgressSynchronizer,
}

impl PipelineContext {
    pub fn new(
        task_id: impl Into<String>,
        source_ref: impl Into<String>,
        progress: ProgressSynchronizer,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            source_ref: source_ref.into(),
            progress,
        }
    }

    /// Publish an intermediate update for this task (best-effort).
    pub async fn report(&self, update: ProgressUpdate) {
        self.progress.publish(&self.task_id, update).await;
    }
}

/// Artifacts produced by a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub report_ref: String,
    pub raw_data_ref: String,
    pub summary: Option<String>,
}

/// Terminal failure of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    pub error_detail: String,
    pub error_trace: String,
}

impl PipelineFailure {
    pub fn new(error_detail: impl Into<String>, error_trace: impl Into<String>) -> Self {
        Self {
            error_detail: error_detail.into(),
            error_trace: error_trace.into(),
        }
    }

    /// Build a failure from an `anyhow` error: the top-level message becomes
    /// the detail, the full cause chain the trace.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            error_detail: err.to_string(),
            error_trace: format!("{err:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Success(PipelineReport),
    Failure(PipelineFailure),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Success(_))
    }
}

/// Trait abstracting how a single analysis task is executed.
///
/// Implementations publish intermediate progress through
/// [`PipelineContext::report`]; the terminal state is published by the
/// executor from the returned [`PipelineOutcome`].
pub trait AnalysisPipeline: Send + Sync {
    fn run(&self, ctx: PipelineContext) -> Pin<Box<dyn Future<Output = PipelineOutcome> + Send + '_>>;
}
