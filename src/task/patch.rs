// src/task/patch.rs

use crate::task::record::{KpiField, TaskStatus};

/// A single typed assignment to a Task Record.
///
/// Top-level variants replace the whole field. [`RecordPatch::Kpi`] is scoped
/// to one field of one KPI and leaves every other KPI (and every other field
/// of the same KPI) untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPatch {
    /// Drop everything a previous delivery of the task produced: KPIs,
    /// partial results, summary, output refs, error fields and progress.
    StartAttempt,
    IdentifiedKpis(Vec<String>),
    CurrentKpi(Option<String>),
    Summary(String),
    ReportRef(String),
    RawDataRef(String),
    ErrorDetail(String),
    ErrorTrace(String),
    Kpi {
        kpi: String,
        field: KpiField,
        value: String,
    },
}

impl RecordPatch {
    pub fn kpi(kpi: impl Into<String>, field: KpiField, value: impl Into<String>) -> Self {
        RecordPatch::Kpi {
            kpi: kpi.into(),
            field,
            value: value.into(),
        }
    }
}

/// Field-level update against the durable record: only the fields that are
/// set here change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub patches: Vec<RecordPatch>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn patch(mut self, patch: RecordPatch) -> Self {
        self.patches.push(patch);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.message.is_none()
            && self.patches.is_empty()
    }
}
