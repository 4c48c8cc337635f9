// src/pipeline/protocol.rs

//! JSON-lines protocol spoken by external pipeline programs on stdout.
//!
//! Each line is one JSON object tagged by `type`. Lines that are not valid
//! events are treated as plain log output.

use serde::{Deserialize, Serialize};

use crate::pipeline::{PipelineFailure, PipelineReport};
use crate::progress::ProgressUpdate;
use crate::task::{KpiField, RecordPatch, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress {
        progress: f64,
        #[serde(default)]
        message: Option<String>,
    },
    Kpis {
        kpis: Vec<String>,
    },
    KpiStarted {
        kpi: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    KpiResult {
        kpi: String,
        field: KpiField,
        value: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    Summary {
        summary: String,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        message: Option<String>,
    },
    Completed {
        report_ref: String,
        raw_data_ref: String,
        #[serde(default)]
        summary: Option<String>,
    },
    Failed {
        error_detail: String,
        #[serde(default)]
        error_trace: Option<String>,
    },
}

/// Parse one stdout line. Returns `None` for anything that is not an event.
pub fn parse_line(line: &str) -> Option<PipelineEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// What the translator wants done with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Translated {
    Update(ProgressUpdate),
    Completed(PipelineReport),
    Failed(PipelineFailure),
}

/// Turns protocol events into progress updates.
///
/// Remembers the last progress value and message so events that omit them
/// (e.g. a bare `kpis` line) re-publish the current position instead of
/// resetting it.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    progress: f64,
    message: String,
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self {
            progress: 0.1,
            message: "Starting analysis...".to_string(),
        }
    }
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn translate(&mut self, event: PipelineEvent) -> Translated {
        match event {
            PipelineEvent::Progress { progress, message } => {
                Translated::Update(self.update(Some(progress), message))
            }
            PipelineEvent::Kpis { kpis } => {
                let message = format!("Identified {} KPIs", kpis.len());
                Translated::Update(
                    self.update(None, Some(message))
                        .with_patch(RecordPatch::IdentifiedKpis(kpis)),
                )
            }
            PipelineEvent::KpiStarted {
                kpi,
                progress,
                message,
            } => {
                let message = message.unwrap_or_else(|| format!("Analyzing KPI: {kpi}"));
                Translated::Update(
                    self.update(progress, Some(message))
                        .with_patch(RecordPatch::CurrentKpi(Some(kpi))),
                )
            }
            PipelineEvent::KpiResult {
                kpi,
                field,
                value,
                progress,
                message,
            } => Translated::Update(
                self.update(progress, message)
                    .with_patch(RecordPatch::kpi(kpi, field, value)),
            ),
            PipelineEvent::Summary {
                summary,
                progress,
                message,
            } => Translated::Update(
                self.update(progress, message)
                    .with_patch(RecordPatch::Summary(summary)),
            ),
            PipelineEvent::Completed {
                report_ref,
                raw_data_ref,
                summary,
            } => Translated::Completed(PipelineReport {
                report_ref,
                raw_data_ref,
                summary,
            }),
            PipelineEvent::Failed {
                error_detail,
                error_trace,
            } => Translated::Failed(PipelineFailure {
                error_trace: error_trace.unwrap_or_default(),
                error_detail,
            }),
        }
    }

    fn update(&mut self, progress: Option<f64>, message: Option<String>) -> ProgressUpdate {
        if let Some(progress) = progress {
            self.progress = progress.clamp(0.0, 1.0).max(self.progress);
        }
        if let Some(message) = message {
            self.message = message;
        }
        ProgressUpdate::new(
            TaskStatus::Processing,
            Some(self.progress),
            self.message.clone(),
        )
    }
}
