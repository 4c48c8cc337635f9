// src/task/record.rs

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Lifecycle of a task.
///
/// `Pending -> Processing -> {Completed | Failed}`. `Pending` is only
/// re-entered through lease recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressable fields of a single KPI's partial result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiField {
    VisualizationRef,
    Insights,
    Error,
}

/// Per-KPI sub-state accumulated while a task is processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KpiResult {
    /// True when no field carries a non-blank value.
    pub fn is_empty(&self) -> bool {
        [&self.visualization_ref, &self.insights, &self.error]
            .iter()
            .all(|v| v.as_deref().is_none_or(|s| s.trim().is_empty()))
    }

    pub fn get(&self, field: KpiField) -> Option<&str> {
        match field {
            KpiField::VisualizationRef => self.visualization_ref.as_deref(),
            KpiField::Insights => self.insights.as_deref(),
            KpiField::Error => self.error.as_deref(),
        }
    }

    pub fn set(&mut self, field: KpiField, value: String) {
        let slot = match field {
            KpiField::VisualizationRef => &mut self.visualization_ref,
            KpiField::Insights => &mut self.insights,
            KpiField::Error => &mut self.error,
        };
        *slot = Some(value);
    }
}

/// Partial results keyed by normalized KPI id, in `identified_kpis` order.
pub type PartialResults = IndexMap<String, KpiResult>;

/// Canonical form of a KPI identifier used as a `partial_results` key.
pub fn normalize_kpi(kpi: &str) -> String {
    kpi.trim().to_lowercase()
}

/// One analysis job, as stored in both the durable store and the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,

    #[serde(default)]
    pub source_ref: String,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub progress: f64,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identified_kpis: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub partial_results: PartialResults,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_kpi: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,

    /// Present only while the task id sits in the processing queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Fresh pending record stamped with the current time.
    pub fn new(task_id: impl Into<String>, source_ref: impl Into<String>) -> Self {
        Self::new_at(task_id, source_ref, Utc::now())
    }

    pub fn new_at(
        task_id: impl Into<String>,
        source_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            source_ref: source_ref.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            message: String::new(),
            identified_kpis: Vec::new(),
            partial_results: PartialResults::new(),
            current_kpi: None,
            summary: None,
            report_ref: None,
            raw_data_ref: None,
            error_detail: None,
            error_trace: None,
            lease_expires: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a KPI's partial result, tolerating case variance in `kpi`.
    pub fn partial(&self, kpi: &str) -> Option<&KpiResult> {
        self.partial_results.get(&normalize_kpi(kpi))
    }

    /// True when a lease is recorded and it ended strictly before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires.is_some_and(|expires| expires < now)
    }
}
