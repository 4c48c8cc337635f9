#![allow(dead_code)]

use chrono::{DateTime, Utc};
use analysis_worker::task::{TaskRecord, TaskStatus};

/// Builder for `TaskRecord` to simplify test setup.
pub struct TaskRecordBuilder {
    record: TaskRecord,
}

impl TaskRecordBuilder {
    pub fn new(task_id: &str) -> Self {
        Self {
            record: TaskRecord::new(task_id, format!("blob://{task_id}")),
        }
    }

    pub fn source_ref(mut self, source_ref: &str) -> Self {
        self.record.source_ref = source_ref.to_string();
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.record.status = status;
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.record.progress = progress;
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.record.message = message.to_string();
        self
    }

    pub fn lease_expires(mut self, at: DateTime<Utc>) -> Self {
        self.record.lease_expires = Some(at);
        self
    }

    pub fn identified_kpis(mut self, kpis: &[&str]) -> Self {
        self.record.identified_kpis = kpis.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn build(self) -> TaskRecord {
        self.record
    }
}
