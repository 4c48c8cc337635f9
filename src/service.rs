// src/service.rs

//! Submission and status lookup, the two operations the ingestion side needs.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{DispatchError, Result};
use crate::queue::QueueManager;
use crate::store::DurableStore;
use crate::task::TaskRecord;

#[derive(Debug, Clone)]
pub struct TaskService {
    queue: QueueManager,
    durable: Arc<dyn DurableStore>,
}

impl TaskService {
    pub fn new(queue: QueueManager, durable: Arc<dyn DurableStore>) -> Self {
        Self { queue, durable }
    }

    /// Create a Task Record with a fresh id and queue it.
    pub async fn submit(&self, source_ref: &str) -> Result<TaskRecord> {
        let task_id = Uuid::new_v4().to_string();
        self.submit_with_id(&task_id, source_ref).await
    }

    /// Create a Task Record under `task_id` in the durable store, then queue
    /// it. Re-submitting an existing id keeps the stored record.
    pub async fn submit_with_id(&self, task_id: &str, source_ref: &str) -> Result<TaskRecord> {
        let mut record = TaskRecord::new(task_id, source_ref);
        record.message = "Analysis queued".to_string();
        self.durable.insert(&record).await?;

        if !self.queue.enqueue(task_id, source_ref).await {
            return Err(DispatchError::CacheError(format!(
                "failed to enqueue task {task_id}"
            )));
        }

        info!(task_id, source_ref, "analysis submitted");
        Ok(record)
    }

    /// Current state of `task_id`: the cache mirror first, then the durable
    /// store. `None` when neither knows the task.
    pub async fn get_status(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        match self.queue.record(task_id).await {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => {}
            Err(err) => {
                warn!(task_id, error = %err, "cache status lookup failed; using durable store");
            }
        }
        self.durable.get(task_id).await
    }
}
