// src/progress/mod.rs

//! Progress Synchronizer.
//!
//! Publishes partial task state to the durable store (authoritative) and the
//! cache mirror (polled by clients) without clobbering nested per-KPI fields
//! written by concurrent updates.
//!
//! The merge rules themselves live in [`merge`] and are shared with the
//! store backends.

pub mod merge;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::errors::{DispatchError, Result};
use crate::queue::QueueKeys;
use crate::store::{load_cached, save_cached, DurableStore, FastCache};
use crate::task::{FieldSet, RecordPatch, TaskRecord, TaskStatus};

/// One stage-boundary update destined for both stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: TaskStatus,
    /// `None` leaves the stored progress untouched.
    pub progress: Option<f64>,
    pub message: String,
    pub patches: Vec<RecordPatch>,
}

impl ProgressUpdate {
    pub fn new(status: TaskStatus, progress: Option<f64>, message: impl Into<String>) -> Self {
        Self {
            status,
            progress,
            message: message.into(),
            patches: Vec::new(),
        }
    }

    /// Shorthand for an in-flight update at `progress`.
    pub fn processing(progress: f64, message: impl Into<String>) -> Self {
        Self::new(TaskStatus::Processing, Some(progress), message)
    }

    pub fn with_patch(mut self, patch: RecordPatch) -> Self {
        self.patches.push(patch);
        self
    }

    /// The equivalent field-level durable update.
    pub fn to_fields(&self) -> FieldSet {
        FieldSet {
            status: Some(self.status),
            progress: self.progress,
            message: Some(self.message.clone()),
            patches: self.patches.clone(),
        }
    }
}

type TaskLocks = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone)]
pub struct ProgressSynchronizer {
    cache: Arc<dyn FastCache>,
    durable: Arc<dyn DurableStore>,
    keys: QueueKeys,
    locks: TaskLocks,
}

impl fmt::Debug for ProgressSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSynchronizer")
            .field("cache", &self.cache)
            .field("durable", &self.durable)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl ProgressSynchronizer {
    pub fn new(
        cache: Arc<dyn FastCache>,
        durable: Arc<dyn DurableStore>,
        keys: QueueKeys,
    ) -> Self {
        Self {
            cache,
            durable,
            keys,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Single atomic field-level set against the durable record.
    pub async fn update_durable(&self, task_id: &str, fields: &FieldSet) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        if self.durable.update_fields(task_id, fields).await? {
            Ok(())
        } else {
            Err(DispatchError::TaskNotFound(task_id.to_string()))
        }
    }

    /// Merge an update into the cache mirror and persist the whole record.
    ///
    /// An absent or unreadable record is replaced by a fresh one built from
    /// the arguments. Updates for the same task from this process are
    /// serialized; across processes the cache record is last-writer-wins.
    pub async fn update_cache(
        &self,
        task_id: &str,
        status: TaskStatus,
        progress: Option<f64>,
        message: &str,
        patches: Vec<RecordPatch>,
    ) -> Result<TaskRecord> {
        let _guard = self.lock_task(task_id).await;

        let key = self.keys.record(task_id);
        let now = Utc::now();
        let mut record = match load_cached(self.cache.as_ref(), &key).await? {
            Some(record) => record,
            None => {
                debug!(task_id, "no usable cache record; synthesizing a fresh one");
                TaskRecord::new_at(task_id, "", now)
            }
        };

        merge::apply_progress(&mut record, status, progress);
        record.message = message.to_string();
        record.updated_at = now;
        for patch in patches {
            merge::apply_patch(&mut record, patch);
        }
        merge::finalize(&mut record);

        save_cached(self.cache.as_ref(), &key, &record).await?;
        Ok(record)
    }

    /// Best-effort publish to both stores, durable first.
    ///
    /// Failures are logged and dropped: a missed intermediate update is
    /// superseded by the next one.
    pub async fn publish(&self, task_id: &str, update: ProgressUpdate) {
        if let Err(err) = self.update_durable(task_id, &update.to_fields()).await {
            warn!(task_id, error = %err, "durable progress update failed");
        }

        let ProgressUpdate {
            status,
            progress,
            message,
            patches,
        } = update;
        if let Err(err) = self
            .update_cache(task_id, status, progress, &message, patches)
            .await
        {
            warn!(task_id, error = %err, "cache progress update failed");
        }
    }

    async fn lock_task(&self, task_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(task_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}
