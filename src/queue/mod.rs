// src/queue/mod.rs

//! Queue Manager: at-least-once, lease-protected work distribution over the
//! fast cache.
//!
//! Two cache lists carry task ids:
//! - the pending queue (FIFO, producers append to the tail)
//! - the processing queue (ids currently leased by some worker)
//!
//! A dequeue moves an id between the two lists with a single atomic cache
//! primitive, so an id is never visible in both or in neither. Leases are
//! recorded as `lease_expires` on the cached Task Record; expired leases are
//! recovered by [`QueueManager::requeue_stale`], normally driven by the
//! watchdog.
//!
//! Recovery claims an id by removing it from the processing queue before it
//! rewrites the record, so a run that finishes mid-sweep keeps its terminal
//! state.

pub mod keys;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::errors::{DispatchError, Result};
use crate::progress::merge;
use crate::store::{load_cached, save_cached, DurableStore, FastCache};
use crate::task::{TaskRecord, TaskStatus};

pub use keys::QueueKeys;

/// Default lease granted to a worker on dequeue.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(25 * 60);

#[derive(Debug, Clone)]
pub struct QueueManager {
    cache: Arc<dyn FastCache>,
    /// Consulted for the source ref when a dequeued id has no cache record.
    durable: Option<Arc<dyn DurableStore>>,
    keys: QueueKeys,
    lease_duration: chrono::Duration,
}

impl QueueManager {
    pub fn new(cache: Arc<dyn FastCache>, keys: QueueKeys, lease_duration: Duration) -> Self {
        let lease_duration =
            chrono::Duration::from_std(lease_duration).unwrap_or(chrono::Duration::MAX);
        Self {
            cache,
            durable: None,
            keys,
            lease_duration,
        }
    }

    pub fn with_durable(mut self, durable: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn cache(&self) -> &Arc<dyn FastCache> {
        &self.cache
    }

    /// Write a pending cache record and append `task_id` to the pending
    /// queue. Returns `false` (after logging) on cache failure.
    pub async fn enqueue(&self, task_id: &str, source_ref: &str) -> bool {
        match self.try_enqueue(task_id, source_ref).await {
            Ok(()) => {
                info!(task_id, "task enqueued");
                true
            }
            Err(err) => {
                error!(task_id, error = %err, "failed to enqueue task");
                false
            }
        }
    }

    async fn try_enqueue(&self, task_id: &str, source_ref: &str) -> Result<()> {
        let mut record = TaskRecord::new(task_id, source_ref);
        record.message = "Task queued, waiting for processing".to_string();

        save_cached(self.cache.as_ref(), &self.keys.record(task_id), &record).await?;
        self.cache.push_tail(&self.keys.pending(), task_id).await
    }

    /// Lease the oldest pending task, waiting up to `poll_timeout` for one to
    /// arrive. Cache failures are logged and reported as "nothing to do".
    pub async fn dequeue(&self, poll_timeout: Duration) -> Option<TaskRecord> {
        match self.try_dequeue(poll_timeout).await {
            Ok(task) => task,
            Err(err) => {
                error!(error = %err, "failed to dequeue task");
                None
            }
        }
    }

    /// Like [`QueueManager::dequeue`] but surfaces cache errors to the caller.
    pub async fn try_dequeue(&self, poll_timeout: Duration) -> Result<Option<TaskRecord>> {
        let pending = self.keys.pending();
        let processing = self.keys.processing();

        let Some(task_id) = self
            .cache
            .move_head_to_tail(&pending, &processing, poll_timeout)
            .await?
        else {
            return Ok(None);
        };

        let key = self.keys.record(&task_id);
        let now = Utc::now();
        let mut record = match load_cached(self.cache.as_ref(), &key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(task_id = %task_id, "dequeued task has no usable cache record; synthesizing one");
                let source_ref = self.stored_source_ref(&task_id).await;
                TaskRecord::new_at(task_id.clone(), source_ref, now)
            }
            Err(err) => {
                self.release_unleased(&task_id).await;
                return Err(err);
            }
        };

        merge::start_attempt(&mut record);
        record.status = TaskStatus::Processing;
        record.lease_expires = Some(self.lease_from(now));
        record.message = "Task processing started".to_string();
        record.updated_at = now;

        if let Err(err) = save_cached(self.cache.as_ref(), &key, &record).await {
            self.release_unleased(&task_id).await;
            return Err(err);
        }

        debug!(task_id = %task_id, lease_expires = ?record.lease_expires, "task leased");
        Ok(Some(record))
    }

    /// Source ref from the durable record, or empty when there is no durable
    /// store or no record.
    async fn stored_source_ref(&self, task_id: &str) -> String {
        let Some(durable) = &self.durable else {
            return String::new();
        };
        match durable.get(task_id).await {
            Ok(Some(stored)) => stored.source_ref,
            Ok(None) => {
                warn!(task_id, "dequeued task has no durable record either");
                String::new()
            }
            Err(err) => {
                warn!(task_id, error = %err, "durable lookup for dequeued task failed");
                String::new()
            }
        }
    }

    /// Put an id that was moved to the processing queue but never got a lease
    /// back on the pending tail. Best-effort: if this fails, the watchdog
    /// stamps a lease on its next sweep and recovers the id once that expires.
    async fn release_unleased(&self, task_id: &str) {
        let result = async {
            self.cache
                .remove_all(&self.keys.processing(), task_id)
                .await?;
            self.cache.push_tail(&self.keys.pending(), task_id).await
        }
        .await;

        if let Err(err) = result {
            error!(task_id, error = %err, "failed to return unleased task to the pending queue");
        }
    }

    /// Release the lease on `task_id`. Idempotent.
    pub async fn ack(&self, task_id: &str) -> bool {
        match self
            .cache
            .remove_all(&self.keys.processing(), task_id)
            .await
        {
            Ok(removed) => {
                debug!(task_id, removed, "task acknowledged");
                true
            }
            Err(err) => {
                error!(task_id, error = %err, "failed to acknowledge task");
                false
            }
        }
    }

    /// Move every task whose lease expired before `now` back to the tail of
    /// the pending queue. Returns how many tasks were recovered.
    ///
    /// - Records already in a terminal state are dropped from the processing
    ///   queue without being re-queued, whatever their lease says.
    /// - An id with a record but no lease (its dequeue never wrote one) gets a
    ///   lease starting at `now`, so a later sweep can recover it.
    /// - Ids without a readable record are left alone.
    pub async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let processing = self.keys.processing();
        let ids = self.cache.list(&processing).await?;

        let mut seen = HashSet::new();
        let mut recovered = 0;

        for task_id in ids {
            if !seen.insert(task_id.clone()) {
                continue;
            }

            let key = self.keys.record(&task_id);
            let Some(mut record) = load_cached(self.cache.as_ref(), &key).await? else {
                warn!(task_id = %task_id, "leased task has no readable record; leaving in processing queue");
                continue;
            };

            if record.status.is_terminal() {
                self.cache.remove_all(&processing, &task_id).await?;
                if record.lease_expires.take().is_some() {
                    save_cached(self.cache.as_ref(), &key, &record).await?;
                }
                info!(
                    task_id = %task_id,
                    status = %record.status,
                    "dropped finished task from processing queue without re-queueing"
                );
                continue;
            }

            let Some(expires) = record.lease_expires else {
                let lease = self.lease_from(now);
                record.lease_expires = Some(lease);
                save_cached(self.cache.as_ref(), &key, &record).await?;
                warn!(task_id = %task_id, lease_expires = %lease, "task in processing queue had no lease; started one");
                continue;
            };
            if expires >= now {
                continue;
            }

            if self.requeue_claimed(&task_id, now).await? {
                recovered += 1;
                info!(task_id = %task_id, expired_at = %expires, "re-queued task with expired lease");
            }
        }

        Ok(recovered)
    }

    /// Claim an expired id by removing it from the processing queue, then mark
    /// it pending and append it to the pending tail. Returns `false` when the
    /// id was already gone or its run finished before the claim.
    async fn requeue_claimed(&self, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let removed = self
            .cache
            .remove_all(&self.keys.processing(), task_id)
            .await?;
        if removed == 0 {
            debug!(task_id, "stale task already left the processing queue");
            return Ok(false);
        }

        let key = self.keys.record(task_id);
        let saved = match load_cached(self.cache.as_ref(), &key).await {
            Ok(Some(record)) if record.status.is_terminal() => {
                info!(
                    task_id,
                    status = %record.status,
                    "task finished while its lease was being recovered; not re-queueing"
                );
                return Ok(false);
            }
            Ok(Some(mut record)) => {
                record.lease_expires = None;
                record.status = TaskStatus::Pending;
                record.message = "Lease expired, task re-queued".to_string();
                record.updated_at = now;
                save_cached(self.cache.as_ref(), &key, &record).await
            }
            // dequeue synthesizes a record for ids that lost theirs
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };

        // The id is out of the processing queue now; put it back on the
        // pending queue even when the record write failed.
        self.cache.push_tail(&self.keys.pending(), task_id).await?;
        saved?;
        Ok(true)
    }

    fn lease_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.lease_duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Cached record for `task_id`, if any.
    pub async fn record(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        load_cached(self.cache.as_ref(), &self.keys.record(task_id)).await
    }

    /// Cached record for `task_id`, or [`DispatchError::TaskNotFound`].
    pub async fn require_record(&self, task_id: &str) -> Result<TaskRecord> {
        self.record(task_id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(task_id.to_string()))
    }

    pub async fn pending_ids(&self) -> Result<Vec<String>> {
        self.cache.list(&self.keys.pending()).await
    }

    pub async fn processing_ids(&self) -> Result<Vec<String>> {
        self.cache.list(&self.keys.processing()).await
    }

    pub async fn pending_len(&self) -> Result<usize> {
        self.cache.list_len(&self.keys.pending()).await
    }

    pub async fn processing_len(&self) -> Result<usize> {
        self.cache.list_len(&self.keys.processing()).await
    }
}
