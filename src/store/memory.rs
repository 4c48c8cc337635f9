// src/store/memory.rs

//! In-process store backends.
//!
//! Used by the test suite and for running the dispatch core without external
//! services. Both types are cheap to clone and share state between clones.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DurableStore, FastCache};
use crate::errors::{DispatchError, Result};
use crate::progress::merge;
use crate::task::{FieldSet, TaskRecord};

#[derive(Debug, Default)]
struct CacheState {
    values: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    state: Arc<Mutex<CacheState>>,
    pushed: Arc<Notify>,
    failing: Arc<AtomicBool>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a cache error (or succeed
    /// again when `false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Store a raw value, bypassing serialization (e.g. a corrupt record).
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.state()
            .values
            .insert(key.to_string(), value.to_string());
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::CacheError(
                "in-memory cache configured to fail".to_string(),
            ));
        }
        Ok(())
    }

    fn try_move(&self, src: &str, dst: &str) -> Option<String> {
        let mut state = self.state();
        let value = state.lists.get_mut(src)?.pop_front()?;
        state
            .lists
            .entry(dst.to_string())
            .or_default()
            .push_back(value.clone());
        Some(value)
    }
}

#[async_trait]
impl FastCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.state().values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.state()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn push_tail(&self, list: &str, value: &str) -> Result<()> {
        self.check()?;
        self.state()
            .lists
            .entry(list.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn move_head_to_tail(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            self.check()?;

            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_move(src, dst) {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove_all(&self, list: &str, value: &str) -> Result<usize> {
        self.check()?;
        let mut state = self.state();
        let Some(items) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        let before = items.len();
        items.retain(|item| item != value);
        Ok(before - items.len())
    }

    async fn list(&self, list: &str) -> Result<Vec<String>> {
        self.check()?;
        Ok(self
            .state()
            .lists
            .get(list)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        self.check()?;
        Ok(self.state().lists.get(list).map_or(0, VecDeque::len))
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDurableStore {
    records: Arc<Mutex<HashMap<String, TaskRecord>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::DurableError(
                "in-memory durable store configured to fail".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn insert(&self, record: &TaskRecord) -> Result<()> {
        self.check()?;
        self.records()
            .entry(record.task_id.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.check()?;
        Ok(self.records().get(task_id).cloned())
    }

    async fn update_fields(&self, task_id: &str, fields: &FieldSet) -> Result<bool> {
        self.check()?;
        let mut records = self.records();
        let Some(record) = records.get_mut(task_id) else {
            return Ok(false);
        };
        merge::apply_fields(record, fields, Utc::now());
        Ok(true)
    }
}
