// src/store/mod.rs

//! Store abstractions.
//!
//! The dispatch core talks to two external services through these traits:
//!
//! - [`FastCache`]: key/value + list primitives (Redis in production). Holds
//!   the pending/processing queues and the polled record mirror.
//! - [`DurableStore`]: the authoritative Task Record collection (Postgres in
//!   production).
//!
//! [`memory`] provides in-process implementations of both for tests and
//! local runs; [`redis_cache`] and [`postgres`] are the production backends.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::Result;
use crate::task::{FieldSet, TaskRecord};

pub mod memory;
pub mod postgres;
pub mod redis_cache;

pub use memory::{InMemoryCache, InMemoryDurableStore};
pub use postgres::PgDurableStore;
pub use redis_cache::RedisCache;

/// Key/list-oriented cache primitives. Every method is a single atomic
/// cache operation.
#[async_trait]
pub trait FastCache: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Append `value` to the tail of `list`.
    async fn push_tail(&self, list: &str, value: &str) -> Result<()>;

    /// Atomically pop the head of `src` and append it to the tail of `dst`,
    /// waiting up to `timeout` for `src` to become non-empty.
    async fn move_head_to_tail(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Remove every occurrence of `value` from `list`; returns how many were
    /// removed.
    async fn remove_all(&self, list: &str, value: &str) -> Result<usize>;

    /// Snapshot of `list`, head first.
    async fn list(&self, list: &str) -> Result<Vec<String>>;

    async fn list_len(&self, list: &str) -> Result<usize>;
}

/// Authoritative Task Record collection.
#[async_trait]
pub trait DurableStore: Send + Sync + Debug {
    /// Insert a new record. Inserting an existing `task_id` is a no-op.
    async fn insert(&self, record: &TaskRecord) -> Result<()>;

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>>;

    /// Atomically apply `fields` to the stored record. Returns `false` when no
    /// record exists for `task_id`.
    async fn update_fields(&self, task_id: &str, fields: &FieldSet) -> Result<bool>;
}

/// Read a cached Task Record. A record that fails to deserialize is treated
/// as absent.
pub async fn load_cached(cache: &dyn FastCache, key: &str) -> Result<Option<TaskRecord>> {
    let Some(raw) = cache.get(key).await? else {
        return Ok(None);
    };

    match serde_json::from_str::<TaskRecord>(&raw) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            warn!(key, error = %err, "corrupt task record in cache; treating as absent");
            Ok(None)
        }
    }
}

pub async fn save_cached(cache: &dyn FastCache, key: &str, record: &TaskRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;
    cache.set(key, &json).await
}

/// Explicitly opened production store handles for one worker process.
#[derive(Debug, Clone)]
pub struct StoreHandles {
    pub cache: Arc<RedisCache>,
    pub durable: Arc<PgDurableStore>,
}

impl StoreHandles {
    /// Connect to both stores. The durable schema is expected to exist
    /// already (see [`PgDurableStore::migrate`]).
    pub async fn open(cache_url: &str, database_url: &str) -> Result<Self> {
        let cache = RedisCache::connect(cache_url).await?;
        let durable = PgDurableStore::connect(database_url).await?;

        Ok(Self {
            cache: Arc::new(cache),
            durable: Arc::new(durable),
        })
    }

    pub async fn close(self) {
        self.durable.close().await;
        info!("store handles closed");
    }
}
