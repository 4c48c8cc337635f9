// src/store/redis_cache.rs

//! Redis-backed [`FastCache`].
//!
//! Regular commands share one auto-reconnecting `ConnectionManager`. The
//! blocking `BLMOVE` used by dequeue runs on a dedicated connection so that
//! an idle worker waiting on an empty queue never stalls progress writes.
//! That connection has no client response timeout: the driver's default
//! would abandon a `BLMOVE` before the server finishes blocking, and the id
//! the server then moves would never get a lease.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, AsyncConnectionConfig};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::FastCache;
use crate::errors::{DispatchError, Result};

/// Extra slack on top of the server-side block timeout before the client
/// gives up on a `BLMOVE` reply.
const BLOCKING_REPLY_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    blocking: Arc<Mutex<MultiplexedConnection>>,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis cache at {}", redis_url);

        let client = redis::Client::open(redis_url).map_err(|e| {
            DispatchError::CacheError(format!("Failed to create Redis client: {e}"))
        })?;

        let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
            DispatchError::CacheError(format!("Failed to connect to Redis: {e}"))
        })?;

        let blocking_config = AsyncConnectionConfig::new().set_response_timeout(None);
        let blocking = client
            .get_multiplexed_async_connection_with_config(&blocking_config)
            .await
            .map_err(|e| {
                DispatchError::CacheError(format!(
                    "Failed to open blocking Redis connection: {e}"
                ))
            })?;

        info!("Successfully connected to Redis cache");

        Ok(Self {
            conn,
            blocking: Arc::new(Mutex::new(blocking)),
        })
    }
}

#[async_trait]
impl FastCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        debug!("Cache GET: {}", key);
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        debug!("Cache SET: {}", key);
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn push_tail(&self, list: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(list, value).await?;
        Ok(())
    }

    async fn move_head_to_tail(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        if timeout.is_zero() {
            let mut conn = self.conn.clone();
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(src)
                .arg(dst)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            return Ok(moved);
        }

        let mut conn = self.blocking.lock().await;
        let command = redis::cmd("BLMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .to_owned();

        let reply = tokio::time::timeout(
            timeout + BLOCKING_REPLY_GRACE,
            command.query_async::<Option<String>>(&mut *conn),
        )
        .await
        .map_err(|_| DispatchError::CacheError("BLMOVE reply timed out".to_string()))??;

        Ok(reply)
    }

    async fn remove_all(&self, list: &str, value: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.lrem(list, 0, value).await?;
        Ok(removed)
    }

    async fn list(&self, list: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(list, 0, -1).await?;
        Ok(items)
    }

    async fn list_len(&self, list: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(list).await?;
        Ok(len)
    }
}
