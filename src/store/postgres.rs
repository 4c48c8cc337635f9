// src/store/postgres.rs

//! Postgres-backed [`DurableStore`].
//!
//! Each Task Record is kept as one JSONB document keyed by `task_id`.
//! Field-level updates lock the row, merge in Rust with the same rules as the
//! cache mirror, and write the document back inside one transaction.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{debug, info};

use super::DurableStore;
use crate::errors::Result;
use crate::progress::merge;
use crate::task::{FieldSet, TaskRecord};

const SCHEMA: &str = include_str!("../../migrations/0001_analysis_tasks.sql");

#[derive(Debug, Clone)]
pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to durable store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the task table if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("durable schema ensured");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl DurableStore for PgDurableStore {
    async fn insert(&self, record: &TaskRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO analysis_tasks (task_id, record, created_at, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (task_id) DO NOTHING",
        )
        .bind(&record.task_id)
        .bind(Json(record))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let record: Option<Json<TaskRecord>> =
            sqlx::query_scalar("SELECT record FROM analysis_tasks WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record.map(|Json(record)| record))
    }

    async fn update_fields(&self, task_id: &str, fields: &FieldSet) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Option<Json<TaskRecord>> = sqlx::query_scalar(
            "SELECT record FROM analysis_tasks WHERE task_id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(Json(mut record)) = current else {
            tx.rollback().await?;
            return Ok(false);
        };

        let now = Utc::now();
        merge::apply_fields(&mut record, fields, now);

        sqlx::query("UPDATE analysis_tasks SET record = $2, updated_at = $3 WHERE task_id = $1")
            .bind(task_id)
            .bind(Json(&record))
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}
