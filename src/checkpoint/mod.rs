//! Watermark and run status persistence across job runs.
//!
//! The coordinator is the only writer. The watermark advances once per
//! run, after every partition succeeded; a failed run records `Failed` and
//! leaves the previous watermark in place so the next run resumes from the
//! last good point.

pub mod state;

pub use state::{Checkpoint, RunStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use sqlx::{AnyPool, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::db::Dialect;
use crate::emit;
use crate::error::{
    CheckpointError, CreateTableSnafu, InvalidTimestampSnafu, StoreSnafu, UnknownStatusSnafu,
};
use crate::metrics::events::WatermarkAdvanced;

/// Durable checkpoint storage keyed by job identity.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a job, if one was ever written.
    async fn read(&self, job: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Record a successful run that copied everything up to `watermark`.
    async fn write_watermark(&self, job: &str, watermark: i64) -> Result<(), CheckpointError>;

    /// Record the outcome of a run without touching the watermark.
    async fn record_status(&self, job: &str, status: RunStatus) -> Result<(), CheckpointError>;

    /// Last committed watermark; `None` on the first run.
    async fn read_watermark(&self, job: &str) -> Result<Option<i64>, CheckpointError> {
        Ok(self.read(job).await?.and_then(|c| c.watermark))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a checkpoint.
    pub async fn insert(&self, checkpoint: Checkpoint) {
        self.entries
            .lock()
            .await
            .insert(checkpoint.job_identity.clone(), checkpoint);
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn read(&self, job: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.entries.lock().await.get(job).cloned())
    }

    async fn write_watermark(&self, job: &str, watermark: i64) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            job.to_string(),
            Checkpoint {
                job_identity: job.to_string(),
                watermark: Some(watermark),
                last_status: RunStatus::Completed,
                updated_at: Utc::now(),
            },
        );
        emit!(WatermarkAdvanced { watermark });
        Ok(())
    }

    async fn record_status(&self, job: &str, status: RunStatus) -> Result<(), CheckpointError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(job.to_string())
            .or_insert_with(|| Checkpoint {
                job_identity: job.to_string(),
                watermark: None,
                last_status: status,
                updated_at: Utc::now(),
            });
        entry.last_status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

/// Checkpoints in a database table, created on first use.
pub struct SqlCheckpointStore {
    pool: AnyPool,
    table: String,
    dialect: Dialect,
}

impl SqlCheckpointStore {
    /// Wrap `pool` and make sure the checkpoint table exists.
    pub async fn new(
        pool: AnyPool,
        table: impl Into<String>,
        dialect: Dialect,
    ) -> Result<Self, CheckpointError> {
        let store = Self {
            pool,
            table: table.into(),
            dialect,
        };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<(), CheckpointError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             job_identity VARCHAR(255) NOT NULL PRIMARY KEY, \
             watermark BIGINT, \
             last_status VARCHAR(16) NOT NULL, \
             updated_at VARCHAR(64) NOT NULL)",
            self.table
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .context(CreateTableSnafu {
                table: self.table.clone(),
            })?;
        debug!(table = %self.table, "Checkpoint table ready");
        Ok(())
    }

    fn p(&self, n: usize) -> String {
        self.dialect.placeholder(n)
    }

    /// Update the row for `job`, inserting it when missing.
    async fn upsert(
        &self,
        job: &str,
        watermark: Option<i64>,
        status: RunStatus,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now().to_rfc3339();

        let updated = match watermark {
            Some(w) => {
                let sql = format!(
                    "UPDATE {} SET watermark = {}, last_status = {}, updated_at = {} WHERE job_identity = {}",
                    self.table,
                    self.p(1),
                    self.p(2),
                    self.p(3),
                    self.p(4)
                );
                sqlx::query(&sql)
                    .bind(w)
                    .bind(status.as_str())
                    .bind(now.as_str())
                    .bind(job)
                    .execute(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "UPDATE {} SET last_status = {}, updated_at = {} WHERE job_identity = {}",
                    self.table,
                    self.p(1),
                    self.p(2),
                    self.p(3)
                );
                sqlx::query(&sql)
                    .bind(status.as_str())
                    .bind(now.as_str())
                    .bind(job)
                    .execute(&self.pool)
                    .await
            }
        }
        .context(StoreSnafu { job })?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let inserted = match watermark {
            Some(w) => {
                let sql = format!(
                    "INSERT INTO {} (job_identity, watermark, last_status, updated_at) VALUES ({}, {}, {}, {})",
                    self.table,
                    self.p(1),
                    self.p(2),
                    self.p(3),
                    self.p(4)
                );
                sqlx::query(&sql)
                    .bind(job)
                    .bind(w)
                    .bind(status.as_str())
                    .bind(now.as_str())
                    .execute(&self.pool)
                    .await
            }
            None => {
                let sql = format!(
                    "INSERT INTO {} (job_identity, last_status, updated_at) VALUES ({}, {}, {})",
                    self.table,
                    self.p(1),
                    self.p(2),
                    self.p(3)
                );
                sqlx::query(&sql)
                    .bind(job)
                    .bind(status.as_str())
                    .bind(now.as_str())
                    .execute(&self.pool)
                    .await
            }
        };
        inserted.context(StoreSnafu { job })?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqlCheckpointStore {
    async fn read(&self, job: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let sql = format!(
            "SELECT watermark, last_status, updated_at FROM {} WHERE job_identity = {}",
            self.table,
            self.p(1)
        );
        let Some(row) = sqlx::query(&sql)
            .bind(job)
            .fetch_optional(&self.pool)
            .await
            .context(StoreSnafu { job })?
        else {
            return Ok(None);
        };

        let watermark: Option<i64> = row.try_get(0).context(StoreSnafu { job })?;
        let status: String = row.try_get(1).context(StoreSnafu { job })?;
        let updated_at: String = row.try_get(2).context(StoreSnafu { job })?;

        let last_status = status
            .parse::<RunStatus>()
            .map_err(|status| UnknownStatusSnafu { job, status }.build())?;
        let updated_at = DateTime::parse_from_rfc3339(&updated_at)
            .context(InvalidTimestampSnafu {
                job,
                value: updated_at.clone(),
            })?
            .with_timezone(&Utc);

        Ok(Some(Checkpoint {
            job_identity: job.to_string(),
            watermark,
            last_status,
            updated_at,
        }))
    }

    async fn write_watermark(&self, job: &str, watermark: i64) -> Result<(), CheckpointError> {
        self.upsert(job, Some(watermark), RunStatus::Completed)
            .await?;
        emit!(WatermarkAdvanced { watermark });
        debug!(job, watermark, "Watermark written");
        Ok(())
    }

    async fn record_status(&self, job: &str, status: RunStatus) -> Result<(), CheckpointError> {
        self.upsert(job, None, status).await?;
        debug!(job, status = %status, "Run status recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect;

    async fn sql_store() -> SqlCheckpointStore {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        SqlCheckpointStore::new(pool, "sluice_checkpoint", Dialect::Sqlite)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_run_has_no_watermark() {
        let store = sql_store().await;
        assert_eq!(store.read("orders").await.unwrap(), None);
        assert_eq!(store.read_watermark("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read_watermark() {
        let store = sql_store().await;
        store.write_watermark("orders", 42).await.unwrap();
        store.write_watermark("orders", 57).await.unwrap();

        let checkpoint = store.read("orders").await.unwrap().unwrap();
        assert_eq!(checkpoint.watermark, Some(57));
        assert_eq!(checkpoint.last_status, RunStatus::Completed);
        assert_eq!(store.read_watermark("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_keeps_watermark() {
        let store = sql_store().await;
        store.write_watermark("orders", 10).await.unwrap();
        store
            .record_status("orders", RunStatus::Failed)
            .await
            .unwrap();

        let checkpoint = store.read("orders").await.unwrap().unwrap();
        assert_eq!(checkpoint.watermark, Some(10));
        assert!(checkpoint.last_run_failed());
    }

    #[tokio::test]
    async fn test_status_without_watermark() {
        let store = sql_store().await;
        store
            .record_status("full-copy", RunStatus::Completed)
            .await
            .unwrap();
        let checkpoint = store.read("full-copy").await.unwrap().unwrap();
        assert_eq!(checkpoint.watermark, None);
        assert_eq!(checkpoint.last_status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_table_creation_is_repeatable() {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        SqlCheckpointStore::new(pool.clone(), "cp", Dialect::Sqlite)
            .await
            .unwrap();
        let store = SqlCheckpointStore::new(pool, "cp", Dialect::Sqlite)
            .await
            .unwrap();
        store.write_watermark("j", 1).await.unwrap();
        assert_eq!(store.read_watermark("j").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        store.record_status("j", RunStatus::Failed).await.unwrap();
        assert_eq!(store.read_watermark("j").await.unwrap(), None);
        store.write_watermark("j", 5).await.unwrap();
        let checkpoint = store.read("j").await.unwrap().unwrap();
        assert_eq!(checkpoint.watermark, Some(5));
        assert!(!checkpoint.last_run_failed());
    }
}
