//! Coordinator for one run of a copy job.
//!
//! A run checks whether it is allowed to start, computes partitions from the
//! last watermark, fans them out to workers and then records the outcome.
//! The watermark only moves when every partition succeeded.

use chrono::Utc;
use snafu::prelude::*;
use sqlx::AnyPool;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointStore, RunStatus, SqlCheckpointStore};
use crate::config::{Config, LauncherKind};
use crate::db::{self, Dialect};
use crate::dispatch::{
    InProcessLauncher, ProcessLauncher, WorkerDispatcher, WorkerLauncher,
};
use crate::emit;
use crate::error::{
    CheckpointSnafu, ConfigSnafu, JobError, PartialFailureSnafu, QuerySnafu,
    RestartPreventedSnafu, WorkerSnafu,
};
use crate::metrics::events::JobFinished;
use crate::partition::{PartitionPlan, RangePartitioner};
use crate::worker::WorkerContext;

/// Statistics about a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStats {
    pub partitions: usize,
    pub rows_written: u64,
    /// Watermark committed by this run (incremental only).
    pub watermark: Option<i64>,
    /// Subdirectory the run wrote into (incremental only).
    pub run_directory: Option<String>,
}

/// A configured copy job, ready to run.
pub struct Job {
    config: Arc<Config>,
    pool: AnyPool,
    partitioner: RangePartitioner,
    dispatcher: WorkerDispatcher,
    store: Arc<dyn CheckpointStore>,
}

impl Job {
    pub fn new(
        config: Arc<Config>,
        pool: AnyPool,
        launcher: Arc<dyn WorkerLauncher>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, JobError> {
        config.validate().context(ConfigSnafu)?;
        let partitioner = RangePartitioner::from_config(&config.source).context(ConfigSnafu)?;
        let dispatcher = WorkerDispatcher::new(launcher, config.workers.max_workers);
        Ok(Self {
            config,
            pool,
            partitioner,
            dispatcher,
            store,
        })
    }

    fn name(&self) -> &str {
        &self.config.job.name
    }

    /// Check restart rules and compute this run's partitions.
    pub async fn plan(&self) -> Result<PartitionPlan, JobError> {
        let job = self.name();
        let checkpoint = self.store.read(job).await.context(CheckpointSnafu)?;

        if let Some(checkpoint) = &checkpoint {
            debug!(
                job,
                status = %checkpoint.last_status,
                watermark = ?checkpoint.watermark,
                updated_at = %checkpoint.updated_at,
                "Loaded checkpoint"
            );
            ensure!(
                !checkpoint.last_run_failed() || self.config.job.restartable,
                RestartPreventedSnafu { job }
            );
        }

        let resume = if self.config.is_incremental() {
            checkpoint.and_then(|c| c.watermark)
        } else {
            None
        };
        if let Some(watermark) = resume {
            info!(job, watermark, "Resuming from watermark");
        }

        self.partitioner
            .compute_ranges(&self.pool, resume)
            .await
            .context(QuerySnafu)
    }

    /// Run the job to completion and record its outcome.
    pub async fn run(&self) -> Result<JobStats, JobError> {
        let start = Instant::now();
        info!(job = self.name(), "Starting job");

        let result = self.execute().await;
        let success = result.is_ok();

        match &result {
            Ok(stats) => info!(
                job = self.name(),
                partitions = stats.partitions,
                rows = stats.rows_written,
                watermark = ?stats.watermark,
                run_directory = stats.run_directory.as_deref().unwrap_or("-"),
                elapsed_ms = start.elapsed().as_millis(),
                "Job completed"
            ),
            Err(JobError::RestartPrevented { .. }) => {}
            Err(e) => {
                error!(job = self.name(), error = %e, "Job failed");
                if let Err(e) = self.store.record_status(self.name(), RunStatus::Failed).await {
                    warn!(job = self.name(), error = %e, "Could not record failed run");
                }
            }
        }

        emit!(JobFinished {
            success,
            duration: start.elapsed(),
        });
        result
    }

    async fn execute(&self) -> Result<JobStats, JobError> {
        let plan = self.plan().await?;
        let job = self.name();

        if plan.is_empty() {
            info!(job, "No rows to copy");
            self.store
                .record_status(job, RunStatus::Completed)
                .await
                .context(CheckpointSnafu)?;
            return Ok(JobStats::default());
        }

        let partitions = plan.partitions.len();
        let run_directory = plan.run_directory(Utc::now());
        let outcome = self
            .dispatcher
            .dispatch(plan.partitions, run_directory.as_deref())
            .await;
        let failed = outcome.failed_indices();
        ensure!(failed.is_empty(), PartialFailureSnafu { failed });

        let watermark = plan.high_watermark;
        let committed = match watermark {
            Some(w) => self.store.write_watermark(job, w).await,
            None => self.store.record_status(job, RunStatus::Completed).await,
        };
        committed.context(CheckpointSnafu)?;

        Ok(JobStats {
            partitions,
            rows_written: outcome.rows_written(),
            watermark,
            run_directory,
        })
    }
}

/// Build a job from configuration, wiring the launcher and checkpoint store
/// the configuration asks for.
///
/// `config_path` is handed to worker processes so they load the same file.
pub async fn build_job(config: Config, config_path: &Path) -> Result<Job, JobError> {
    let config = Arc::new(config);
    let ctx = Arc::new(WorkerContext::connect(Arc::clone(&config)).await?);

    let launcher: Arc<dyn WorkerLauncher> = match config.workers.launcher {
        LauncherKind::InProcess => Arc::new(InProcessLauncher::new(Arc::clone(&ctx))),
        LauncherKind::Process => {
            let launcher = match &config.workers.program {
                Some(program) => ProcessLauncher::new(program, config_path),
                None => ProcessLauncher::current_exe(config_path).context(WorkerSnafu)?,
            };
            Arc::new(launcher)
        }
    };

    let checkpoint_url = config.checkpoint_url();
    let checkpoint_pool = if checkpoint_url == config.source.url {
        ctx.pool.clone()
    } else {
        db::connect(checkpoint_url, 1).await.context(QuerySnafu)?
    };
    let store = SqlCheckpointStore::new(
        checkpoint_pool,
        config.checkpoint.table.clone(),
        Dialect::from_url(checkpoint_url),
    )
    .await
    .context(CheckpointSnafu)?;

    debug!(
        launcher = launcher.name(),
        security = config.sink.security.method(),
        "Job wired"
    );
    Job::new(config, ctx.pool.clone(), launcher, Arc::new(store))
}

/// Build and run a job.
pub async fn run_job(config: Config, config_path: &Path) -> Result<JobStats, JobError> {
    build_job(config, config_path).await?.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, MemoryCheckpointStore};
    use crate::dispatch::{WorkerAssignment, WorkerResult};
    use async_trait::async_trait;

    /// Succeeds with one row per unit of range, failing chosen partitions.
    struct FakeLauncher {
        fail: Vec<usize>,
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self, assignment: WorkerAssignment) -> WorkerResult {
            let index = assignment.partition.index;
            if self.fail.contains(&index) {
                WorkerResult::failure(index, "boom")
            } else {
                WorkerResult::success(index, 2)
            }
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn config(check_column: Option<&str>, restartable: bool) -> Arc<Config> {
        let mut yaml = format!(
            "job: {{name: foo, restartable: {restartable}}}\n\
             source:\n  url: 'sqlite::memory:'\n  table: FOO\n  columns: 'id,name'\n  partition_column: id\n  partitions: 3\n"
        );
        if let Some(c) = check_column {
            yaml.push_str(&format!("  check_column: {c}\n"));
        }
        Arc::new(Config::from_yaml(&yaml).unwrap())
    }

    async fn pool() -> AnyPool {
        let pool = db::connect("sqlite::memory:", 1).await.unwrap();
        sqlx::query("CREATE TABLE FOO (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        for id in 1..=6 {
            sqlx::query(&format!("INSERT INTO FOO VALUES ({id}, 'n{id}')"))
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    fn job(
        config: Arc<Config>,
        pool: AnyPool,
        fail: Vec<usize>,
        store: Arc<MemoryCheckpointStore>,
    ) -> Job {
        Job::new(config, pool, Arc::new(FakeLauncher { fail }), store).unwrap()
    }

    #[tokio::test]
    async fn test_full_copy_records_completion() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let job = job(config(None, false), pool().await, vec![], store.clone());

        let stats = job.run().await.unwrap();
        assert_eq!(stats.partitions, 3);
        assert_eq!(stats.rows_written, 6);
        assert_eq!(stats.watermark, None);
        assert_eq!(stats.run_directory, None);

        let checkpoint = store.read("foo").await.unwrap().unwrap();
        assert_eq!(checkpoint.last_status, RunStatus::Completed);
        assert_eq!(checkpoint.watermark, None);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_watermark() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.write_watermark("foo", 0).await.unwrap();
        let job = job(config(Some("id"), false), pool().await, vec![1], store.clone());

        let err = job.run().await.unwrap_err();
        assert_eq!(err.failed_partitions(), &[1]);

        let checkpoint = store.read("foo").await.unwrap().unwrap();
        assert_eq!(checkpoint.watermark, Some(0));
        assert!(checkpoint.last_run_failed());
    }

    #[tokio::test]
    async fn test_incremental_advances_watermark() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let job = job(config(Some("id"), false), pool().await, vec![], store.clone());

        let stats = job.run().await.unwrap();
        assert_eq!(stats.watermark, Some(6));
        assert!(stats.run_directory.unwrap().starts_with("start-6_"));
        assert_eq!(store.read_watermark("foo").await.unwrap(), Some(6));

        // Nothing new since the last run.
        let stats = job.run().await.unwrap();
        assert_eq!(stats.partitions, 0);
        assert_eq!(store.read_watermark("foo").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_failed_run_blocks_restart() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store
            .insert(Checkpoint {
                job_identity: "foo".into(),
                watermark: Some(3),
                last_status: RunStatus::Failed,
                updated_at: Utc::now(),
            })
            .await;

        let blocked = job(config(None, false), pool().await, vec![], store.clone());
        let err = blocked.run().await.unwrap_err();
        assert!(matches!(err, JobError::RestartPrevented { .. }));

        let allowed = job(config(None, true), pool().await, vec![], store.clone());
        allowed.run().await.unwrap();
        assert!(!store.read("foo").await.unwrap().unwrap().last_run_failed());
    }

    #[tokio::test]
    async fn test_plan_resumes_from_watermark() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store.write_watermark("foo", 4).await.unwrap();
        let job = job(config(Some("id"), false), pool().await, vec![], store);

        let plan = job.plan().await.unwrap();
        assert_eq!(plan.high_watermark, Some(6));
        assert!(!plan.is_empty());
        for spec in &plan.partitions {
            assert!(spec.where_clause.contains("id > 4 AND id <= 6"));
        }
    }
}
