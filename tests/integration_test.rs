//! Integration tests for sluice

use async_trait::async_trait;
use sluice::checkpoint::{CheckpointStore, SqlCheckpointStore};
use sluice::config::{CollisionPolicy, Config, LauncherKind};
use sluice::db::{self, Dialect};
use sluice::dispatch::{InProcessLauncher, WorkerAssignment, WorkerLauncher, WorkerResult};
use sluice::error::{ConfigError, JobError};
use sluice::worker::WorkerContext;
use sluice::{Job, build_job};
use sqlx::AnyPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    db_url: String,
}

impl Fixture {
    /// SQLite database with `FOO(id, name)` holding ids `1..=rows`.
    async fn new(rows: i64) -> Self {
        let dir = TempDir::new().unwrap();
        let db_url = format!("sqlite://{}?mode=rwc", dir.path().join("source.db").display());
        let fixture = Self { dir, db_url };

        let pool = fixture.pool().await;
        sqlx::query("CREATE TABLE FOO (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        fixture.insert(&pool, 1..=rows).await;
        pool.close().await;
        fixture
    }

    async fn pool(&self) -> AnyPool {
        db::connect(&self.db_url, 1).await.unwrap()
    }

    async fn insert(&self, pool: &AnyPool, ids: std::ops::RangeInclusive<i64>) {
        for id in ids {
            sqlx::query(&format!("INSERT INTO FOO VALUES ({id}, 'n{id}')"))
                .execute(pool)
                .await
                .unwrap();
        }
    }

    fn out(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self, out: &str, partitions: usize) -> Config {
        let yaml = format!(
            r#"
job:
  name: foo-export
source:
  url: "{url}"
  table: FOO
  columns: "id, name"
  partition_column: id
  partitions: {partitions}
sink:
  fs_uri: "file:///"
  directory: "{dir}"
  file_name: ""
  file_extension: csv
workers:
  max_workers: 2
"#,
            url = self.db_url,
            dir = self.out(out).display(),
        );
        Config::from_yaml(&yaml).unwrap()
    }

    fn read(&self, out: &str, file: &str) -> String {
        std::fs::read_to_string(self.out(out).join(file)).unwrap()
    }

    fn files(&self, out: &str) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.out(out))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Fails one partition and delegates the rest.
struct FailingLauncher {
    inner: InProcessLauncher,
    fail: usize,
}

#[async_trait]
impl WorkerLauncher for FailingLauncher {
    async fn launch(&self, assignment: WorkerAssignment) -> WorkerResult {
        let index = assignment.partition.index;
        if index == self.fail {
            WorkerResult::failure(index, "injected failure")
        } else {
            self.inner.launch(assignment).await
        }
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

async fn job_with(config: Config, fail: Option<usize>) -> (Job, Arc<SqlCheckpointStore>) {
    let config = Arc::new(config);
    let ctx = Arc::new(WorkerContext::connect(Arc::clone(&config)).await.unwrap());
    let inner = InProcessLauncher::new(Arc::clone(&ctx));
    let launcher: Arc<dyn WorkerLauncher> = match fail {
        Some(fail) => Arc::new(FailingLauncher { inner, fail }),
        None => Arc::new(inner),
    };
    let store = Arc::new(
        SqlCheckpointStore::new(ctx.pool.clone(), "sluice_checkpoint", Dialect::Sqlite)
            .await
            .unwrap(),
    );
    let job = Job::new(config, ctx.pool.clone(), launcher, store.clone()).unwrap();
    (job, store)
}

#[tokio::test]
async fn test_three_partitions_two_rows_each() {
    let fx = Fixture::new(6).await;
    let job = build_job(fx.config("out", 3), Path::new("unused.yaml"))
        .await
        .unwrap();

    let stats = job.run().await.unwrap();
    assert_eq!(stats.partitions, 3);
    assert_eq!(stats.rows_written, 6);

    assert_eq!(fx.files("out"), vec!["p0-0.csv", "p1-0.csv", "p2-0.csv"]);
    assert_eq!(fx.read("out", "p0-0.csv"), "1,n1\n2,n2\n");
    assert_eq!(fx.read("out", "p1-0.csv"), "3,n3\n4,n4\n");
    assert_eq!(fx.read("out", "p2-0.csv"), "5,n5\n6,n6\n");
}

#[tokio::test]
async fn test_rollover_splits_partition_output() {
    let fx = Fixture::new(6).await;
    let mut config = fx.config("out", 1);
    config.source.partition_column = None;
    config.source.commit_interval = 1;
    // Each line is 5 bytes; two lines reach the threshold.
    config.sink.rollover_bytes = 10;

    let (job, _) = job_with(config, None).await;
    job.run().await.unwrap();

    assert_eq!(fx.files("out"), vec!["p0-0.csv", "p0-1.csv", "p0-2.csv"]);
    assert_eq!(fx.read("out", "p0-0.csv"), "1,n1\n2,n2\n");
    assert_eq!(fx.read("out", "p0-1.csv"), "3,n3\n4,n4\n");
    assert_eq!(fx.read("out", "p0-2.csv"), "5,n5\n6,n6\n");
}

#[tokio::test]
async fn test_single_partition_covers_table() {
    let fx = Fixture::new(6).await;
    let (job, _) = job_with(fx.config("out", 1), None).await;

    let stats = job.run().await.unwrap();
    assert_eq!(stats.partitions, 1);
    assert_eq!(fx.files("out"), vec!["p0-0.csv"]);
    assert_eq!(fx.read("out", "p0-0.csv").lines().count(), 6);
}

#[tokio::test]
async fn test_failed_partition_keeps_checkpoint() {
    let fx = Fixture::new(8).await;
    let mut config = fx.config("out", 4);
    config.source.check_column = Some("id".to_string());

    let (job, store) = job_with(config, Some(2)).await;
    let err = job.run().await.unwrap_err();
    assert_eq!(err.failed_partitions(), &[2]);

    let checkpoint = store.read("foo-export").await.unwrap().unwrap();
    assert_eq!(checkpoint.watermark, None);
    assert!(checkpoint.last_run_failed());

    // The other partitions still completed, inside the run's directory.
    let runs = fx.files("out");
    assert_eq!(runs.len(), 1);
    assert!(runs[0].starts_with("start-8_"));
    let run = format!("out/{}", runs[0]);
    assert_eq!(fx.files(&run), vec!["p0-0.csv", "p1-0.csv", "p3-0.csv"]);
}

#[tokio::test]
async fn test_failed_run_blocks_non_restartable_job() {
    let fx = Fixture::new(4).await;
    let (job, _) = job_with(fx.config("first", 2), Some(0)).await;
    job.run().await.unwrap_err();

    let (job, _) = job_with(fx.config("second", 2), None).await;
    let err = job.run().await.unwrap_err();
    assert!(matches!(err, JobError::RestartPrevented { .. }));
    assert!(!fx.out("second").join("p0-0.csv").exists());

    let mut config = fx.config("third", 2);
    config.job.restartable = true;
    let (job, _) = job_with(config, None).await;
    job.run().await.unwrap();
    assert_eq!(fx.files("third"), vec!["p0-0.csv", "p1-0.csv"]);
}

fn incremental(fx: &Fixture) -> Config {
    let mut config = fx.config("out", 2);
    config.source.check_column = Some("id".to_string());
    config
}

#[tokio::test]
async fn test_incremental_runs_share_directory() {
    let fx = Fixture::new(4).await;

    let (job, store) = job_with(incremental(&fx), None).await;
    let first = job.run().await.unwrap();
    assert_eq!(first.rows_written, 4);
    assert_eq!(store.read_watermark("foo-export").await.unwrap(), Some(4));
    let first_dir = format!("out/{}", first.run_directory.unwrap());
    assert!(first_dir.starts_with("out/start-4_"));

    let pool = fx.pool().await;
    fx.insert(&pool, 5..=7).await;
    pool.close().await;

    // Same directory and the default collision policy.
    let (job, store) = job_with(incremental(&fx), None).await;
    let second = job.run().await.unwrap();
    assert_eq!(second.rows_written, 3);
    assert_eq!(second.watermark, Some(7));
    assert_eq!(store.read_watermark("foo-export").await.unwrap(), Some(7));
    let second_dir = format!("out/{}", second.run_directory.unwrap());
    assert!(second_dir.starts_with("out/4-7_"));

    // The first increment is still there, untouched.
    assert_eq!(fx.files(&first_dir), vec!["p0-0.csv", "p1-0.csv"]);
    let first_rows: String = fx
        .files(&first_dir)
        .iter()
        .map(|f| fx.read(&first_dir, f))
        .collect();
    assert_eq!(first_rows, "1,n1\n2,n2\n3,n3\n4,n4\n");

    let second_rows: String = fx
        .files(&second_dir)
        .iter()
        .map(|f| fx.read(&second_dir, f))
        .collect();
    assert_eq!(second_rows, "5,n5\n6,n6\n7,n7\n");
    assert_eq!(fx.files("out").len(), 2);

    // Nothing new: no partitions, no new directory, watermark unchanged.
    let (job, store) = job_with(incremental(&fx), None).await;
    let stats = job.run().await.unwrap();
    assert_eq!(stats.partitions, 0);
    assert_eq!(stats.run_directory, None);
    assert_eq!(fx.files("out").len(), 2);
    assert_eq!(store.read_watermark("foo-export").await.unwrap(), Some(7));
}

#[tokio::test]
async fn test_incremental_retry_after_failure_same_directory() {
    let fx = Fixture::new(4).await;
    let mut config = incremental(&fx);
    config.job.restartable = true;

    let (job, store) = job_with(config.clone(), Some(1)).await;
    job.run().await.unwrap_err();
    assert_eq!(store.read_watermark("foo-export").await.unwrap(), None);

    let (job, store) = job_with(config, None).await;
    let stats = job.run().await.unwrap();
    assert_eq!(stats.rows_written, 4);
    assert_eq!(store.read_watermark("foo-export").await.unwrap(), Some(4));

    let retry_dir = format!("out/{}", stats.run_directory.unwrap());
    assert_eq!(fx.files(&retry_dir), vec!["p0-0.csv", "p1-0.csv"]);
    assert_eq!(fx.files("out").len(), 2);
}

#[tokio::test]
async fn test_incremental_overwrite_rejected() {
    let fx = Fixture::new(2).await;
    let mut config = incremental(&fx);
    config.sink.on_collision = CollisionPolicy::Overwrite;

    let err = build_job(config, Path::new("unused.yaml")).await.err().unwrap();
    assert!(matches!(
        err,
        JobError::Config {
            source: ConfigError::OverwriteIncremental
        }
    ));
}

#[tokio::test]
async fn test_existing_output_fails_or_is_overwritten() {
    let fx = Fixture::new(4).await;
    let (job, _) = job_with(fx.config("out", 2), None).await;
    job.run().await.unwrap();

    std::fs::write(fx.out("out").join("p0-0.csv"), "stale\n").unwrap();

    let (job, _) = job_with(fx.config("out", 2), None).await;
    let err = job.run().await.unwrap_err();
    assert_eq!(err.failed_partitions(), &[0, 1]);
    assert_eq!(fx.read("out", "p0-0.csv"), "stale\n");

    let mut config = fx.config("out", 2);
    config.job.restartable = true;
    config.sink.on_collision = CollisionPolicy::Overwrite;
    let (job, _) = job_with(config, None).await;
    job.run().await.unwrap();
    assert_eq!(fx.read("out", "p0-0.csv"), "1,n1\n2,n2\n");
}

#[tokio::test]
async fn test_sql_template_source() {
    let fx = Fixture::new(6).await;
    let mut config = fx.config("out", 2);
    config.source.columns = None;
    config.source.sql =
        Some("SELECT name FROM FOO {partition_clause} ORDER BY id".to_string());
    config.source.delimiter = "|".to_string();

    let (job, _) = job_with(config, None).await;
    job.run().await.unwrap();

    assert_eq!(fx.read("out", "p0-0.csv"), "n1\nn2\nn3\n");
    assert_eq!(fx.read("out", "p1-0.csv"), "n4\nn5\nn6\n");
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_launcher_runs_worker_binary() {
    let fx = Fixture::new(6).await;
    let mut config = fx.config("out", 3);
    config.workers.launcher = LauncherKind::Process;
    config.workers.program = Some(PathBuf::from(env!("CARGO_BIN_EXE_sluice")));

    let config_path = fx.dir.path().join("job.yaml");
    std::fs::write(&config_path, serde_yaml::to_string(&config).unwrap()).unwrap();

    let job = build_job(config, &config_path).await.unwrap();
    let stats = job.run().await.unwrap();
    assert_eq!(stats.rows_written, 6);
    assert_eq!(fx.files("out"), vec!["p0-0.csv", "p1-0.csv", "p2-0.csv"]);
    assert_eq!(fx.read("out", "p2-0.csv"), "5,n5\n6,n6\n");
}
