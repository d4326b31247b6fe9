//! Ways of running a worker.

use async_trait::async_trait;
use snafu::prelude::*;
use snafu::Report;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

use crate::error::{
    MessageSnafu, MissingReportSnafu, ProcessExitSnafu, ReportMismatchSnafu, SpawnSnafu,
    WorkerError,
};
use crate::worker::{WorkerContext, WorkerReport, run_partition};

use super::{WorkerAssignment, WorkerResult};

/// Starts a worker for one assignment and waits for it to finish.
///
/// Implementations report failures through the returned `WorkerResult`
/// instead of erroring, so one bad partition never stops the dispatcher.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, assignment: WorkerAssignment) -> WorkerResult;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Runs partitions as tasks inside the coordinator.
pub struct InProcessLauncher {
    ctx: Arc<WorkerContext>,
}

impl InProcessLauncher {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, assignment: WorkerAssignment) -> WorkerResult {
        let index = assignment.partition.index;
        match run_partition(&self.ctx, &assignment).await {
            Ok(report) => WorkerResult::success(index, report.rows_written),
            Err(e) => WorkerResult::failure(index, Report::from_error(e).to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "in_process"
    }
}

/// Runs each partition in a child process of `program`.
///
/// The child is invoked as `program worker --config <path> --partition
/// <json> [--run-dir <dir>]` and must print a JSON `WorkerReport` for the
/// same partition as its last stdout line; a clean exit without one counts
/// as a failure. Its stderr is inherited so worker logs show up alongside
/// the coordinator's.
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: config_path.into(),
        }
    }

    /// Launcher re-invoking the running executable.
    pub fn current_exe(config_path: impl Into<PathBuf>) -> Result<Self, WorkerError> {
        let program = std::env::current_exe().context(SpawnSnafu {
            program: "current executable",
        })?;
        Ok(Self::new(program, config_path))
    }

    async fn run(&self, assignment: &WorkerAssignment) -> Result<u64, WorkerError> {
        let partition = serde_json::to_string(&assignment.partition).context(MessageSnafu)?;
        let program = self.program.display().to_string();
        debug!(
            partition = assignment.partition.index,
            program = %program,
            "Spawning worker process"
        );

        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--partition")
            .arg(partition);
        if let Some(dir) = &assignment.run_directory {
            command.arg("--run-dir").arg(dir);
        }

        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await
            .context(SpawnSnafu { program })?;

        ensure!(
            output.status.success(),
            ProcessExitSnafu {
                status: output.status.to_string()
            }
        );

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .context(MissingReportSnafu)?;
        let report: WorkerReport = serde_json::from_str(line).context(MessageSnafu)?;

        let expected = assignment.partition.index;
        ensure!(
            report.partition_index == expected,
            ReportMismatchSnafu {
                expected,
                actual: report.partition_index
            }
        );
        Ok(report.rows_written)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, assignment: WorkerAssignment) -> WorkerResult {
        let index = assignment.partition.index;
        match self.run(&assignment).await {
            Ok(rows) => WorkerResult::success(index, rows),
            Err(e) => WorkerResult::failure(index, Report::from_error(e).to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::partition::split_range;

    fn assignment() -> WorkerAssignment {
        WorkerAssignment::new(split_range("id", 1, 6, 3).remove(1))
    }

    fn report_line(partition_index: usize, rows_written: u64) -> String {
        serde_json::to_string(&WorkerReport {
            partition_index,
            rows_written,
            files: vec![format!("p{partition_index}-0.csv")],
        })
        .unwrap()
    }

    /// Executable shell script with `body`.
    fn script(body: &str) -> tempfile::TempPath {
        let script = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(script.path(), format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = std::fs::metadata(script.path()).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(script.path(), perms).unwrap();
        script.into_temp_path()
    }

    #[tokio::test]
    async fn test_clean_exit_without_report_fails() {
        let launcher = ProcessLauncher::new("true", "unused.yaml");
        let result = launcher.launch(assignment()).await;
        assert!(!result.is_success());
        assert_eq!(result.partition_index, 1);
        assert_eq!(result.rows_written, 0);
        assert!(result.error.unwrap().contains("without a report"));
    }

    #[tokio::test]
    async fn test_report_for_other_partition_fails() {
        let path = script(&format!("echo '{}'\n", report_line(2, 7)));
        let launcher = ProcessLauncher::new(path.to_path_buf(), "unused.yaml");

        let result = launcher.launch(assignment()).await;
        assert!(!result.is_success());
        assert!(result
            .error
            .unwrap()
            .contains("Worker reported partition 2, expected 1"));
    }

    #[tokio::test]
    async fn test_run_directory_passed_to_worker() {
        let path = script(&format!(
            "[ \"$6\" = --run-dir ] && [ \"$7\" = 3-9_run ] || exit 3\necho '{}'\n",
            report_line(1, 4)
        ));
        let launcher = ProcessLauncher::new(path.to_path_buf(), "unused.yaml");

        let result = launcher
            .launch(assignment().with_run_directory(Some("3-9_run".into())))
            .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.rows_written, 4);
    }

    #[tokio::test]
    async fn test_failing_process() {
        let launcher = ProcessLauncher::new("false", "unused.yaml");
        let result = launcher.launch(assignment()).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("exited"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let launcher = ProcessLauncher::new("/nonexistent/sluice-worker", "unused.yaml");
        let result = launcher.launch(assignment()).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("spawn"));
    }

    #[tokio::test]
    async fn test_report_parsed_from_last_line() {
        let path = script(&format!("echo noise\necho '{}'\n", report_line(1, 7)));

        let launcher = ProcessLauncher::new(path.to_path_buf(), "unused.yaml");
        let result = launcher.launch(assignment()).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.rows_written, 7);
    }
}
