//! Fan-out of partitions to workers.
//!
//! Every partition is launched as its own tokio task. At most
//! `max_workers` run at once; the rest wait in partition order and start as
//! running workers complete. A failed worker never cancels the others.

pub mod launcher;

pub use launcher::{InProcessLauncher, ProcessLauncher, WorkerLauncher};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::emit;
use crate::error::WorkerError;
use crate::metrics::events::{ActiveWorkers, WorkerCompleted, WorkerStatus};
use crate::partition::PartitionSpec;

/// Work handed to one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAssignment {
    pub partition: PartitionSpec,
    pub file_suffix: String,
    /// Subdirectory of the sink directory this run writes into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_directory: Option<String>,
}

impl WorkerAssignment {
    pub fn new(partition: PartitionSpec) -> Self {
        let file_suffix = partition.file_suffix();
        Self {
            partition,
            file_suffix,
            run_directory: None,
        }
    }

    pub fn with_run_directory(mut self, run_directory: Option<String>) -> Self {
        self.run_directory = run_directory;
        self
    }
}

/// Terminal status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitStatus {
    Success,
    Failure,
}

/// What a worker reported back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub partition_index: usize,
    pub exit_status: ExitStatus,
    pub rows_written: u64,
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn success(partition_index: usize, rows_written: u64) -> Self {
        Self {
            partition_index,
            exit_status: ExitStatus::Success,
            rows_written,
            error: None,
        }
    }

    pub fn failure(partition_index: usize, error: impl Into<String>) -> Self {
        Self {
            partition_index,
            exit_status: ExitStatus::Failure,
            rows_written: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == ExitStatus::Success
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Succeeded | WorkerState::Failed)
    }

    /// Move to `next`; terminal states are final.
    pub fn transition(self, next: WorkerState) -> Result<WorkerState, WorkerError> {
        use WorkerState::*;
        match (self, next) {
            (Queued, Running) | (Running, Succeeded) | (Running, Failed) => Ok(next),
            (from, to) => Err(WorkerError::IllegalTransition { from, to }),
        }
    }
}

/// Results of a dispatch, ordered by partition index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub results: Vec<WorkerResult>,
}

impl DispatchOutcome {
    pub fn failed_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.partition_index)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(WorkerResult::is_success)
    }

    pub fn rows_written(&self) -> u64 {
        self.results.iter().map(|r| r.rows_written).sum()
    }
}

type WorkerFuture = Pin<Box<dyn Future<Output = (usize, Result<WorkerResult, JoinError>, Duration)> + Send>>;

/// Runs workers with bounded concurrency.
pub struct WorkerDispatcher {
    launcher: Arc<dyn WorkerLauncher>,
    max_workers: usize,
}

impl WorkerDispatcher {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, max_workers: usize) -> Self {
        Self {
            launcher,
            max_workers: max_workers.max(1),
        }
    }

    /// Run every partition and wait for all of them. Output goes under
    /// `run_directory` when one is given.
    pub async fn dispatch(
        &self,
        partitions: Vec<PartitionSpec>,
        run_directory: Option<&str>,
    ) -> DispatchOutcome {
        let total = partitions.len();
        let mut states: BTreeMap<usize, WorkerState> = partitions
            .iter()
            .map(|p| (p.index, WorkerState::Queued))
            .collect();
        let run_directory = run_directory.map(str::to_string);
        let mut queue = partitions
            .into_iter()
            .map(|p| WorkerAssignment::new(p).with_run_directory(run_directory.clone()));
        let mut running: FuturesUnordered<WorkerFuture> = FuturesUnordered::new();
        let mut results = Vec::with_capacity(total);

        info!(
            partitions = total,
            run_directory = run_directory.as_deref().unwrap_or("-"),
            max_workers = self.max_workers,
            launcher = self.launcher.name(),
            "Dispatching workers"
        );

        for assignment in queue.by_ref().take(self.max_workers) {
            self.start(assignment, &mut states, &mut running);
        }

        while let Some((index, joined, elapsed)) = running.next().await {
            emit!(ActiveWorkers {
                count: running.len()
            });

            let result = match joined {
                Ok(result) => result,
                Err(e) => WorkerResult::failure(index, format!("worker task aborted: {e}")),
            };

            let (next, status) = if result.is_success() {
                (WorkerState::Succeeded, WorkerStatus::Success)
            } else {
                (WorkerState::Failed, WorkerStatus::Failure)
            };
            advance(&mut states, index, next);
            emit!(WorkerCompleted {
                status,
                duration: elapsed,
            });

            match &result.error {
                None => info!(
                    partition = index,
                    rows = result.rows_written,
                    elapsed_ms = elapsed.as_millis(),
                    "Worker succeeded"
                ),
                Some(reason) => error!(partition = index, error = %reason, "Worker failed"),
            }
            results.push(result);

            if let Some(assignment) = queue.next() {
                self.start(assignment, &mut states, &mut running);
            }
        }

        emit!(ActiveWorkers { count: 0 });
        results.sort_by_key(|r| r.partition_index);
        debug!(
            finished = results.len(),
            terminal = states.values().filter(|s| s.is_terminal()).count(),
            "All workers finished"
        );
        DispatchOutcome { results }
    }

    fn start(
        &self,
        assignment: WorkerAssignment,
        states: &mut BTreeMap<usize, WorkerState>,
        running: &mut FuturesUnordered<WorkerFuture>,
    ) {
        let index = assignment.partition.index;
        advance(states, index, WorkerState::Running);
        debug!(partition = index, suffix = %assignment.file_suffix, "Starting worker");

        let launcher = Arc::clone(&self.launcher);
        let handle = tokio::spawn(async move { launcher.launch(assignment).await });
        running.push(Box::pin(async move {
            let start = Instant::now();
            let joined = handle.await;
            (index, joined, start.elapsed())
        }));
        emit!(ActiveWorkers {
            count: running.len()
        });
    }
}

fn advance(states: &mut BTreeMap<usize, WorkerState>, index: usize, next: WorkerState) {
    if let Some(state) = states.get_mut(&index) {
        match state.transition(next) {
            Ok(s) => *state = s,
            Err(e) => error!(partition = index, error = %e, "Ignoring worker state change"),
        }
    }
}
