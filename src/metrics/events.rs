//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a copy job.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when rows are read from the source database.
pub struct RowsRead {
    pub count: u64,
}

impl InternalEvent for RowsRead {
    fn emit(self) {
        trace!(count = self.count, "Rows read");
        counter!("sluice_rows_read_total").increment(self.count);
    }
}

/// Event emitted when bytes are appended to an output file.
pub struct BytesWritten {
    pub bytes: u64,
}

impl InternalEvent for BytesWritten {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes written");
        counter!("sluice_bytes_written_total").increment(self.bytes);
    }
}

/// Event emitted when an output file is renamed to its permanent name.
pub struct FileFinalized {
    pub bytes: u64,
}

impl InternalEvent for FileFinalized {
    fn emit(self) {
        trace!(bytes = self.bytes, "File finalized");
        counter!("sluice_files_finalized_total").increment(1);
        histogram!("sluice_file_size_bytes").record(self.bytes as f64);
    }
}

/// Event emitted once partitions have been computed.
pub struct PartitionsComputed {
    pub count: usize,
}

impl InternalEvent for PartitionsComputed {
    fn emit(self) {
        trace!(count = self.count, "Partitions computed");
        gauge!("sluice_partitions").set(self.count as f64);
    }
}

// ============================================================================
// Worker events
// ============================================================================

/// Event emitted when the number of running workers changes.
pub struct ActiveWorkers {
    pub count: usize,
}

impl InternalEvent for ActiveWorkers {
    fn emit(self) {
        trace!(count = self.count, "Active workers");
        gauge!("sluice_active_workers").set(self.count as f64);
    }
}

/// Outcome of a worker.
#[derive(Debug, Clone, Copy)]
pub enum WorkerStatus {
    Success,
    Failure,
}

impl WorkerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Success => "success",
            WorkerStatus::Failure => "failure",
        }
    }
}

/// Event emitted when a worker reaches a terminal state.
pub struct WorkerCompleted {
    pub status: WorkerStatus,
    pub duration: Duration,
}

impl InternalEvent for WorkerCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Worker completed"
        );
        counter!("sluice_workers_completed_total", "status" => self.status.as_str()).increment(1);
        histogram!("sluice_worker_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Create,
    Flush,
    Finish,
    Rename,
    Exists,
    Delete,
    Get,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Create => "create",
            StorageOperation::Flush => "flush",
            StorageOperation::Finish => "finish",
            StorageOperation::Rename => "rename",
            StorageOperation::Exists => "exists",
            StorageOperation::Delete => "delete",
            StorageOperation::Get => "get",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "sluice_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "sluice_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Checkpoint events
// ============================================================================

/// Event emitted when the watermark advances.
pub struct WatermarkAdvanced {
    pub watermark: i64,
}

impl InternalEvent for WatermarkAdvanced {
    fn emit(self) {
        trace!(watermark = self.watermark, "Watermark advanced");
        gauge!("sluice_watermark").set(self.watermark as f64);
    }
}

/// Event emitted when a job run finishes.
pub struct JobFinished {
    pub success: bool,
    pub duration: Duration,
}

impl InternalEvent for JobFinished {
    fn emit(self) {
        let status = if self.success { "completed" } else { "failed" };
        trace!(status, duration_ms = self.duration.as_millis(), "Job finished");
        counter!("sluice_job_runs_total", "status" => status).increment(1);
        histogram!("sluice_job_duration_seconds").record(self.duration.as_secs_f64());
    }
}
