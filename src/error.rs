//! Error types for Sluice using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase.

use snafu::prelude::*;

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Job name is empty.
    #[snafu(display("Job name cannot be empty"))]
    EmptyJobName,

    /// Source database URL is empty.
    #[snafu(display("Source database url cannot be empty"))]
    EmptySourceUrl,

    /// Neither table/columns nor sql were configured.
    #[snafu(display("Either table and columns or sql must be configured"))]
    MissingRowSource,

    /// Both columns and sql were configured.
    #[snafu(display("columns and sql are mutually exclusive"))]
    ConflictingRowSource,

    /// Columns were configured without a table.
    #[snafu(display("A table name is required when columns are configured"))]
    MissingTable,

    /// A table was configured without columns or sql.
    #[snafu(display("Column names are required for table {table}"))]
    MissingColumns { table: String },

    /// Partitioning or incremental mode needs a table to read column bounds from.
    #[snafu(display("A table name is required to compute partitions or check column bounds"))]
    MissingBoundsTable,

    /// Partition column is required for more than one partition.
    #[snafu(display("partition_column is required when partitions is {partitions}"))]
    MissingPartitionColumn { partitions: usize },

    /// A numeric setting must be positive.
    #[snafu(display("{name} must be greater than zero"))]
    NotPositive { name: &'static str },

    /// Delimiter is empty.
    #[snafu(display("Delimiter cannot be empty"))]
    EmptyDelimiter,

    /// Kerberos security requires principal and keytab.
    #[snafu(display("Kerberos security requires {field}"))]
    MissingKerberosSetting { field: &'static str },

    /// Overwriting is unsafe for incremental jobs, whose runs only see new rows.
    #[snafu(display("on_collision: overwrite cannot be combined with check_column"))]
    OverwriteIncremental,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Query Errors ============

/// Errors that can occur while talking to the source database.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueryError {
    /// Failed to connect to the database.
    #[snafu(display("Failed to connect to {url}"))]
    Connect { url: String, source: sqlx::Error },

    /// The min/max bounds query failed.
    #[snafu(display("Partition bounds query failed: {sql}"))]
    Bounds { sql: String, source: sqlx::Error },

    /// Fetching rows failed.
    #[snafu(display("Row query failed: {sql}"))]
    Rows { sql: String, source: sqlx::Error },

    /// A column value could not be rendered as text.
    #[snafu(display("Cannot render column {column} as text"))]
    Decode { column: String },

    /// The query returned a column type the generic driver cannot decode.
    #[snafu(display(
        "Row query returned an unsupported column type: {message}. \
         Cast such columns to text in the query, e.g. CAST(col AS CHAR) or col::text: {sql}"
    ))]
    UnsupportedType { sql: String, message: String },
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// The URL scheme is recognised but has no backend.
    #[snafu(display("Unsupported filesystem scheme: {scheme}"))]
    UnsupportedScheme { scheme: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error on {path}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error"))]
    GcsConfig { source: object_store::Error },

    /// Azure configuration error.
    #[snafu(display("Azure configuration error"))]
    AzureConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            StorageError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

// ============ Writer Errors ============

/// Errors that can occur in the rolling text writer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WriterError {
    /// Underlying filesystem failure.
    #[snafu(display("Write to {file} failed"))]
    WriterStorage { file: String, source: StorageError },

    /// The writer was used after close.
    #[snafu(display("Writer is closed"))]
    Closed,

    /// The target file already exists and the collision policy is `fail`.
    #[snafu(display("Output file {file} already exists"))]
    FileExists { file: String },

    /// An earlier attempt to finalize `file` failed; it was left under its
    /// in-progress name.
    #[snafu(display("Output file {file} was not finalized"))]
    Unfinalized { file: String },
}

// ============ Checkpoint Errors ============

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Checkpoint store query failed.
    #[snafu(display("Checkpoint store query failed for job {job}"))]
    Store { job: String, source: sqlx::Error },

    /// Checkpoint table could not be created.
    #[snafu(display("Failed to create checkpoint table {table}"))]
    CreateTable { table: String, source: sqlx::Error },

    /// Persisted status is not recognised.
    #[snafu(display("Unknown run status '{status}' for job {job}"))]
    UnknownStatus { job: String, status: String },

    /// Persisted timestamp is not RFC 3339.
    #[snafu(display("Invalid checkpoint timestamp '{value}' for job {job}"))]
    InvalidTimestamp {
        job: String,
        value: String,
        source: chrono::ParseError,
    },
}

// ============ Worker Errors ============

/// Errors that can occur inside a single partition worker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WorkerError {
    /// Reading rows failed.
    #[snafu(display("Partition {partition} read failed"))]
    WorkerQuery { partition: usize, source: QueryError },

    /// Writing output failed.
    #[snafu(display("Partition {partition} write failed"))]
    WorkerWrite {
        partition: usize,
        source: WriterError,
    },

    /// A worker process could not be spawned.
    #[snafu(display("Failed to spawn worker process {program}"))]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// A worker process exited unsuccessfully.
    #[snafu(display("Worker process exited with {status}"))]
    ProcessExit { status: String },

    /// A worker process exited cleanly without printing a report.
    #[snafu(display("Worker process exited without a report"))]
    MissingReport,

    /// A worker process reported on a different partition than it was given.
    #[snafu(display("Worker reported partition {actual}, expected {expected}"))]
    ReportMismatch { expected: usize, actual: usize },

    /// A worker state change that the lifecycle does not allow.
    #[snafu(display("Illegal worker transition {from:?} -> {to:?}"))]
    IllegalTransition {
        from: crate::dispatch::WorkerState,
        to: crate::dispatch::WorkerState,
    },

    /// Serializing or parsing a worker message failed.
    #[snafu(display("Invalid worker message"))]
    Message { source: serde_json::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Failed to bind the metrics listener.
    #[snafu(display("Failed to bind metrics endpoint to {addr}"))]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
}

// ============ Job Error (top-level) ============

/// Top-level job errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum JobError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Database error.
    #[snafu(display("Query error"))]
    Query { source: QueryError },

    /// Storage error.
    #[snafu(display("Storage error"))]
    JobStorage { source: StorageError },

    /// Checkpoint error.
    #[snafu(display("Checkpoint error"))]
    Checkpoint { source: CheckpointError },

    /// Worker error (worker role only).
    #[snafu(display("Worker error"))]
    Worker { source: WorkerError },

    /// One or more partitions failed.
    #[snafu(display("Partitions {failed:?} failed"))]
    PartialFailure { failed: Vec<usize> },

    /// The last run failed and the job is not restartable.
    #[snafu(display("Job {job} failed previously and is not restartable"))]
    RestartPrevented { job: String },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },
}

impl JobError {
    /// Failed partition indices, if this is a partial failure.
    pub fn failed_partitions(&self) -> &[usize] {
        match self {
            JobError::PartialFailure { failed } => failed,
            _ => &[],
        }
    }
}
