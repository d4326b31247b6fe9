//! Read-write pipeline for a single partition.
//!
//! Reader and writer run in lockstep: read up to `commit_interval` rows,
//! write them, flush, repeat.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use sqlx::AnyPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, SecurityConfig};
use crate::db;
use crate::dispatch::WorkerAssignment;
use crate::error::{
    ConfigSnafu, JobError, JobStorageSnafu, MissingRowSourceSnafu, QuerySnafu, WorkerError,
    WorkerQuerySnafu, WorkerWriteSnafu,
};
use crate::sink::{RollingTextWriter, WriterSettings};
use crate::source::{ColumnReader, RowSource};
use crate::storage::{StorageProvider, StorageProviderRef};

/// Shared, read-only resources for workers.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub pool: AnyPool,
    pub storage: StorageProviderRef,
    pub row_source: RowSource,
}

impl WorkerContext {
    /// Connect to the source database and the output filesystem.
    pub async fn connect(config: Arc<Config>) -> Result<Self, JobError> {
        let row_source = RowSource::from_config(&config.source)
            .context(MissingRowSourceSnafu)
            .context(ConfigSnafu)?;

        let pool = db::connect(&config.source.url, config.workers.max_workers as u32 + 1)
            .await
            .context(QuerySnafu)?;

        let location = config.sink.location();
        if let SecurityConfig::Kerberos { user_principal, .. } = &config.sink.security {
            warn!(
                principal = user_principal.as_deref().unwrap_or_default(),
                location = %location,
                "Kerberos settings have no effect on this filesystem; use storage_options for credentials"
            );
        }
        let storage = StorageProvider::for_url_with_options(
            &location,
            config.sink.storage_options.clone(),
        )
        .await
        .context(JobStorageSnafu)?;
        debug!(location = storage.canonical_url(), "Output location ready");

        Ok(Self {
            config,
            pool,
            storage: Arc::new(storage),
            row_source,
        })
    }
}

/// Summary printed by a worker process and returned by in-process workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub partition_index: usize,
    pub rows_written: u64,
    pub files: Vec<String>,
}

/// Copy one partition's rows into its file group.
///
/// On error the writer is dropped without finalizing, so the current file
/// keeps its in-progress name.
pub async fn run_partition(
    ctx: &WorkerContext,
    assignment: &WorkerAssignment,
) -> Result<WorkerReport, WorkerError> {
    let start = Instant::now();
    let index = assignment.partition.index;
    let sql = ctx.row_source.query(&assignment.partition);
    info!(partition = index, sql = %sql, "Starting partition");

    let mut reader = ColumnReader::open(
        &ctx.pool,
        &sql,
        &ctx.config.source.delimiter,
        ctx.config.source.commit_interval,
    );
    let mut writer = RollingTextWriter::new(
        Arc::clone(&ctx.storage),
        WriterSettings::from_sink(&ctx.config.sink, assignment.file_suffix.clone())
            .with_directory(assignment.run_directory.clone()),
    );

    loop {
        let batch = reader
            .read_batch()
            .await
            .context(WorkerQuerySnafu { partition: index })?;
        if batch.is_empty() {
            break;
        }
        writer
            .write(&batch)
            .await
            .context(WorkerWriteSnafu { partition: index })?;
        writer
            .flush()
            .await
            .context(WorkerWriteSnafu { partition: index })?;
        debug!(
            partition = index,
            rows = writer.rows_written(),
            "Committed chunk"
        );
    }

    reader.close();
    writer
        .close()
        .await
        .context(WorkerWriteSnafu { partition: index })?;

    let report = WorkerReport {
        partition_index: index,
        rows_written: writer.rows_written(),
        files: writer
            .finished_files()
            .iter()
            .map(|f| f.filename.clone())
            .collect(),
    };
    info!(
        partition = index,
        rows = report.rows_written,
        files = report.files.len(),
        elapsed_ms = start.elapsed().as_millis(),
        "Partition complete"
    );
    Ok(report)
}
