//! sluice: copy a database table into rolling text files.
//!
//! The same binary runs as the coordinator (`sluice run`) or as a worker
//! for a single partition (`sluice worker`), which is how the process
//! launcher starts partitions.

use clap::{Parser, Subcommand};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sluice::config::Config;
use sluice::db::redact;
use sluice::dispatch::WorkerAssignment;
use sluice::error::{AddressParseSnafu, ConfigSnafu, JobError, MessageSnafu, MetricsSnafu, WorkerSnafu};
use sluice::partition::PartitionSpec;
use sluice::worker::{WorkerContext, run_partition};
use sluice::{metrics, run_job};

/// Partitioned database to filesystem copy tool.
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    role: Role,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

/// Which side of the job this process plays.
#[derive(Subcommand, Debug)]
enum Role {
    /// Compute partitions, dispatch workers and advance the checkpoint.
    #[command(name = "run")]
    Coordinator {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Dry run - validate configuration without copying.
        #[arg(long)]
        dry_run: bool,
    },

    /// Copy a single partition and print a JSON report on stdout.
    Worker {
        /// Path to the configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Partition to copy, as JSON.
        #[arg(long)]
        partition: String,

        /// Subdirectory of the sink directory to write into.
        #[arg(long)]
        run_dir: Option<String>,
    },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), JobError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    // Worker stdout carries the report, so all logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match args.role {
        Role::Coordinator { config, dry_run } => coordinate(&config, dry_run).await,
        Role::Worker {
            config,
            partition,
            run_dir,
        } => work(&config, &partition, run_dir).await,
    }
}

async fn coordinate(path: &Path, dry_run: bool) -> Result<(), JobError> {
    info!("sluice starting");
    let config = Config::from_file(path).context(ConfigSnafu)?;

    if dry_run {
        info!("Dry run mode - validating configuration");
        info!("Job: {}", config.job.name);
        info!("Source: {}", redact(&config.source.url));
        match (&config.source.table, &config.source.sql) {
            (_, Some(sql)) => info!("Query: {}", sql),
            (Some(table), None) => info!(
                "Table: {} ({})",
                table,
                config.source.columns.as_deref().unwrap_or_default()
            ),
            (None, None) => {}
        }
        info!(
            "Partitions: {} on {}",
            config.source.partitions,
            config.source.partition_column.as_deref().unwrap_or("-")
        );
        if let Some(check) = &config.source.check_column {
            info!("Incremental on: {}", check);
        }
        info!("Sink: {}", config.sink.location());
        info!("Workers: {} ({:?})", config.workers.max_workers, config.workers.launcher);
        info!("Checkpoint: {}", config.checkpoint.table);
        info!("Configuration is valid");
        return Ok(());
    }

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        let bound = metrics::init(addr).await.context(MetricsSnafu)?;
        debug!("Metrics endpoint listening on http://{}/metrics", bound);
    }

    let stats = run_job(config, path).await?;

    info!("Job completed successfully");
    info!("  Partitions: {}", stats.partitions);
    info!("  Rows written: {}", stats.rows_written);
    if let Some(watermark) = stats.watermark {
        info!("  Watermark: {}", watermark);
    }
    Ok(())
}

async fn work(path: &Path, partition: &str, run_dir: Option<String>) -> Result<(), JobError> {
    let config = Arc::new(Config::from_file(path).context(ConfigSnafu)?);
    let partition: PartitionSpec = serde_json::from_str(partition)
        .context(MessageSnafu)
        .context(WorkerSnafu)?;

    let ctx = WorkerContext::connect(config).await?;
    let assignment = WorkerAssignment::new(partition).with_run_directory(run_dir);
    let report = run_partition(&ctx, &assignment)
        .await
        .context(WorkerSnafu)?;

    let line = serde_json::to_string(&report)
        .context(MessageSnafu)
        .context(WorkerSnafu)?;
    println!("{line}");
    Ok(())
}
