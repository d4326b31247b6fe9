//! sluice: partitioned batch copy of a database table into rolling text files.
//!
//! A coordinator splits the source table into key ranges, hands each range
//! to a worker that streams its rows into delimited files on a local or
//! object-store filesystem, and records a watermark so the next run only
//! copies new rows.
//!
//! # Example
//!
//! ```ignore
//! use sluice::{Config, run_job, error::JobError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), JobError> {
//!     let path = std::path::Path::new("job.yaml");
//!     let config = Config::from_file(path).expect("valid config");
//!     let stats = run_job(config, path).await?;
//!     println!("Copied {} rows", stats.rows_written);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod metrics;
pub mod partition;
pub mod sink;
pub mod source;
pub mod storage;
pub mod worker;

// Re-export main types
pub use config::Config;
pub use job::{Job, JobStats, build_job, run_job};
pub use partition::{PartitionSpec, RangePartitioner};
pub use storage::{StorageProvider, StorageProviderRef};
