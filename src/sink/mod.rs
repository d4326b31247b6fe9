//! Output side of a partition: rolling delimited text files.
//!
//! Each partition owns a group of files named
//! `{file_name}{suffix}-{sequence}.{extension}`, placed in the run's
//! subdirectory for incremental runs. A file is written under an
//! in-progress name ending in `.tmp` and renamed to its permanent name when
//! it is rolled or the writer is closed.

pub mod rolling;

pub use rolling::RollingTextWriter;

use crate::config::{CollisionPolicy, SinkConfig};

/// Suffix marking a file as still being written.
pub const IN_PROGRESS_SUFFIX: &str = ".tmp";

/// Lifecycle of an output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Open,
    Closing,
    Closed,
}

/// One segment of a partition's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    pub directory: Option<String>,
    pub base_name: String,
    pub partition_suffix: String,
    pub sequence: u64,
    pub extension: String,
    pub state: FileState,
    pub bytes_written: u64,
    pub records: u64,
}

impl OutputFile {
    fn new(settings: &WriterSettings, sequence: u64) -> Self {
        Self {
            directory: settings.directory.clone(),
            base_name: settings.file_name.clone(),
            partition_suffix: settings.partition_suffix.clone(),
            sequence,
            extension: settings.extension.clone(),
            state: FileState::Open,
            bytes_written: 0,
            records: 0,
        }
    }

    /// Permanent name, relative to the output location.
    pub fn file_name(&self) -> String {
        let stem = format!("{}{}-{}", self.base_name, self.partition_suffix, self.sequence);
        let name = if self.extension.is_empty() {
            stem
        } else {
            format!("{stem}.{}", self.extension)
        };
        match &self.directory {
            Some(dir) => format!("{dir}/{name}"),
            None => name,
        }
    }

    /// Name used while the file is open.
    pub fn in_progress_name(&self) -> String {
        format!("{}{IN_PROGRESS_SUFFIX}", self.file_name())
    }
}

/// A file that was renamed to its permanent name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedFile {
    pub filename: String,
    pub sequence: u64,
    pub size: u64,
    pub record_count: u64,
}

/// When to roll to a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverPolicy {
    pub threshold_bytes: u64,
}

impl RolloverPolicy {
    pub fn new(threshold_bytes: u64) -> Self {
        Self { threshold_bytes }
    }

    /// A non-empty file that reached the threshold is rolled before the
    /// next append. A single write is never split.
    pub fn should_roll(&self, bytes_written: u64) -> bool {
        bytes_written > 0 && bytes_written >= self.threshold_bytes
    }
}

/// Naming and rollover settings for one partition's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSettings {
    pub directory: Option<String>,
    pub file_name: String,
    pub partition_suffix: String,
    pub extension: String,
    pub rollover: RolloverPolicy,
    pub on_collision: CollisionPolicy,
}

impl WriterSettings {
    pub fn from_sink(sink: &SinkConfig, partition_suffix: impl Into<String>) -> Self {
        Self {
            directory: None,
            file_name: sink.file_name.clone(),
            partition_suffix: partition_suffix.into(),
            extension: sink.file_extension.trim_start_matches('.').to_string(),
            rollover: RolloverPolicy::new(sink.rollover_bytes),
            on_collision: sink.on_collision,
        }
    }

    /// Write into `directory` below the output location.
    pub fn with_directory(mut self, directory: Option<String>) -> Self {
        self.directory = directory;
        self
    }
}
