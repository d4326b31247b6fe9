//! Size-based rolling text writer.

use snafu::prelude::*;
use tracing::{debug, info};

use crate::config::CollisionPolicy;
use crate::emit;
use crate::error::{
    ClosedSnafu, FileExistsSnafu, UnfinalizedSnafu, WriterError, WriterStorageSnafu,
};
use crate::metrics::events::{BytesWritten, FileFinalized};
use crate::storage::{OutputStream, StorageProviderRef};

use super::{FileState, FinishedFile, OutputFile, WriterSettings};

struct Segment {
    file: OutputFile,
    stream: OutputStream,
}

/// Writes lines to a partition's file group, rolling on size.
///
/// Dropping the writer without `close` leaves the current file under its
/// in-progress name. So does a failed finalize, after which every further
/// call returns [`WriterError::Unfinalized`].
pub struct RollingTextWriter {
    storage: StorageProviderRef,
    settings: WriterSettings,
    current: Option<Segment>,
    next_sequence: u64,
    finished: Vec<FinishedFile>,
    rows_written: u64,
    closed: bool,
    unfinalized: Option<String>,
}

impl RollingTextWriter {
    pub fn new(storage: StorageProviderRef, settings: WriterSettings) -> Self {
        Self {
            storage,
            settings,
            current: None,
            next_sequence: 0,
            finished: Vec::new(),
            rows_written: 0,
            closed: false,
            unfinalized: None,
        }
    }

    fn check_finalized(&self) -> Result<(), WriterError> {
        match &self.unfinalized {
            Some(file) => UnfinalizedSnafu { file: file.clone() }.fail(),
            None => Ok(()),
        }
    }

    /// Append `lines`, each terminated by `\n`.
    pub async fn write(&mut self, lines: &[String]) -> Result<(), WriterError> {
        self.check_finalized()?;
        ensure!(!self.closed, ClosedSnafu);
        if lines.is_empty() {
            return Ok(());
        }

        let size: usize = lines.iter().map(|l| l.len() + 1).sum();
        let mut block = String::with_capacity(size);
        for line in lines {
            block.push_str(line);
            block.push('\n');
        }

        let roll = self
            .current
            .as_ref()
            .is_some_and(|s| self.settings.rollover.should_roll(s.file.bytes_written));
        if roll {
            self.finish_current().await?;
        }
        if self.current.is_none() {
            self.open_next().await?;
        }

        let segment = self.current.as_mut().context(ClosedSnafu)?;
        let name = segment.file.in_progress_name();
        segment
            .stream
            .write(block.as_bytes())
            .await
            .context(WriterStorageSnafu { file: name })?;
        segment.file.bytes_written += block.len() as u64;
        segment.file.records += lines.len() as u64;
        self.rows_written += lines.len() as u64;

        emit!(BytesWritten {
            bytes: block.len() as u64
        });
        Ok(())
    }

    /// Push written bytes to storage; the file stays open under its
    /// in-progress name.
    pub async fn flush(&mut self) -> Result<(), WriterError> {
        self.check_finalized()?;
        ensure!(!self.closed, ClosedSnafu);
        if let Some(segment) = self.current.as_mut() {
            let name = segment.file.in_progress_name();
            segment
                .stream
                .flush()
                .await
                .context(WriterStorageSnafu { file: name })?;
        }
        Ok(())
    }

    /// Flush and finalize the current file. Closing a closed writer is a
    /// no-op; closing after a failed finalize fails again.
    pub async fn close(&mut self) -> Result<(), WriterError> {
        self.check_finalized()?;
        if self.closed {
            return Ok(());
        }
        self.finish_current().await?;
        self.closed = true;
        debug!(
            suffix = %self.settings.partition_suffix,
            files = self.finished.len(),
            rows = self.rows_written,
            "Writer closed"
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Files renamed to their permanent names so far, in sequence order.
    pub fn finished_files(&self) -> &[FinishedFile] {
        &self.finished
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// The file currently open, if any.
    pub fn current_file(&self) -> Option<&OutputFile> {
        self.current.as_ref().map(|s| &s.file)
    }

    async fn open_next(&mut self) -> Result<(), WriterError> {
        let file = OutputFile::new(&self.settings, self.next_sequence);
        let target = file.file_name();

        let exists = self
            .storage
            .exists(&target)
            .await
            .context(WriterStorageSnafu {
                file: target.clone(),
            })?;
        if exists {
            match self.settings.on_collision {
                CollisionPolicy::Fail => return FileExistsSnafu { file: target }.fail(),
                CollisionPolicy::Overwrite => {
                    debug!(file = %target, "Existing file will be replaced");
                }
            }
        }

        let temp = file.in_progress_name();
        let stream = self
            .storage
            .create(&temp)
            .await
            .context(WriterStorageSnafu { file: temp.clone() })?;
        debug!(file = %temp, "Opened output file");

        self.next_sequence += 1;
        self.current = Some(Segment { file, stream });
        Ok(())
    }

    async fn finish_current(&mut self) -> Result<(), WriterError> {
        let Some(segment) = self.current.take() else {
            return Ok(());
        };
        let temp = segment.file.in_progress_name();
        match self.finalize(segment).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.unfinalized = Some(temp);
                Err(e)
            }
        }
    }

    async fn finalize(&mut self, segment: Segment) -> Result<(), WriterError> {
        let Segment { mut file, stream } = segment;
        file.state = FileState::Closing;
        let temp = file.in_progress_name();
        stream
            .finish()
            .await
            .context(WriterStorageSnafu { file: temp.clone() })?;

        let target = file.file_name();
        self.storage
            .rename(&temp, &target)
            .await
            .context(WriterStorageSnafu {
                file: target.clone(),
            })?;
        file.state = FileState::Closed;

        info!(
            file = %target,
            bytes = file.bytes_written,
            rows = file.records,
            "Finalized output file"
        );
        emit!(FileFinalized {
            bytes: file.bytes_written
        });

        self.finished.push(FinishedFile {
            filename: target,
            sequence: file.sequence,
            size: file.bytes_written,
            record_count: file.records,
        });
        Ok(())
    }
}
