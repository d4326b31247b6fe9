//! Writable handle for a single output file.

use object_store::ObjectStore;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{IoSnafu, StorageError};
use crate::metrics::events::StorageOperation;

use super::record;

/// An open output file.
///
/// Local files are written in place and `flush` makes the data durable.
/// Object store files are uploaded in parts and only become visible once
/// `finish` completes the upload.
pub enum OutputStream {
    Local { path: PathBuf, file: File },
    Object { path: Path, writer: BufWriter },
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Local { path, .. } => write!(f, "OutputStream<{}>", path.display()),
            OutputStream::Object { path, .. } => write!(f, "OutputStream<{path}>"),
        }
    }
}

impl OutputStream {
    pub(super) async fn create_local(path: PathBuf) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context(IoSnafu {
                path: parent.display().to_string(),
            })?;
        }
        let file = File::create(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        Ok(OutputStream::Local { path, file })
    }

    pub(super) fn create_object(store: Arc<dyn ObjectStore>, path: Path) -> Self {
        let writer = BufWriter::new(store, path.clone());
        OutputStream::Object { path, writer }
    }

    fn display_path(&self) -> String {
        match self {
            OutputStream::Local { path, .. } => path.display().to_string(),
            OutputStream::Object { path, .. } => path.to_string(),
        }
    }

    /// Append bytes.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        let result = match self {
            OutputStream::Local { file, .. } => file.write_all(bytes).await,
            OutputStream::Object { writer, .. } => writer.write_all(bytes).await,
        };
        result.with_context(|_| IoSnafu {
            path: self.display_path(),
        })
    }

    /// Push buffered bytes to storage without closing the file.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match self {
            OutputStream::Local { file, .. } => match file.flush().await {
                Ok(()) => file.sync_data().await,
                Err(e) => Err(e),
            },
            OutputStream::Object { writer, .. } => writer.flush().await,
        };
        record(StorageOperation::Flush, start, result.is_ok());
        result.with_context(|_| IoSnafu {
            path: self.display_path(),
        })
    }

    /// Flush and close. Object store uploads are completed here.
    pub async fn finish(mut self) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match &mut self {
            OutputStream::Local { file, .. } => match file.flush().await {
                Ok(()) => file.sync_all().await,
                Err(e) => Err(e),
            },
            OutputStream::Object { writer, .. } => writer.shutdown().await,
        };
        record(StorageOperation::Finish, start, result.is_ok());
        result.with_context(|_| IoSnafu {
            path: self.display_path(),
        })
    }
}
