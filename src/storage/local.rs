//! Local filesystem storage backend implementation.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, StorageProvider};

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
}

impl LocalConfig {
    pub(super) fn file_path(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.path).join(name)
    }

    pub(super) async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let from = self.file_path(from);
        tokio::fs::rename(&from, self.file_path(to))
            .await
            .context(IoSnafu {
                path: from.display().to_string(),
            })
    }

    pub(super) async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.file_path(name);
        tokio::fs::try_exists(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })
    }

    pub(super) async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.file_path(name);
        tokio::fs::remove_file(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })
    }

    pub(super) async fn read(&self, name: &str) -> Result<bytes::Bytes, StorageError> {
        let path = self.file_path(name);
        let data = tokio::fs::read(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        Ok(data.into())
    }
}

impl StorageProvider {
    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu {
                path: config.path.clone(),
            })?;

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(&config.path).context(ObjectStoreSnafu)?);

        let canonical_url = format!("file://{}", config.path);

        Ok(Self {
            config: BackendConfig::Local(config),
            object_store,
            canonical_url,
            storage_options: HashMap::new(),
        })
    }
}
