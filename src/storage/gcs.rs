//! Google Cloud Storage backend.

use object_store::gcp::{GoogleCloudStorageBuilder, GoogleConfigKey};
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{GcsConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider, apply_options, cloud_url};

/// Google Cloud Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcsConfig {
    pub bucket: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    pub(super) async fn construct_gcs(
        config: GcsConfig,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(&config.bucket);
        let mut builder = apply_options(builder, &options, |b, key: GoogleConfigKey, value| {
            b.with_config(key, value)
        })
        .context(GcsConfigSnafu)?
        .with_retry(RetryConfig::default());

        if let Ok(service_account_key) = std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY") {
            debug!("Using service account key from the environment");
            builder = builder.with_service_account_key(&service_account_key);
        }

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(GcsConfigSnafu)?);

        Ok(Self {
            canonical_url: cloud_url("gs", &config.bucket, config.key.as_ref()),
            config: BackendConfig::Gcs(config),
            object_store,
            storage_options: options,
        })
    }
}
