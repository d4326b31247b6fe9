//! Azure Blob Storage backend.

use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AzureConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider, apply_options, cloud_url};

/// Azure Blob Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    pub(super) async fn construct_azure(
        config: AzureConfig,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let builder = MicrosoftAzureBuilder::from_env()
            .with_account(&config.account)
            .with_container_name(&config.container);
        let builder = apply_options(builder, &options, |b, key: AzureConfigKey, value| {
            b.with_config(key, value)
        })
        .context(AzureConfigSnafu)?
        .with_retry(RetryConfig::default());

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(AzureConfigSnafu)?);

        let container = format!("{}@{}", config.container, config.account);
        Ok(Self {
            canonical_url: cloud_url("az", &container, config.key.as_ref()),
            config: BackendConfig::Azure(config),
            object_store,
            storage_options: options,
        })
    }
}
