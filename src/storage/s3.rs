//! S3 and S3-compatible storage backend.

use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::path::Path;
use object_store::{ObjectStore, RetryConfig};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{S3ConfigSnafu, StorageError};

use super::{BackendConfig, StorageProvider, apply_options, cloud_url};

/// S3 storage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: String,
    pub key: Option<Path>,
}

impl StorageProvider {
    /// Region and endpoint from the URL take precedence over
    /// `storage_options`. A custom endpoint switches to path-style requests
    /// and allows plain http, which is what MinIO and similar servers need.
    pub(super) async fn construct_s3(
        config: S3Config,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);
        let mut builder = apply_options(builder, &options, |b, key: AmazonS3ConfigKey, value| {
            b.with_config(key, value)
        })
        .context(S3ConfigSnafu)?
        .with_retry(RetryConfig::default());

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            debug!(endpoint = %endpoint, bucket = %config.bucket, "Using custom S3 endpoint");
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(builder.build().context(S3ConfigSnafu)?);

        Ok(Self {
            canonical_url: cloud_url("s3", &config.bucket, config.key.as_ref()),
            config: BackendConfig::S3(config),
            object_store,
            storage_options: options,
        })
    }
}
