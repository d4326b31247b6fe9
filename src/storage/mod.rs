//! Filesystem abstraction for output files.
//!
//! Output goes to the local filesystem or to S3, GCS or Azure Blob Storage.
//! Names passed to the provider are relative to the configured location.

mod azure;
mod gcs;
mod local;
mod output;
mod s3;

pub use azure::AzureConfig;
pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use output::OutputStream;
pub use s3::S3Config;

use object_store::ObjectStore;
use object_store::path::Path;
use regex::Regex;
use snafu::prelude::*;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError, UnsupportedSchemeSnafu};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider over one output location.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for different storage backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const ABFS_URL: &str = r"^abfss?://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)\.dfs\.core\.windows\.net(/(?P<key>.+))?$";
const AZ_URL: &str = r"^az://(?P<container>[a-z0-9\-]+)@(?P<account>[a-z0-9]+)(/(?P<key>.+))?$";

/// Schemes that are recognised but have no backend.
const UNSUPPORTED: &str = r"^(?P<scheme>hdfs|webhdfs|viewfs)://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Azure,
    Local,
}

/// Ordered matchers; the first backend with a matching pattern wins.
static MATCHERS: LazyLock<Vec<(Backend, Vec<Regex>)>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("storage URL pattern is valid"))
            .collect::<Vec<_>>()
    };
    vec![
        (Backend::S3, compile(&[S3_PATH, S3_ENDPOINT_URL, S3_URL])),
        (Backend::Gcs, compile(&[GCS_URL])),
        (Backend::Azure, compile(&[ABFS_URL, AZ_URL])),
        (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
    ]
});

static UNSUPPORTED_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(UNSUPPORTED).expect("scheme pattern is valid"));

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(caps) = UNSUPPORTED_SCHEME.captures(url) {
            return UnsupportedSchemeSnafu {
                scheme: caps["scheme"].to_string(),
            }
            .fail();
        }

        for (backend, patterns) in MATCHERS.iter() {
            if let Some(matches) = patterns.iter().find_map(|r| r.captures(url)) {
                return Ok(match backend {
                    Backend::S3 => Self::parse_s3(&matches),
                    Backend::Gcs => Self::parse_gcs(&matches),
                    Backend::Azure => Self::parse_azure(&matches),
                    Backend::Local => Self::parse_local(&matches),
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: &regex::Captures) -> Self {
        let bucket = matches["bucket"].to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = matches.name("key").map(|m| m.as_str().into());

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        })
    }

    fn parse_gcs(matches: &regex::Captures) -> Self {
        let bucket = matches["bucket"].to_string();
        let key = matches.name("key").map(|r| r.as_str().into());
        BackendConfig::Gcs(GcsConfig { bucket, key })
    }

    fn parse_azure(matches: &regex::Captures) -> Self {
        let container = matches["container"].to_string();
        let account = matches["account"].to_string();
        let key = matches.name("key").map(|r| r.as_str().into());
        BackendConfig::Azure(AzureConfig {
            account,
            container,
            key,
        })
    }

    fn parse_local(matches: &regex::Captures) -> Self {
        let path = &matches["path"];
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let trimmed = path.trim_end_matches('/');
        BackendConfig::Local(LocalConfig {
            path: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
        })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Azure(azure) => azure.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Azure(config) => Self::construct_azure(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Location URL with credentials and options resolved away.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Options passed to the object store builder.
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Qualify a relative name with the configured key prefix.
    pub fn qualify_path(&self, name: &str) -> Path {
        let name = Path::from(name);
        match self.config.key() {
            Some(prefix) => prefix.parts().chain(name.parts()).collect(),
            None => name,
        }
    }

    /// Open a new output stream, truncating any existing file of that name.
    pub async fn create(&self, name: &str) -> Result<OutputStream, StorageError> {
        let start = Instant::now();
        let result = match &self.config {
            BackendConfig::Local(local) => OutputStream::create_local(local.file_path(name)).await,
            _ => Ok(OutputStream::create_object(
                Arc::clone(&self.object_store),
                self.qualify_path(name),
            )),
        };
        record(StorageOperation::Create, start, result.is_ok());
        result
    }

    /// Move `from` to `to`, replacing `to` if it exists.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match &self.config {
            BackendConfig::Local(local) => local.rename(from, to).await,
            _ => self
                .object_store
                .rename(&self.qualify_path(from), &self.qualify_path(to))
                .await
                .context(ObjectStoreSnafu),
        };
        record(StorageOperation::Rename, start, result.is_ok());
        result
    }

    /// Whether a file of that name exists.
    pub async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let start = Instant::now();
        let result = match &self.config {
            BackendConfig::Local(local) => local.exists(name).await,
            _ => match self.object_store.head(&self.qualify_path(name)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(source) => Err(StorageError::ObjectStore { source }),
            },
        };
        record(StorageOperation::Exists, start, result.is_ok());
        result
    }

    /// Remove a file. Removing a missing file is not an error.
    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match &self.config {
            BackendConfig::Local(local) => local.delete(name).await,
            _ => self
                .object_store
                .delete(&self.qualify_path(name))
                .await
                .context(ObjectStoreSnafu),
        };
        let result = match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        record(StorageOperation::Delete, start, result.is_ok());
        result
    }

    /// Read a whole file.
    pub async fn read(&self, name: &str) -> Result<bytes::Bytes, StorageError> {
        let start = Instant::now();
        let result = match &self.config {
            BackendConfig::Local(local) => local.read(name).await,
            _ => match self.object_store.get(&self.qualify_path(name)).await {
                Ok(get) => get.bytes().await.context(ObjectStoreSnafu),
                Err(source) => Err(StorageError::ObjectStore { source }),
            },
        };
        record(StorageOperation::Get, start, result.is_ok());
        result
    }

    /// Object-store backed provider over an in-memory store.
    #[cfg(test)]
    pub(crate) fn in_memory(key: Option<&str>) -> Self {
        Self {
            config: BackendConfig::S3(S3Config {
                endpoint: None,
                region: None,
                bucket: "memory".to_string(),
                key: key.map(Path::from),
            }),
            object_store: Arc::new(object_store::memory::InMemory::new()),
            canonical_url: "memory://".to_string(),
            storage_options: HashMap::new(),
        }
    }
}

/// Location reported for a cloud backend: `scheme://container[/key]`.
fn cloud_url(scheme: &str, container: &str, key: Option<&Path>) -> String {
    match key {
        Some(key) => format!("{scheme}://{container}/{key}"),
        None => format!("{scheme}://{container}"),
    }
}

/// Apply `storage_options` to a cloud store builder in key order.
///
/// Keys are matched case-insensitively, so `AWS_REGION` works as well as
/// `aws_region`.
fn apply_options<B, K>(
    builder: B,
    options: &HashMap<String, String>,
    with_config: impl Fn(B, K, String) -> B,
) -> Result<B, object_store::Error>
where
    K: FromStr<Err = object_store::Error>,
{
    let mut entries: Vec<(&String, &String)> = options.iter().collect();
    entries.sort();
    entries.into_iter().try_fold(builder, |builder, (key, value)| {
        let key = key.to_ascii_lowercase().parse()?;
        Ok(with_config(builder, key, value.clone()))
    })
}

fn record(operation: StorageOperation, start: Instant, ok: bool) {
    let status = if ok {
        RequestStatus::Success
    } else {
        RequestStatus::Error
    };
    emit!(StorageRequest { operation, status });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}
