//! Job configuration.
//!
//! Loaded once from a YAML file (after environment variable interpolation),
//! validated, and shared read-only with every component for the rest of the
//! run.

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{
    ConfigError, ConflictingRowSourceSnafu, EmptyDelimiterSnafu, EmptyJobNameSnafu,
    EmptySourceUrlSnafu, EnvInterpolationSnafu, MissingColumnsSnafu, MissingKerberosSettingSnafu,
    MissingPartitionColumnSnafu, MissingBoundsTableSnafu, MissingRowSourceSnafu,
    MissingTableSnafu, NotPositiveSnafu, OverwriteIncrementalSnafu, ReadFileSnafu,
    YamlParseSnafu,
};

/// Main configuration structure for a copy job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: JobConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Job identity and restart behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job identity; keys the checkpoint.
    pub name: String,
    /// Allow a new run after a failed one (default: false).
    #[serde(default)]
    pub restartable: bool,
}

/// Where rows come from and how they are split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database URL, e.g. "postgres://user:pw@host/db" or "sqlite://data.db".
    pub url: String,

    #[serde(default)]
    pub table: Option<String>,

    /// Comma separated column list, e.g. "id, name".
    #[serde(default)]
    pub columns: Option<String>,

    /// Raw query; `{partition_clause}` marks where the partition WHERE clause goes.
    #[serde(default)]
    pub sql: Option<String>,

    #[serde(default)]
    pub partition_column: Option<String>,

    /// Enables incremental mode when set.
    #[serde(default)]
    pub check_column: Option<String>,

    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Rows fetched and written per chunk (default: 1000).
    #[serde(default = "default_commit_interval")]
    pub commit_interval: usize,

    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_partitions() -> usize {
    4
}

fn default_commit_interval() -> usize {
    1000
}

fn default_delimiter() -> String {
    ",".to_string()
}

/// Output file settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Filesystem URI, e.g. "file:///", "s3://bucket".
    #[serde(default = "default_fs_uri")]
    pub fs_uri: String,

    #[serde(default = "default_directory")]
    pub directory: String,

    #[serde(default = "default_file_name")]
    pub file_name: String,

    #[serde(default = "default_file_extension")]
    pub file_extension: String,

    /// Roll to a new file once this many bytes were written (default: 1GB).
    #[serde(default = "default_rollover_bytes")]
    pub rollover_bytes: u64,

    #[serde(default)]
    pub on_collision: CollisionPolicy,

    /// Passed through to object store builders (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            fs_uri: default_fs_uri(),
            directory: default_directory(),
            file_name: default_file_name(),
            file_extension: default_file_extension(),
            rollover_bytes: default_rollover_bytes(),
            on_collision: CollisionPolicy::default(),
            storage_options: HashMap::new(),
            security: SecurityConfig::default(),
        }
    }
}

fn default_fs_uri() -> String {
    "file:///".to_string()
}

fn default_directory() -> String {
    "/data".to_string()
}

fn default_file_name() -> String {
    "jdbchdfs".to_string()
}

fn default_file_extension() -> String {
    "csv".to_string()
}

fn default_rollover_bytes() -> u64 {
    1_000_000_000
}

impl SinkConfig {
    /// Output location: `fs_uri` joined with `directory`.
    ///
    /// Only the part after `scheme://` is trimmed, so `file:///` keeps its
    /// empty authority.
    pub fn location(&self) -> String {
        let (scheme, rest) = match self.fs_uri.split_once("://") {
            Some((scheme, rest)) => (format!("{scheme}://"), rest),
            None => (String::new(), self.fs_uri.as_str()),
        };
        let base = rest.trim_end_matches('/');
        let dir = self.directory.trim_matches('/');
        match (base.is_empty(), dir.is_empty()) {
            (true, _) => format!("{scheme}/{dir}"),
            (false, true) => format!("{scheme}{base}/"),
            (false, false) => format!("{scheme}{base}/{dir}"),
        }
    }
}

/// What to do when an output file name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    #[default]
    Fail,
    Overwrite,
}

/// Filesystem authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityConfig {
    #[default]
    None,
    Kerberos {
        #[serde(default)]
        user_principal: Option<String>,
        #[serde(default)]
        user_keytab: Option<PathBuf>,
        #[serde(default)]
        namenode_principal: Option<String>,
        #[serde(default)]
        rm_manager_principal: Option<String>,
        #[serde(default)]
        properties_location: Option<String>,
        #[serde(default)]
        register_url_handler: Option<String>,
    },
}

impl SecurityConfig {
    /// Short name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            SecurityConfig::None => "none",
            SecurityConfig::Kerberos { .. } => "kerberos",
        }
    }
}

/// How partitions are executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Maximum partitions processed at once (default: 2).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub launcher: LauncherKind,

    /// Worker executable for the process launcher (default: this binary).
    #[serde(default)]
    pub program: Option<PathBuf>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            launcher: LauncherKind::default(),
            program: None,
        }
    }
}

fn default_max_workers() -> usize {
    2
}

/// Worker launch strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    /// Tokio tasks inside the coordinator.
    #[default]
    InProcess,
    /// One child process per partition.
    Process,
}

/// Where run state and watermarks are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Database URL (defaults to the source url).
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_checkpoint_table")]
    pub table: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            table: default_checkpoint_table(),
        }
    }
}

fn default_checkpoint_table() -> String {
    "sluice_checkpoint".to_string()
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the endpoint is started (default: false).
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate YAML text, interpolating environment variables first.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = vars::interpolate(content).map_err(|problems| {
            EnvInterpolationSnafu {
                message: problems.join("\n"),
            }
            .build()
        })?;

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.job.name.trim().is_empty(), EmptyJobNameSnafu);

        let source = &self.source;
        ensure!(!source.url.trim().is_empty(), EmptySourceUrlSnafu);
        ensure!(source.partitions > 0, NotPositiveSnafu { name: "partitions" });
        ensure!(
            source.commit_interval > 0,
            NotPositiveSnafu {
                name: "commit_interval"
            }
        );
        ensure!(!source.delimiter.is_empty(), EmptyDelimiterSnafu);

        match (has_text(&source.columns), has_text(&source.sql)) {
            (true, true) => return ConflictingRowSourceSnafu.fail(),
            (false, true) => {}
            (true, false) => ensure!(has_text(&source.table), MissingTableSnafu),
            (false, false) => match &source.table {
                Some(table) if !table.trim().is_empty() => {
                    return MissingColumnsSnafu {
                        table: table.clone(),
                    }
                    .fail();
                }
                _ => return MissingRowSourceSnafu.fail(),
            },
        }

        ensure!(
            source.partitions <= 1 || has_text(&source.partition_column),
            MissingPartitionColumnSnafu {
                partitions: source.partitions
            }
        );
        if source.partitions > 1 || has_text(&source.check_column) {
            ensure!(has_text(&source.table), MissingBoundsTableSnafu);
        }
        ensure!(
            !(has_text(&source.check_column) && self.sink.on_collision == CollisionPolicy::Overwrite),
            OverwriteIncrementalSnafu
        );

        ensure!(
            self.sink.rollover_bytes > 0,
            NotPositiveSnafu {
                name: "rollover_bytes"
            }
        );
        if let SecurityConfig::Kerberos {
            user_principal,
            user_keytab,
            ..
        } = &self.sink.security
        {
            ensure!(
                has_text(user_principal),
                MissingKerberosSettingSnafu {
                    field: "user_principal"
                }
            );
            ensure!(
                user_keytab.is_some(),
                MissingKerberosSettingSnafu {
                    field: "user_keytab"
                }
            );
        }

        ensure!(
            self.workers.max_workers > 0,
            NotPositiveSnafu {
                name: "max_workers"
            }
        );
        Ok(())
    }

    /// Database URL for the checkpoint store.
    pub fn checkpoint_url(&self) -> &str {
        self.checkpoint.url.as_deref().unwrap_or(&self.source.url)
    }

    /// Whether a check column enables incremental mode.
    pub fn is_incremental(&self) -> bool {
        has_text(&self.source.check_column)
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}
