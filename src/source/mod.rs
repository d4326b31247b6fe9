//! Row source for a partition.
//!
//! Builds the per-partition query from either a table and column list or a
//! raw SQL template, and streams its rows as delimited text lines.
//!
//! Table columns are cast to text for databases whose temporal, numeric and
//! uuid types the generic driver cannot decode. Raw SQL is run as written,
//! so such columns must be cast in the template.

pub mod reader;

pub use reader::ColumnReader;

use crate::config::SourceConfig;
use crate::db::Dialect;
use crate::partition::PartitionSpec;

/// Marker in a raw SQL template replaced by the partition's `WHERE` clause.
pub const PARTITION_CLAUSE_PLACEHOLDER: &str = "{partition_clause}";

/// Where a partition's rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSource {
    Table {
        table: String,
        columns: Vec<String>,
        dialect: Dialect,
    },
    Sql { template: String },
}

impl RowSource {
    /// Build the row source from a validated source configuration.
    pub fn from_config(source: &SourceConfig) -> Option<Self> {
        if let Some(sql) = source.sql.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(RowSource::Sql {
                template: sql.trim().to_string(),
            });
        }

        let table = source.table.as_deref()?.trim().to_string();
        let columns = parse_columns(source.columns.as_deref()?);
        if table.is_empty() || columns.is_empty() {
            return None;
        }
        Some(RowSource::Table {
            table,
            columns,
            dialect: Dialect::from_url(&source.url),
        })
    }

    /// Query text for one partition.
    pub fn query(&self, partition: &PartitionSpec) -> String {
        let clause = partition.clause();
        match self {
            RowSource::Table {
                table,
                columns,
                dialect,
            } => {
                let columns: Vec<String> = columns.iter().map(|c| dialect.text_column(c)).collect();
                format!("SELECT {} FROM {table} {clause}", columns.join(", "))
                    .trim()
                    .to_string()
            }
            RowSource::Sql { template } => {
                if template.contains(PARTITION_CLAUSE_PLACEHOLDER) {
                    template
                        .replace(PARTITION_CLAUSE_PLACEHOLDER, &clause)
                        .trim()
                        .to_string()
                } else if clause.is_empty() {
                    template.clone()
                } else {
                    format!("{template} {clause}")
                }
            }
        }
    }
}

/// Split a comma separated column list, dropping blanks.
pub fn parse_columns(columns: &str) -> Vec<String> {
    columns
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from)
        .collect()
}
