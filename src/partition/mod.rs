//! Range partitioning of the source table.
//!
//! The partition column's observed `[min, max]` is split into contiguous,
//! non-overlapping integer ranges. Every range but the last has an exclusive
//! upper bound; the last is open-ended so rows inserted above the observed
//! maximum while the job runs are still picked up.
//!
//! In incremental mode the check column's maximum is captured when partitions are computed
//! as the run's high watermark and every predicate is bounded by it, so a
//! run copies exactly the rows between the previous watermark and the new
//! one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::emit;
use crate::error::{
    ConfigError, MissingPartitionColumnSnafu, MissingBoundsTableSnafu, BoundsSnafu, QueryError,
};
use crate::metrics::events::PartitionsComputed;

/// One unit of work: a key range of the source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub index: usize,
    /// SQL predicate without the `WHERE` keyword; empty means every row.
    pub where_clause: String,
    pub lower_bound: Option<i64>,
    /// Exclusive; `None` for the open-ended last partition.
    pub upper_bound: Option<i64>,
}

impl PartitionSpec {
    /// Render the predicate as a `WHERE` clause, or an empty string.
    pub fn clause(&self) -> String {
        if self.where_clause.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.where_clause)
        }
    }

    /// Output file suffix owned by this partition.
    pub fn file_suffix(&self) -> String {
        format!("p{}", self.index)
    }
}

/// Result of partition computation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPlan {
    pub partitions: Vec<PartitionSpec>,
    /// Watermark the run resumed from (incremental only).
    pub resume_watermark: Option<i64>,
    /// Maximum check column value observed when partitions were computed (incremental only).
    pub high_watermark: Option<i64>,
}

impl PartitionPlan {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Subdirectory that keeps an incremental run's files apart from
    /// earlier runs: `{from}-{to}_{started}`, with `from` being `start` on
    /// the first run. `None` for full copies.
    pub fn run_directory(&self, started: DateTime<Utc>) -> Option<String> {
        let to = self.high_watermark?;
        let from = self
            .resume_watermark
            .map_or_else(|| "start".to_string(), |w| w.to_string());
        Some(format!("{from}-{to}_{}", started.format("%Y%m%dT%H%M%S%3fZ")))
    }
}

/// Values returned by the bounds query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnBounds {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub check_max: Option<i64>,
}

/// Splits a table into key ranges.
#[derive(Debug, Clone)]
pub struct RangePartitioner {
    table: Option<String>,
    partition_column: Option<String>,
    partitions: usize,
    check_column: Option<String>,
}

impl RangePartitioner {
    pub fn new(
        table: Option<String>,
        partition_column: Option<String>,
        partitions: usize,
        check_column: Option<String>,
    ) -> Result<Self, ConfigError> {
        let partition_column = partition_column.filter(|c| !c.trim().is_empty());
        let check_column = check_column.filter(|c| !c.trim().is_empty());
        let table = table.filter(|t| !t.trim().is_empty());

        ensure!(
            partitions <= 1 || partition_column.is_some(),
            MissingPartitionColumnSnafu { partitions }
        );
        if partition_column.is_some() || check_column.is_some() {
            ensure!(table.is_some(), MissingBoundsTableSnafu);
        }

        Ok(Self {
            table,
            partition_column,
            partitions,
            check_column,
        })
    }

    pub fn from_config(source: &SourceConfig) -> Result<Self, ConfigError> {
        Self::new(
            source.table.clone(),
            source.partition_column.clone(),
            source.partitions,
            source.check_column.clone(),
        )
    }

    /// The min/max bounds query, or `None` when none is needed.
    pub fn bounds_sql(&self, resume_watermark: Option<i64>) -> Option<String> {
        let table = self.table.as_deref()?;

        let mut selects = Vec::new();
        if let Some(p) = &self.partition_column {
            selects.push(format!("MIN({p})"));
            selects.push(format!("MAX({p})"));
        }
        if let Some(c) = &self.check_column {
            selects.push(format!("MAX({c})"));
        }
        if selects.is_empty() {
            return None;
        }

        let mut sql = format!("SELECT {} FROM {table}", selects.join(", "));
        if let (Some(c), Some(w)) = (&self.check_column, resume_watermark) {
            sql.push_str(&format!(" WHERE {c} > {w}"));
        }
        Some(sql)
    }

    /// Compute the partitions that cover every unprocessed row.
    ///
    /// The bounds query is not retried on failure; the table may be moving.
    pub async fn compute_ranges(
        &self,
        pool: &AnyPool,
        resume_watermark: Option<i64>,
    ) -> Result<PartitionPlan, QueryError> {
        let bounds = match self.bounds_sql(resume_watermark) {
            Some(sql) => {
                debug!(sql = %sql, "Querying partition bounds");
                let row = sqlx::query(&sql)
                    .fetch_one(pool)
                    .await
                    .context(BoundsSnafu { sql: sql.clone() })?;

                let mut idx = 0;
                let mut bounds = ColumnBounds::default();
                if self.partition_column.is_some() {
                    bounds.min = row.try_get(0).context(BoundsSnafu { sql: sql.clone() })?;
                    bounds.max = row.try_get(1).context(BoundsSnafu { sql: sql.clone() })?;
                    idx = 2;
                }
                if self.check_column.is_some() {
                    bounds.check_max = row.try_get(idx).context(BoundsSnafu { sql: sql.clone() })?;
                }
                Some(bounds)
            }
            None => None,
        };

        let plan = self.plan(bounds, resume_watermark);
        emit!(PartitionsComputed {
            count: plan.partitions.len()
        });
        info!(
            partitions = plan.partitions.len(),
            high_watermark = ?plan.high_watermark,
            "Computed partitions"
        );
        Ok(plan)
    }

    /// Build the plan from the bounds query results.
    pub fn plan(&self, bounds: Option<ColumnBounds>, resume_watermark: Option<i64>) -> PartitionPlan {
        let Some(bounds) = bounds else {
            return PartitionPlan {
                partitions: vec![single(String::new(), None)],
                ..PartitionPlan::default()
            };
        };

        let high_watermark = match &self.check_column {
            Some(_) => match bounds.check_max {
                Some(hw) => Some(hw),
                None => return PartitionPlan::default(),
            },
            None => None,
        };

        let incremental = match (&self.check_column, high_watermark) {
            (Some(c), Some(hw)) => Some(match resume_watermark {
                Some(w) => format!("{c} > {w} AND {c} <= {hw}"),
                None => format!("{c} <= {hw}"),
            }),
            _ => None,
        };

        let mut partitions = match &self.partition_column {
            Some(column) => match (bounds.min, bounds.max) {
                (Some(min), Some(max)) => split_range(column, min, max, self.partitions),
                _ => return PartitionPlan::default(),
            },
            None => vec![single(String::new(), None)],
        };

        if let Some(extra) = incremental {
            for spec in &mut partitions {
                spec.where_clause = if spec.where_clause.is_empty() {
                    extra.clone()
                } else {
                    format!("{} AND {extra}", spec.where_clause)
                };
            }
        }

        PartitionPlan {
            partitions,
            resume_watermark,
            high_watermark,
        }
    }
}

fn single(where_clause: String, lower_bound: Option<i64>) -> PartitionSpec {
    PartitionSpec {
        index: 0,
        where_clause,
        lower_bound,
        upper_bound: None,
    }
}

/// Split `[min, max]` into at most `count` contiguous ranges.
pub fn split_range(column: &str, min: i64, max: i64, count: usize) -> Vec<PartitionSpec> {
    if count <= 1 || min >= max {
        return vec![single(format!("{column} >= {min}"), Some(min))];
    }

    let span = max as i128 - min as i128 + 1;
    let count = (count as i128).min(span);
    let lower = |i: i128| (min as i128 + i * span / count) as i64;

    (0..count)
        .map(|i| {
            let lo = lower(i);
            if i + 1 < count {
                let hi = lower(i + 1);
                PartitionSpec {
                    index: i as usize,
                    where_clause: format!("{column} >= {lo} AND {column} < {hi}"),
                    lower_bound: Some(lo),
                    upper_bound: Some(hi),
                }
            } else {
                PartitionSpec {
                    index: i as usize,
                    where_clause: format!("{column} >= {lo}"),
                    lower_bound: Some(lo),
                    upper_bound: None,
                }
            }
        })
        .collect()
}
