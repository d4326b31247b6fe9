//! Streaming reader rendering rows as delimited text.

use futures::StreamExt;
use futures::stream::BoxStream;
use snafu::prelude::*;
use sqlx::AnyPool;
use sqlx::any::AnyRow;
use tracing::debug;

use crate::db::column_text;
use crate::emit;
use crate::error::{QueryError, UnsupportedTypeSnafu};
use crate::metrics::events::RowsRead;

/// Forward-only reader over one partition's query.
///
/// Rows are rendered as column values joined by the delimiter, in query
/// column order. Embedded delimiters are not escaped.
pub struct ColumnReader<'a> {
    sql: &'a str,
    rows: Option<BoxStream<'a, Result<AnyRow, sqlx::Error>>>,
    delimiter: String,
    fetch_size: usize,
    rows_read: u64,
}

impl<'a> ColumnReader<'a> {
    /// Start streaming `sql`. Nothing is fetched until the first read.
    pub fn open(pool: &'a AnyPool, sql: &'a str, delimiter: &str, fetch_size: usize) -> Self {
        debug!(sql, fetch_size, "Opening reader");
        Self {
            sql,
            rows: Some(sqlx::query(sql).fetch(pool)),
            delimiter: delimiter.to_string(),
            fetch_size: fetch_size.max(1),
            rows_read: 0,
        }
    }

    /// Next line, or `None` once the result set is exhausted.
    pub async fn read(&mut self) -> Result<Option<String>, QueryError> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };

        match rows.next().await {
            Some(row) => {
                let row = row.map_err(|e| row_error(self.sql, e))?;
                let line = self.render(&row)?;
                self.rows_read += 1;
                Ok(Some(line))
            }
            None => {
                self.rows = None;
                Ok(None)
            }
        }
    }

    /// Up to `fetch_size` lines; empty at end of stream.
    pub async fn read_batch(&mut self) -> Result<Vec<String>, QueryError> {
        let mut batch = Vec::with_capacity(self.fetch_size);
        while batch.len() < self.fetch_size {
            match self.read().await? {
                Some(line) => batch.push(line),
                None => break,
            }
        }
        if !batch.is_empty() {
            emit!(RowsRead {
                count: batch.len() as u64
            });
        }
        Ok(batch)
    }

    /// Release the underlying stream and its connection.
    pub fn close(&mut self) {
        if self.rows.take().is_some() {
            debug!(rows = self.rows_read, "Reader closed");
        }
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    fn render(&self, row: &AnyRow) -> Result<String, QueryError> {
        let width = sqlx::Row::len(row);
        let mut line = String::new();
        for i in 0..width {
            if i > 0 {
                line.push_str(&self.delimiter);
            }
            line.push_str(&column_text(row, i)?);
        }
        Ok(line)
    }
}

/// Conversion failures in the generic driver get their own error, pointing
/// at the fix.
fn row_error(sql: &str, source: sqlx::Error) -> QueryError {
    match source {
        sqlx::Error::AnyDriverError(e) => UnsupportedTypeSnafu {
            sql,
            message: e.to_string(),
        }
        .build(),
        source => QueryError::Rows {
            sql: sql.to_string(),
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect;

    async fn pool_with_rows() -> AnyPool {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER, name TEXT, note TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        for (id, name, note) in [(1, "ONE", Some("x")), (2, "TWO", None), (3, "THREE", Some("z"))] {
            sqlx::query("INSERT INTO t VALUES (?, ?, ?)")
                .bind(id)
                .bind(name)
                .bind(note)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_read_lines_in_order() {
        let pool = pool_with_rows().await;
        let sql = "SELECT name, note FROM t ORDER BY id";
        let mut reader = ColumnReader::open(&pool, sql, "|", 10);

        assert_eq!(reader.read().await.unwrap().as_deref(), Some("ONE|x"));
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("TWO|"));
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("THREE|z"));
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.read().await.unwrap(), None);
        assert_eq!(reader.rows_read(), 3);
    }

    #[tokio::test]
    async fn test_read_batches_respect_fetch_size() {
        let pool = pool_with_rows().await;
        let sql = "SELECT id, name FROM t ORDER BY id";
        let mut reader = ColumnReader::open(&pool, sql, ",", 2);

        assert_eq!(reader.read_batch().await.unwrap(), vec!["1,ONE", "2,TWO"]);
        assert_eq!(reader.read_batch().await.unwrap(), vec!["3,THREE"]);
        assert!(reader.read_batch().await.unwrap().is_empty());
        reader.close();
        assert!(reader.read_batch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_query_is_query_error() {
        let pool = pool_with_rows().await;
        let mut reader = ColumnReader::open(&pool, "SELECT nope FROM missing", ",", 2);
        let err = reader.read().await.unwrap_err();
        assert!(matches!(err, QueryError::Rows { .. }));
    }

    #[test]
    fn test_unsupported_column_type_explains_cast() {
        let sql = "SELECT created_at FROM orders";
        let source = sqlx::Error::AnyDriverError(
            "Any driver does not support the Postgres type PgTypeInfo(Timestamptz)".into(),
        );

        let err = row_error(sql, source);
        assert!(matches!(err, QueryError::UnsupportedType { .. }));
        let message = err.to_string();
        assert!(message.contains("does not support the Postgres type"));
        assert!(message.contains("CAST(col AS CHAR)"));
        assert!(message.ends_with(sql));

        let err = row_error(sql, sqlx::Error::RowNotFound);
        assert!(matches!(err, QueryError::Rows { .. }));
    }
}
