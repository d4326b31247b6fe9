//! Database connectivity shared by the partitioner, readers and the
//! checkpoint store.

use snafu::prelude::*;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row, ValueRef};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;

use crate::error::{ConnectSnafu, DecodeSnafu, QueryError};

static INSTALL_DRIVERS: Once = Once::new();

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Open a connection pool for any supported database URL.
pub async fn connect(url: &str, max_connections: u32) -> Result<AnyPool, QueryError> {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

    debug!(
        url = redact(url),
        max_connections, "Connecting to database"
    );
    AnyPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(url)
        .await
        .context(ConnectSnafu {
            url: redact(url),
        })
}

/// Strip credentials from a database URL for logs and errors.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// SQL flavour of a database: bind placeholders and text casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Self {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Dialect::Postgres,
            "mysql" | "mariadb" => Dialect::MySql,
            _ => Dialect::Sqlite,
        }
    }

    /// Placeholder for the `n`th (1-based) bind parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${n}"),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Select `column` as text.
    ///
    /// The generic driver only decodes integers, floats, strings, booleans
    /// and bytes, so dates, timestamps, numerics and uuids from Postgres or
    /// MySQL are cast server side. SQLite values always decode and are left
    /// alone, as is `*`.
    pub fn text_column(&self, column: &str) -> String {
        match self {
            _ if column == "*" => column.to_string(),
            Dialect::Postgres => format!("CAST({column} AS TEXT)"),
            Dialect::MySql => format!("CAST({column} AS CHAR)"),
            Dialect::Sqlite => column.to_string(),
        }
    }
}

/// Render column `index` of `row` as text. NULL renders as an empty string.
pub fn column_text(row: &AnyRow, index: usize) -> Result<String, QueryError> {
    let column_name = || {
        row.columns()
            .get(index)
            .map(|c| sqlx::Column::name(c).to_string())
            .unwrap_or_else(|| index.to_string())
    };

    let is_null = row
        .try_get_raw(index)
        .map(|value| value.is_null())
        .map_err(|_| DecodeSnafu { column: column_name() }.build())?;
    if is_null {
        return Ok(String::new());
    }

    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Ok(v.to_string());
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Ok(v.to_string());
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(index) {
        return Ok(v.to_string());
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
        return Ok(String::from_utf8_lossy(&v).into_owned());
    }

    DecodeSnafu {
        column: column_name(),
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(Dialect::from_url("postgres://u@h/db"), Dialect::Postgres);
        assert_eq!(Dialect::from_url("postgresql://u@h/db"), Dialect::Postgres);
        assert_eq!(Dialect::from_url("mysql://u@h/db"), Dialect::MySql);
        assert_eq!(Dialect::from_url("sqlite://x.db"), Dialect::Sqlite);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::MySql.placeholder(2), "?");
        assert_eq!(Dialect::Sqlite.placeholder(1), "?");
    }

    #[test]
    fn test_text_column() {
        assert_eq!(Dialect::Postgres.text_column("created"), "CAST(created AS TEXT)");
        assert_eq!(Dialect::MySql.text_column("t.amount"), "CAST(t.amount AS CHAR)");
        assert_eq!(Dialect::Sqlite.text_column("created"), "created");
        assert_eq!(Dialect::Postgres.text_column("*"), "*");
    }

    #[test]
    fn test_redact() {
        assert_eq!(
            redact("postgres://etl:secret@db:5432/shop"),
            "postgres://***@db:5432/shop"
        );
        assert_eq!(redact("sqlite://data.db"), "sqlite://data.db");
    }

    #[tokio::test]
    async fn test_column_text_renders_values() {
        let pool = connect("sqlite::memory:", 1).await.unwrap();
        let row: AnyRow = sqlx::query("SELECT 42, 'abc', NULL, 1.5")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(column_text(&row, 0).unwrap(), "42");
        assert_eq!(column_text(&row, 1).unwrap(), "abc");
        assert_eq!(column_text(&row, 2).unwrap(), "");
        assert_eq!(column_text(&row, 3).unwrap(), "1.5");
    }
}
