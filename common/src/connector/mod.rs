// Uniform connector interface over the supported SQL dialects
//
// One concrete implementation per dialect; a factory selects by DbType.
// Placeholder generation and catalog queries live inside the concrete types.

mod mssql;
mod mysql;
mod postgres;
mod sqlite;

pub use mssql::MssqlConnector;
pub use mysql::MySqlConnector;
pub use postgres::PostgresConnector;
pub use sqlite::SqliteConnector;

use crate::errors::ConnectorError;
use crate::models::{DataSource, DbType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

/// One result row, keyed by column name
pub type Row = serde_json::Map<String, Value>;

/// Lazy, forward-only sequence of row batches. Each batch holds at most the
/// requested batch size; the final batch may be shorter. The producer task
/// owns the server-side cursor and releases it when the stream completes or
/// the receiver is dropped.
pub type RowBatchStream = ReceiverStream<Result<Vec<Row>, ConnectorError>>;

/// Capacity of the batch channel between producer task and consumer
pub(crate) const STREAM_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Raw dialect type text; downstream components normalise
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

/// Outcome of a connection probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub message: String,
}

/// Uniform interface over the four SQL dialects.
///
/// `connect` is idempotent; `disconnect` releases the pool and is safe to
/// call on a connector that never connected.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    fn db_type(&self) -> DbType;

    async fn connect(&self) -> Result<(), ConnectorError>;

    /// Open, run a no-op probe, close
    async fn test_connection(&self) -> ProbeResult;

    /// Discover user tables with their columns, ordered by schema, table,
    /// ordinal position; catalog tables are excluded
    async fn list_tables(&self) -> Result<Vec<TableInfo>, ConnectorError>;

    /// Materialized query
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ConnectorError>;

    /// Lazy batched read; consume to completion or drop to cancel
    async fn stream(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
    ) -> Result<RowBatchStream, ConnectorError>;

    /// Parameterized DML; returns affected row count
    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, ConnectorError>;

    async fn disconnect(&self) -> Result<(), ConnectorError>;
}

/// Parameter placeholder for position `n` (1-based), by dialect.
///
/// This is an external contract: operators write `where_clause` literals
/// against it. postgresql `$n`; mysql and sqlite `?`; mssql `@Pn`.
pub fn placeholder(db_type: DbType, n: usize) -> String {
    match db_type {
        DbType::PostgreSql => format!("${}", n),
        DbType::MySql | DbType::Sqlite => "?".to_string(),
        DbType::MsSql => format!("@P{}", n),
    }
}

/// Build the connector for a data source. `password` is the already
/// decrypted credential; it is moved into the connector and never logged.
pub fn connector_for(source: &DataSource, password: String) -> Box<dyn Connector> {
    match source.db_type {
        DbType::PostgreSql => Box::new(PostgresConnector::new(source, password)),
        DbType::MySql => Box::new(MySqlConnector::new(source, password)),
        DbType::MsSql => Box::new(MssqlConnector::new(source, password)),
        DbType::Sqlite => Box::new(SqliteConnector::new(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_by_dialect() {
        assert_eq!(placeholder(DbType::PostgreSql, 1), "$1");
        assert_eq!(placeholder(DbType::PostgreSql, 12), "$12");
        assert_eq!(placeholder(DbType::MySql, 3), "?");
        assert_eq!(placeholder(DbType::Sqlite, 7), "?");
        assert_eq!(placeholder(DbType::MsSql, 2), "@P2");
    }
}
