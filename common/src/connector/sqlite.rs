// SQLite connector backed by a sqlx pool

use super::{ColumnInfo, Connector, ProbeResult, Row, RowBatchStream, TableInfo};
use crate::errors::ConnectorError;
use crate::models::{DataSource, DbType};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as SqlxRow, Sqlite, SqlitePool};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

/// File-backed connector; `DataSource.database` is the file path
pub struct SqliteConnector {
    path: PathBuf,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteConnector {
    pub fn new(source: &DataSource) -> Self {
        Self {
            path: PathBuf::from(&source.database),
            pool: RwLock::new(None),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<SqlitePool, ConnectorError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(ConnectorError::NotConnected)
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        params: &'q [Value],
    ) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for param in params {
            query = match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        query.bind(i)
                    } else {
                        query.bind(n.as_f64().unwrap_or(f64::NAN))
                    }
                }
                Value::String(s) => query.bind(s.clone()),
                other => query.bind(other.to_string()),
            };
        }
        query
    }

    fn row_to_json(row: &SqliteRow) -> Row {
        let mut out = Row::new();
        for (i, column) in row.columns().iter().enumerate() {
            let value: Value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
                v.map(|n| json!(n)).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
                v.map(|n| json!(n)).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
                v.map(Value::String).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
                v.map(Value::Bool).unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            out.insert(column.name().to_string(), value);
        }
        out
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn db_type(&self) -> DbType {
        DbType::Sqlite
    }

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<(), ConnectorError> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", self.path.display()))
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;

        *guard = Some(pool);
        Ok(())
    }

    async fn test_connection(&self) -> ProbeResult {
        let probe = async {
            self.connect().await?;
            let pool = self.pool().await?;
            sqlx::query("PRAGMA schema_version").fetch_one(&pool).await?;
            self.disconnect().await?;
            Ok::<_, ConnectorError>(())
        };

        match probe.await {
            Ok(()) => ProbeResult {
                ok: true,
                message: "Connection successful".to_string(),
            },
            Err(e) => ProbeResult {
                ok: false,
                message: e.to_string(),
            },
        }
    }

    #[instrument(skip(self))]
    async fn list_tables(&self) -> Result<Vec<TableInfo>, ConnectorError> {
        let pool = self.pool().await?;

        let names = sqlx::query(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| ConnectorError::DiscoveryFailed(e.to_string()))?;

        let mut tables = Vec::with_capacity(names.len());
        for name_row in names {
            let table: String = name_row.try_get("name")?;
            // table_info already reports columns in ordinal order
            let columns = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table))
                .fetch_all(&pool)
                .await
                .map_err(|e| ConnectorError::DiscoveryFailed(e.to_string()))?
                .iter()
                .map(|row| {
                    Ok(ColumnInfo {
                        name: row.try_get("name")?,
                        data_type: row.try_get("type")?,
                        nullable: row.try_get::<i64, _>("notnull")? == 0,
                        is_primary_key: row.try_get::<i64, _>("pk")? > 0,
                        default_value: row.try_get("dflt_value")?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()?;

            tables.push(TableInfo {
                schema: String::new(),
                table,
                columns,
            });
        }

        Ok(tables)
    }

    #[instrument(skip(self, sql, params))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ConnectorError> {
        let pool = self.pool().await?;
        let rows = Self::bind_params(sqlx::query(sql), params)
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_json).collect())
    }

    async fn stream(
        &self,
        sql: &str,
        params: &[Value],
        batch_size: usize,
    ) -> Result<RowBatchStream, ConnectorError> {
        let pool = self.pool().await?;
        let sql = sql.to_string();
        let params = params.to_vec();
        let batch_size = batch_size.max(1);
        let (tx, rx) = tokio::sync::mpsc::channel(super::STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut rows = Self::bind_params(sqlx::query(&sql), &params).fetch(&pool);
            let mut batch = Vec::with_capacity(batch_size);

            loop {
                match rows.try_next().await {
                    Ok(Some(row)) => {
                        batch.push(Self::row_to_json(&row));
                        if batch.len() == batch_size
                            && tx.send(Ok(std::mem::take(&mut batch))).await.is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => {
                        if !batch.is_empty() {
                            let _ = tx.send(Ok(batch)).await;
                        }
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(ConnectorError::QueryFailed(e.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    #[instrument(skip(self, sql, params))]
    async fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, ConnectorError> {
        let pool = self.pool().await?;
        let result = Self::bind_params(sqlx::query(sql), params)
            .execute(&pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
        }
        Ok(())
    }
}
