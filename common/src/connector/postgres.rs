// PostgreSQL connector backed by a sqlx pool

use super::{ColumnInfo, Connector, ProbeResult, Row, RowBatchStream, TableInfo};
use crate::errors::ConnectorError;
use crate::models::{DataSource, DbType};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use serde_json::{json, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, PgPool, Postgres, Row as SqlxRow};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

pub struct PostgresConnector {
    options: PgConnectOptions,
    connect_timeout: Duration,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresConnector {
    pub fn new(source: &DataSource, password: String) -> Self {
        let ssl_mode = if source.ssl_enabled {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };

        let options = PgConnectOptions::new()
            .host(&source.host)
            .port(source.port)
            .database(&source.database)
            .username(&source.username)
            .password(&password)
            .ssl_mode(ssl_mode);

        Self {
            options,
            connect_timeout: Duration::from_secs(10),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<PgPool, ConnectorError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(ConnectorError::NotConnected)
    }

    fn bind_params<'q>(
        mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        params: &'q [Value],
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
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
}

/// Project a driver row into JSON, trying the common type decodings in order
pub(crate) fn pg_row_to_json(row: &PgRow) -> Row {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value: Value = if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(|n| json!(n)).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<i32>, _>(i) {
            v.map(|n| json!(n)).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(|n| json!(n)).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(i) {
            v.map(Value::Bool).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::DateTime<Utc>>, _>(i) {
            v.map(|t| Value::String(t.to_rfc3339())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(i) {
            v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<Value>, _>(i) {
            v.unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

#[async_trait]
impl Connector for PostgresConnector {
    fn db_type(&self) -> DbType {
        DbType::PostgreSql
    }

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<(), ConnectorError> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(self.connect_timeout)
            .connect_with(self.options.clone())
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;

        debug!("PostgreSQL pool established");
        *guard = Some(pool);
        Ok(())
    }

    async fn test_connection(&self) -> ProbeResult {
        let probe = async {
            self.connect().await?;
            let pool = self.pool().await?;
            sqlx::query("SELECT 1").fetch_one(&pool).await?;
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

        let rows = sqlx::query(
            r#"
            SELECT
                c.table_schema,
                c.table_name,
                c.column_name,
                c.data_type,
                c.is_nullable,
                c.column_default,
                (pk.column_name IS NOT NULL) AS is_primary_key
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT kcu.table_schema, kcu.table_name, kcu.column_name
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage kcu
                    ON tc.constraint_name = kcu.constraint_name
                    AND tc.table_schema = kcu.table_schema
                WHERE tc.constraint_type = 'PRIMARY KEY'
            ) pk
                ON pk.table_schema = c.table_schema
                AND pk.table_name = c.table_name
                AND pk.column_name = c.column_name
            WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY c.table_schema, c.table_name, c.ordinal_position
            "#,
        )
        .fetch_all(&pool)
        .await
        .map_err(|e| ConnectorError::DiscoveryFailed(e.to_string()))?;

        let mut tables: Vec<TableInfo> = Vec::new();
        for row in rows {
            let schema: String = row.try_get("table_schema")?;
            let table: String = row.try_get("table_name")?;
            let column = ColumnInfo {
                name: row.try_get("column_name")?,
                data_type: row.try_get("data_type")?,
                nullable: row.try_get::<String, _>("is_nullable")? == "YES",
                is_primary_key: row.try_get("is_primary_key")?,
                default_value: row.try_get("column_default")?,
            };

            match tables.last_mut() {
                Some(last) if last.schema == schema && last.table == table => {
                    last.columns.push(column)
                }
                _ => tables.push(TableInfo {
                    schema,
                    table,
                    columns: vec![column],
                }),
            }
        }

        Ok(tables)
    }

    #[instrument(skip(self, sql, params))]
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, ConnectorError> {
        let pool = self.pool().await?;
        let rows = Self::bind_params(sqlx::query(sql), params)
            .fetch_all(&pool)
            .await?;
        Ok(rows.iter().map(pg_row_to_json).collect())
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
                        batch.push(pg_row_to_json(&row));
                        if batch.len() == batch_size
                            && tx.send(Ok(std::mem::take(&mut batch))).await.is_err()
                        {
                            return; // receiver dropped, release the cursor
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
