// MySQL connector backed by mysql_async

use super::{ColumnInfo, Connector, ProbeResult, Row, RowBatchStream, TableInfo};
use crate::errors::ConnectorError;
use crate::models::{DataSource, DbType};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, OptsBuilder, Params, Pool};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

pub struct MySqlConnector {
    opts: Opts,
    database: String,
    pool: RwLock<Option<Pool>>,
}

impl MySqlConnector {
    pub fn new(source: &DataSource, password: String) -> Self {
        let builder = OptsBuilder::default()
            .ip_or_hostname(source.host.clone())
            .tcp_port(source.port)
            .db_name(Some(source.database.clone()))
            .user(Some(source.username.clone()))
            .pass(Some(password));

        Self {
            opts: Opts::from(builder),
            database: source.database.clone(),
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<Pool, ConnectorError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(ConnectorError::NotConnected)
    }

    fn to_params(params: &[Value]) -> Params {
        if params.is_empty() {
            return Params::Empty;
        }
        Params::Positional(params.iter().map(Self::to_mysql_value).collect())
    }

    fn to_mysql_value(value: &Value) -> mysql_async::Value {
        match value {
            Value::Null => mysql_async::Value::NULL,
            Value::Bool(b) => mysql_async::Value::from(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => mysql_async::Value::from(i),
                None => mysql_async::Value::from(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => mysql_async::Value::from(s.clone()),
            other => mysql_async::Value::from(other.to_string()),
        }
    }

    fn row_to_json(row: &mysql_async::Row) -> Row {
        let mut out = Row::new();
        for (i, column) in row.columns_ref().iter().enumerate() {
            let name = column.name_str().to_string();
            let value: Value = match row.as_ref(i) {
                None | Some(mysql_async::Value::NULL) => Value::Null,
                Some(mysql_async::Value::Bytes(bytes)) => {
                    Value::String(String::from_utf8_lossy(bytes).into_owned())
                }
                Some(mysql_async::Value::Int(n)) => json!(n),
                Some(mysql_async::Value::UInt(n)) => json!(n),
                Some(mysql_async::Value::Float(f)) => json!(f),
                Some(mysql_async::Value::Double(d)) => json!(d),
                Some(mysql_async::Value::Date(y, mo, d, h, mi, s, _us)) => Value::String(
                    format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, mo, d, h, mi, s),
                ),
                Some(mysql_async::Value::Time(neg, d, h, mi, s, _us)) => {
                    let sign = if *neg { "-" } else { "" };
                    Value::String(format!("{}{:02}:{:02}:{:02}", sign, d * 24 + *h as u32, mi, s))
                }
            };
            out.insert(name, value);
        }
        out
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn db_type(&self) -> DbType {
        DbType::MySql
    }

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<(), ConnectorError> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = Pool::new(self.opts.clone());
        // Pool creation is lazy; pull one connection to surface failures now
        pool.get_conn()
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;

        debug!("MySQL pool established");
        *guard = Some(pool);
        Ok(())
    }

    async fn test_connection(&self) -> ProbeResult {
        let probe = async {
            self.connect().await?;
            let pool = self.pool().await?;
            let mut conn = pool
                .get_conn()
                .await
                .map_err(|e| ConnectorError::ProbeFailed(e.to_string()))?;
            conn.query_drop("SELECT 1")
                .await
                .map_err(|e| ConnectorError::ProbeFailed(e.to_string()))?;
            drop(conn);
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
        let rows = self
            .query(
                r#"
                SELECT
                    TABLE_SCHEMA AS table_schema,
                    TABLE_NAME AS table_name,
                    COLUMN_NAME AS column_name,
                    DATA_TYPE AS data_type,
                    IS_NULLABLE AS is_nullable,
                    COLUMN_DEFAULT AS column_default,
                    COLUMN_KEY AS column_key
                FROM information_schema.COLUMNS
                WHERE TABLE_SCHEMA = ?
                ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION
                "#,
                &[Value::String(self.database.clone())],
            )
            .await
            .map_err(|e| ConnectorError::DiscoveryFailed(e.to_string()))?;

        let mut tables: Vec<TableInfo> = Vec::new();
        for row in rows {
            let schema = row["table_schema"].as_str().unwrap_or_default().to_string();
            let table = row["table_name"].as_str().unwrap_or_default().to_string();
            let column = ColumnInfo {
                name: row["column_name"].as_str().unwrap_or_default().to_string(),
                data_type: row["data_type"].as_str().unwrap_or_default().to_string(),
                nullable: row["is_nullable"].as_str() == Some("YES"),
                is_primary_key: row["column_key"].as_str() == Some("PRI"),
                default_value: row["column_default"].as_str().map(|s| s.to_string()),
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
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| ConnectorError::QueryFailed(e.to_string()))?;

        let rows: Vec<mysql_async::Row> = conn
            .exec(sql, Self::to_params(params))
            .await
            .map_err(|e| ConnectorError::QueryFailed(e.to_string()))?;

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
        let params = Self::to_params(params);
        let batch_size = batch_size.max(1);
        let (tx, rx) = tokio::sync::mpsc::channel(super::STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut conn = match pool.get_conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    let _ = tx
                        .send(Err(ConnectorError::QueryFailed(e.to_string())))
                        .await;
                    return;
                }
            };

            let mut result = match conn.exec_iter(sql, params).await {
                Ok(result) => result,
                Err(e) => {
                    let _ = tx
                        .send(Err(ConnectorError::QueryFailed(e.to_string())))
                        .await;
                    return;
                }
            };

            let mut batch = Vec::with_capacity(batch_size);
            loop {
                match result.next().await {
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
                        let _ = tx
                            .send(Err(ConnectorError::QueryFailed(e.to_string())))
                            .await;
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
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| ConnectorError::QueryFailed(e.to_string()))?;

        let result = conn
            .exec_iter(sql, Self::to_params(params))
            .await
            .map_err(|e| ConnectorError::QueryFailed(e.to_string()))?;
        let affected = result.affected_rows();
        drop(result);

        Ok(affected)
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.disconnect()
                .await
                .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }
}
