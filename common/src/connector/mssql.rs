// SQL Server connector backed by tiberius

use super::{ColumnInfo, Connector, ProbeResult, Row, RowBatchStream, TableInfo};
use crate::errors::ConnectorError;
use crate::models::{DataSource, DbType};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{json, Value};
use tiberius::{AuthMethod, Client, ColumnData, Config, QueryItem, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, instrument};

type TdsClient = Client<Compat<TcpStream>>;

pub struct MssqlConnector {
    config: Config,
    addr: String,
    client: Mutex<Option<TdsClient>>,
}

/// Owned parameter value tiberius can bind positionally (`@P1..@Pn`)
enum TdsParam {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
}

impl ToSql for TdsParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            TdsParam::Null => ColumnData::String(None),
            TdsParam::Bool(b) => ColumnData::Bit(Some(*b)),
            TdsParam::I64(i) => ColumnData::I64(Some(*i)),
            TdsParam::F64(f) => ColumnData::F64(Some(*f)),
            TdsParam::Str(s) => ColumnData::String(Some(s.as_str().into())),
        }
    }
}

impl MssqlConnector {
    pub fn new(source: &DataSource, password: String) -> Self {
        let mut config = Config::new();
        config.host(&source.host);
        config.port(source.port);
        config.database(&source.database);
        config.authentication(AuthMethod::sql_server(&source.username, &password));
        if !source.ssl_enabled {
            config.trust_cert();
        }

        Self {
            config,
            addr: format!("{}:{}", source.host, source.port),
            client: Mutex::new(None),
        }
    }

    async fn open_client(config: Config, addr: &str) -> Result<TdsClient, ConnectorError> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))?;
        Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| ConnectorError::ConnectionFailed(e.to_string()))
    }

    fn to_params(params: &[Value]) -> Vec<TdsParam> {
        params
            .iter()
            .map(|value| match value {
                Value::Null => TdsParam::Null,
                Value::Bool(b) => TdsParam::Bool(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => TdsParam::I64(i),
                    None => TdsParam::F64(n.as_f64().unwrap_or(f64::NAN)),
                },
                Value::String(s) => TdsParam::Str(s.clone()),
                other => TdsParam::Str(other.to_string()),
            })
            .collect()
    }

    fn row_to_json(row: &tiberius::Row) -> Row {
        let mut out = Row::new();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name().to_string();
            let value: Value = if let Ok(v) = row.try_get::<&str, _>(i) {
                v.map(|s| Value::String(s.to_string())).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<i64, _>(i) {
                v.map(|n| json!(n)).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<i32, _>(i) {
                v.map(|n| json!(n)).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<f64, _>(i) {
                v.map(|n| json!(n)).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<bool, _>(i) {
                v.map(Value::Bool).unwrap_or(Value::Null)
            } else if let Ok(v) = row.try_get::<chrono::NaiveDateTime, _>(i) {
                v.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            out.insert(name, value);
        }
        out
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    fn db_type(&self) -> DbType {
        DbType::MsSql
    }

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<(), ConnectorError> {
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let client = Self::open_client(self.config.clone(), &self.addr).await?;
        debug!("SQL Server connection established");
        *guard = Some(client);
        Ok(())
    }

    async fn test_connection(&self) -> ProbeResult {
        let probe = async {
            let mut client = Self::open_client(self.config.clone(), &self.addr).await?;
            client
                .simple_query("SELECT 1")
                .await
                .map_err(|e| ConnectorError::ProbeFailed(e.to_string()))?
                .into_first_result()
                .await
                .map_err(|e| ConnectorError::ProbeFailed(e.to_string()))?;
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
                    c.TABLE_SCHEMA AS table_schema,
                    c.TABLE_NAME AS table_name,
                    c.COLUMN_NAME AS column_name,
                    c.DATA_TYPE AS data_type,
                    c.IS_NULLABLE AS is_nullable,
                    c.COLUMN_DEFAULT AS column_default,
                    CASE WHEN pk.COLUMN_NAME IS NULL THEN 0 ELSE 1 END AS is_primary_key
                FROM INFORMATION_SCHEMA.COLUMNS c
                LEFT JOIN (
                    SELECT kcu.TABLE_SCHEMA, kcu.TABLE_NAME, kcu.COLUMN_NAME
                    FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc
                    JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu
                        ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME
                        AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA
                    WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY'
                ) pk
                    ON pk.TABLE_SCHEMA = c.TABLE_SCHEMA
                    AND pk.TABLE_NAME = c.TABLE_NAME
                    AND pk.COLUMN_NAME = c.COLUMN_NAME
                WHERE c.TABLE_SCHEMA NOT IN ('sys', 'INFORMATION_SCHEMA')
                ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION
                "#,
                &[],
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
                is_primary_key: row["is_primary_key"].as_i64() == Some(1),
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
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(ConnectorError::NotConnected)?;

        let owned = Self::to_params(params);
        let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p as &dyn ToSql).collect();

        let rows = client
            .query(sql, &refs)
            .await
            .map_err(|e| ConnectorError::QueryFailed(e.to_string()))?
            .into_first_result()
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
        // Streaming runs on a dedicated connection so the shared client stays
        // free; the producer task owns the cursor end to end.
        let config = self.config.clone();
        let addr = self.addr.clone();
        let sql = sql.to_string();
        let owned = Self::to_params(params);
        let batch_size = batch_size.max(1);
        let (tx, rx) = tokio::sync::mpsc::channel(super::STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut client = match Self::open_client(config, &addr).await {
                Ok(client) => client,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p as &dyn ToSql).collect();
            let mut stream = match client.query(&sql, &refs).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(Err(ConnectorError::QueryFailed(e.to_string())))
                        .await;
                    return;
                }
            };

            let mut batch = Vec::with_capacity(batch_size);
            loop {
                match stream.try_next().await {
                    Ok(Some(QueryItem::Row(row))) => {
                        batch.push(Self::row_to_json(&row));
                        if batch.len() == batch_size
                            && tx.send(Ok(std::mem::take(&mut batch))).await.is_err()
                        {
                            return;
                        }
                    }
                    Ok(Some(QueryItem::Metadata(_))) => {}
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
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or(ConnectorError::NotConnected)?;

        let owned = Self::to_params(params);
        let refs: Vec<&dyn ToSql> = owned.iter().map(|p| p as &dyn ToSql).collect();

        let result = client
            .execute(sql, &refs)
            .await
            .map_err(|e| ConnectorError::QueryFailed(e.to_string()))?;

        Ok(result.total())
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.close().await;
        }
        Ok(())
    }
}
