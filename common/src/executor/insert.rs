// Batched parameterized inserts into the target table

use crate::connector::{placeholder, Connector};
use crate::errors::ConnectorError;
use crate::models::DbType;
use crate::scrape::ExtractedRow;
use serde_json::Value;
use tracing::warn;

/// Rows per progress update
pub const INSERT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct InsertTotals {
    pub inserted: u64,
    pub failed: u64,
}

/// Quote an identifier the way the dialect expects
pub fn quote_ident(db_type: DbType, ident: &str) -> String {
    match db_type {
        DbType::PostgreSql | DbType::Sqlite => format!("\"{}\"", ident),
        DbType::MySql => format!("`{}`", ident),
        DbType::MsSql => format!("[{}]", ident),
    }
}

/// Qualified table name; SQLite has no schemas and MySQL's schema is the
/// database itself
pub fn qualified_table(db_type: DbType, schema: &str, table: &str) -> String {
    if schema.is_empty() || matches!(db_type, DbType::Sqlite) {
        quote_ident(db_type, table)
    } else {
        format!(
            "{}.{}",
            quote_ident(db_type, schema),
            quote_ident(db_type, table)
        )
    }
}

/// Compose `INSERT INTO <table> (cols) VALUES (placeholders)` for a dialect
pub fn build_insert_sql(
    db_type: DbType,
    schema: &str,
    table: &str,
    columns: &[String],
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(db_type, c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|n| placeholder(db_type, n))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified_table(db_type, schema, table),
        column_list,
        placeholders
    )
}

/// Positional parameters for one row, in column order; absent keys bind null
pub fn row_params(columns: &[String], row: &ExtractedRow) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Insert one batch row by row, so a bad row only costs itself
pub async fn insert_batch(
    connector: &dyn Connector,
    sql: &str,
    columns: &[String],
    batch: &[ExtractedRow],
) -> InsertTotals {
    let mut totals = InsertTotals::default();
    for row in batch {
        let params = row_params(columns, row);
        match connector.exec(sql, &params).await {
            Ok(_) => totals.inserted += 1,
            Err(e) => {
                totals.failed += 1;
                warn!(error = %e, "row insert failed");
            }
        }
    }
    totals
}

/// Insert all rows in batches; the callback sees cumulative totals after
/// every batch so callers can persist running progress.
pub async fn insert_rows<F>(
    connector: &dyn Connector,
    schema: &str,
    table: &str,
    columns: &[String],
    rows: &[ExtractedRow],
    mut on_batch: F,
) -> Result<InsertTotals, ConnectorError>
where
    F: FnMut(InsertTotals),
{
    let sql = build_insert_sql(connector.db_type(), schema, table, columns);
    let mut totals = InsertTotals::default();

    for batch in rows.chunks(INSERT_BATCH_SIZE) {
        let batch_totals = insert_batch(connector, &sql, columns, batch).await;
        totals.inserted += batch_totals.inserted;
        totals.failed += batch_totals.failed;
        on_batch(totals);
    }

    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_insert_sql_per_dialect() {
        let cols = columns(&["name", "price"]);
        assert_eq!(
            build_insert_sql(DbType::PostgreSql, "public", "products", &cols),
            r#"INSERT INTO "public"."products" ("name", "price") VALUES ($1, $2)"#
        );
        assert_eq!(
            build_insert_sql(DbType::MySql, "shop", "products", &cols),
            "INSERT INTO `shop`.`products` (`name`, `price`) VALUES (?, ?)"
        );
        assert_eq!(
            build_insert_sql(DbType::MsSql, "dbo", "products", &cols),
            "INSERT INTO [dbo].[products] ([name], [price]) VALUES (@P1, @P2)"
        );
        assert_eq!(
            build_insert_sql(DbType::Sqlite, "public", "products", &cols),
            r#"INSERT INTO "products" ("name", "price") VALUES (?, ?)"#
        );
    }

    #[test]
    fn test_row_params_order_and_missing_keys() {
        let cols = columns(&["name", "price", "absent"]);
        let mut row = ExtractedRow::new();
        row.insert("price".to_string(), json!(2.5));
        row.insert("name".to_string(), json!("Widget"));

        let params = row_params(&cols, &row);
        assert_eq!(params, vec![json!("Widget"), json!(2.5), Value::Null]);
    }

    #[tokio::test]
    async fn test_insert_batch_failure_accounting() {
        use crate::connector::MockConnector;
        use crate::errors::ConnectorError;

        let mut connector = MockConnector::new();
        connector
            .expect_db_type()
            .return_const(DbType::PostgreSql);
        connector.expect_exec().returning(|_sql, params| {
            // the row binding null into the first column is rejected
            if params.first() == Some(&Value::Null) {
                Err(ConnectorError::QueryFailed("null violation".to_string()))
            } else {
                Ok(1)
            }
        });

        let cols = columns(&["name"]);
        let rows: Vec<ExtractedRow> = [json!("a"), Value::Null, json!("c")]
            .into_iter()
            .map(|v| {
                let mut row = ExtractedRow::new();
                row.insert("name".to_string(), v);
                row
            })
            .collect();

        let sql = build_insert_sql(connector.db_type(), "public", "t", &cols);
        let totals = insert_batch(&connector, &sql, &cols, &rows).await;
        assert_eq!(totals.inserted, 2);
        assert_eq!(totals.failed, 1);
    }

    #[tokio::test]
    async fn test_insert_rows_counts_failures() {
        use crate::connector::SqliteConnector;

        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::from_path(dir.path().join("t.db"));
        connector.connect().await.unwrap();
        connector
            .exec("CREATE TABLE items (name TEXT NOT NULL, qty INTEGER)", &[])
            .await
            .unwrap();

        let cols = columns(&["name", "qty"]);
        let rows: Vec<ExtractedRow> = vec![
            [("name", json!("a")), ("qty", json!(1))],
            [("name", json!(null)), ("qty", json!(2))], // violates NOT NULL
            [("name", json!("c")), ("qty", json!(3))],
        ]
        .into_iter()
        .map(|pairs| {
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect()
        })
        .collect();

        let mut batches = 0;
        let totals = insert_rows(&connector, "", "items", &cols, &rows, |_| batches += 1)
            .await
            .unwrap();

        assert_eq!(totals.inserted, 2);
        assert_eq!(totals.failed, 1);
        assert_eq!(batches, 1);
        connector.disconnect().await.unwrap();
    }
}
