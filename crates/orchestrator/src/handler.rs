#![forbid(unsafe_code)]

use crate::OrchestratorError;
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use quarry_core::{ProcessingId, QueryKeyHash};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type Row = Map<String, Value>;

/// Everything a running handler may touch besides its payload.
#[derive(Clone)]
pub struct ExecutionContext {
    pub cancel: CancellationToken,
    pub query_key_hash: QueryKeyHash,
    pub processing_id: ProcessingId,
    pool: Arc<ConnectionPool>,
}

impl ExecutionContext {
    pub(crate) fn new(
        cancel: CancellationToken,
        query_key_hash: QueryKeyHash,
        processing_id: ProcessingId,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            cancel,
            query_key_hash,
            processing_id,
            pool,
        }
    }

    /// Merges `patch` into the stored query definition.
    ///
    /// Returns `false` and cancels the execution when the lease has moved to another worker.
    pub async fn report_progress(&self, patch: Map<String, Value>) -> Result<bool, OrchestratorError> {
        let hash = self.query_key_hash.clone();
        let processing_id = self.processing_id;
        let applied = self
            .pool
            .run(move |conn| conn.optimistic_query_update(&hash, &patch, processing_id))
            .await?;
        if !applied {
            self.cancel.cancel();
        }
        Ok(applied)
    }
}

#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn execute(&self, query: Value, ctx: ExecutionContext) -> Result<Value, OrchestratorError>;
}

pub type QueryHandlers = HashMap<String, Arc<dyn QueryHandler>>;

/// Warehouse collaborator: runs one SQL statement and returns its rows.
#[async_trait]
pub trait WarehouseDriver: Send + Sync {
    async fn query(
        &self,
        sql: &str,
        values: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>, OrchestratorError>;
}

#[derive(Debug, Deserialize)]
struct SqlPayload {
    query: String,
    #[serde(default)]
    values: Vec<Value>,
}

/// The `query` handler: `{"query": sql, "values": [...]}` executed against a warehouse.
pub struct SqlQueryHandler {
    driver: Arc<dyn WarehouseDriver>,
}

impl SqlQueryHandler {
    pub const NAME: &'static str = "query";

    pub fn new(driver: Arc<dyn WarehouseDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl QueryHandler for SqlQueryHandler {
    async fn execute(&self, query: Value, ctx: ExecutionContext) -> Result<Value, OrchestratorError> {
        let payload: SqlPayload = serde_json::from_value(query)
            .map_err(|err| OrchestratorError::Warehouse(format!("malformed query payload: {err}")))?;
        let rows = self
            .driver
            .query(&payload.query, &payload.values, &ctx.cancel)
            .await?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }
}

/// Read-only SQLite database used as a warehouse.
#[derive(Clone, Debug)]
pub struct SqliteWarehouse {
    path: PathBuf,
}

impl SqliteWarehouse {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WarehouseDriver for SqliteWarehouse {
    async fn query(
        &self,
        sql: &str,
        values: &[Value],
        cancel: &CancellationToken,
    ) -> Result<Vec<Row>, OrchestratorError> {
        let path = self.path.clone();
        let sql = sql.to_string();
        let values = values.iter().map(json_to_sql).collect::<Vec<_>>();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || run_sqlite_query(&path, &sql, values, &cancel)).await?
    }
}

fn run_sqlite_query(
    path: &Path,
    sql: &str,
    values: Vec<SqlValue>,
    cancel: &CancellationToken,
) -> Result<Vec<Row>, OrchestratorError> {
    let warehouse = |err: rusqlite::Error| OrchestratorError::Warehouse(err.to_string());

    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled);
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(warehouse)?;
    let mut stmt = conn.prepare(sql).map_err(warehouse)?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut rows = stmt.query(params_from_iter(values)).map_err(warehouse)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(warehouse)? {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let mut record = Map::new();
        for (index, name) in columns.iter().enumerate() {
            let value = row.get_ref(index).map_err(warehouse)?;
            record.insert(name.clone(), sql_to_json(value));
        }
        out.push(record);
    }
    Ok(out)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db(test_name: &str) -> PathBuf {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!(
            "quarry_warehouse_{test_name}_{}_{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let path = dir.join("warehouse.db");
        let conn = Connection::open(&path).expect("open warehouse");
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER, status TEXT, amount REAL);
             INSERT INTO orders VALUES (1, 'shipped', 10.5), (2, 'pending', 3.0), (3, 'shipped', 1.5);",
        )
        .expect("seed warehouse");
        path
    }

    #[tokio::test]
    async fn sqlite_warehouse_binds_values_and_names_columns() {
        let warehouse = SqliteWarehouse::new(temp_db("binds"));
        let rows = warehouse
            .query(
                "SELECT status AS orders__status, SUM(amount) AS orders__amount \
                 FROM orders WHERE status = ? GROUP BY status",
                &[json!("shipped")],
                &CancellationToken::new(),
            )
            .await
            .expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("orders__status"), Some(&json!("shipped")));
        assert_eq!(rows[0].get("orders__amount"), Some(&json!(12.0)));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_execution() {
        let warehouse = SqliteWarehouse::new(temp_db("cancelled"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = warehouse
            .query("SELECT * FROM orders", &[], &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}
