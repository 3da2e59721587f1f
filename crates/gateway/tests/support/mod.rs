#![allow(dead_code)]

use async_trait::async_trait;
use quarry_gateway::{
    ApiGateway, AppState, Authenticator, LocalSubscriptionStore, MessageSink, SchemaCompiler,
    SubscriptionServer, WsHub,
};
use quarry_orchestrator::{
    QueryCache, QueryCacheOptions, QueryHandlers, QueryQueue, QueueConfig, SqlQueryHandler,
    SqliteWarehouse,
};
use quarry_storage::{SqliteCacheDriver, SqliteQueueDriver};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SECRET: &str = "test-secret";

pub fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("quarry_gateway_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn seed_warehouse(dir: &Path) -> PathBuf {
    let path = dir.join("warehouse.db");
    let conn = rusqlite::Connection::open(&path).expect("open warehouse");
    conn.execute_batch(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, status TEXT, amount REAL, created_at TEXT);
         INSERT INTO orders VALUES (1, 'shipped', 10.0, '2024-01-05 10:00:00');
         INSERT INTO orders VALUES (2, 'shipped', 15.0, '2024-01-05 12:00:00');
         INSERT INTO orders VALUES (3, 'processing', 7.5, '2024-01-06 09:30:00');",
    )
    .expect("seed warehouse");
    path
}

fn schema() -> Value {
    json!({
        "cubes": [{
            "name": "orders",
            "sql": "orders",
            "measures": [
                {"name": "count", "type": "count"},
                {"name": "amount", "sql": "amount", "type": "sum"}
            ],
            "dimensions": [
                {"name": "id", "sql": "id", "type": "number", "primaryKey": true},
                {"name": "status", "sql": "status", "type": "string"},
                {"name": "createdAt", "sql": "created_at", "type": "time"}
            ]
        }]
    })
}

pub fn build_gateway(test_name: &str, production: bool) -> ApiGateway {
    let dir = temp_dir(test_name);
    let warehouse = seed_warehouse(&dir);
    let config = QueueConfig {
        heart_beat_interval: Duration::from_millis(200),
        heart_beat_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
        ..QueueConfig::default()
    };
    let driver = SqliteQueueDriver::open(&dir, config.driver_options("default"))
        .expect("open queue driver");
    let mut handlers = QueryHandlers::new();
    handlers.insert(
        SqlQueryHandler::NAME.to_string(),
        Arc::new(SqlQueryHandler::new(Arc::new(SqliteWarehouse::new(
            warehouse,
        )))),
    );
    let queue = QueryQueue::new("default", Arc::new(driver), config, handlers).expect("queue");
    let cache = QueryCache::new(
        "default",
        queue,
        Arc::new(SqliteCacheDriver::open(&dir).expect("cache driver")),
        QueryCacheOptions::default(),
    );
    let compiler = Arc::new(SchemaCompiler::from_value(schema()).expect("schema"));
    ApiGateway::new(
        "/cubejs-api",
        Authenticator::new(SECRET, production),
        compiler.clone(),
        compiler,
        cache,
    )
}

pub fn app_state(test_name: &str, production: bool) -> AppState {
    let gateway = build_gateway(test_name, production);
    let hub = Arc::new(WsHub::new());
    let store = Arc::new(LocalSubscriptionStore::new(Duration::from_secs(60)));
    let subscriptions = SubscriptionServer::new(gateway.clone(), store, hub.clone());
    AppState {
        gateway,
        subscriptions,
        hub,
    }
}

pub fn token() -> String {
    Authenticator::new(SECRET, true)
        .sign(&json!({"u": {"id": 42}}))
        .expect("sign token")
}

/// Captures outbound subscription messages in order.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.messages.lock().expect("sink lock"))
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, connection_id: &str, message: Value) {
        self.messages
            .lock()
            .expect("sink lock")
            .push((connection_id.to_string(), message));
    }
}
