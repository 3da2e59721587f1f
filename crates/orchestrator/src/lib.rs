#![forbid(unsafe_code)]

mod cache;
mod config;
mod error;
mod handler;
mod lock;
pub mod observability;
mod pool;
mod queue;
mod worker;

pub use cache::{CachedQueryRequest, CachedQueryResult, QueryCache, QueryCacheOptions};
pub use config::{QueueConfig, env_var};
pub use error::OrchestratorError;
pub use handler::{
    ExecutionContext, QueryHandler, QueryHandlers, Row, SqlQueryHandler, SqliteWarehouse,
    WarehouseDriver,
};
pub use lock::{LockHandle, LockRelease, with_lock};
pub use queue::{ExecuteOptions, QueryOutcome, QueryQueue, ReapReport};
pub use worker::Worker;
