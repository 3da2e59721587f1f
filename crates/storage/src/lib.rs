#![forbid(unsafe_code)]

mod cache;
mod error;
mod queue;
mod schema;
mod support;

pub use cache::{CacheDriver, SqliteCacheDriver};
pub use error::StoreError;
pub use queue::{
    AddToQueueRequest, CancelReason, QueueDriver, QueueDriverConnection, QueueDriverOptions,
    SqliteQueueConnection, SqliteQueueDriver,
};
