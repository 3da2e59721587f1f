#![forbid(unsafe_code)]

use quarry_storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unknown query handler: {0}")]
    UnknownHandler(String),
    #[error("Query execution timeout after {0} seconds")]
    Timeout(u64),
    #[error("Query cancelled")]
    Cancelled,
    #[error("{0}")]
    Warehouse(String),
    #[error("invalid config: {0}")]
    Config(&'static str),
}
