#![forbid(unsafe_code)]

mod sqlite;

pub use sqlite::{SqliteQueueConnection, SqliteQueueDriver};

use crate::StoreError;
use quarry_core::{
    AddedToQueue, ExecutionResult, ProcessingId, QueryDef, QueryKeyHash, QueueEntry,
    QueueStageState, RetrieveOutcome, StallOutcome,
};
use serde_json::{Map, Value};

#[derive(Clone, Debug)]
pub struct QueueDriverOptions {
    /// Namespace of the queue inside the shared store.
    pub queue: String,
    /// Maximum simultaneous active leases.
    pub concurrency: usize,
    pub heart_beat_timeout_ms: i64,
    /// How long a committed result stays readable by waiters.
    pub result_ttl_ms: i64,
}

#[derive(Clone, Debug)]
pub struct AddToQueueRequest {
    pub key_score: i64,
    pub query_key_hash: QueryKeyHash,
    pub orphaned_timeout_ms: i64,
    pub def: QueryDef,
    pub now_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    Stalled,
    Orphaned,
}

/// Produces connections to one shared queue store.
pub trait QueueDriver: Send + Sync {
    fn options(&self) -> &QueueDriverOptions;

    fn create_connection(&self) -> Result<Box<dyn QueueDriverConnection>, StoreError>;
}

/// Operations on the shared queue state. Each call is atomic with respect to every other
/// connection of every process sharing the store.
///
/// Calls that touch a leased key take the caller's [`ProcessingId`] and report a lost lease as
/// `false` (or the current holder) instead of an error.
pub trait QueueDriverConnection: Send {
    fn add_to_queue(&mut self, request: AddToQueueRequest) -> Result<AddedToQueue, StoreError>;

    /// Pending hashes, best score first.
    fn get_to_process_queries(&mut self) -> Result<Vec<QueryKeyHash>, StoreError>;

    fn get_active_queries(&mut self) -> Result<Vec<QueryKeyHash>, StoreError>;

    fn get_queue_size(&mut self) -> Result<usize, StoreError>;

    fn retrieve_for_processing(
        &mut self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        now_ms: i64,
    ) -> Result<RetrieveOutcome, StoreError>;

    fn update_heart_beat(
        &mut self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Shallow-merges `patch` into the stored definition if `processing_id` still holds the key.
    fn optimistic_query_update(
        &mut self,
        hash: &QueryKeyHash,
        patch: &Map<String, Value>,
        processing_id: ProcessingId,
    ) -> Result<bool, StoreError>;

    /// Removes a pending key. Active keys are left alone.
    fn cancel_query(&mut self, hash: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError>;

    fn set_result_and_remove_query(
        &mut self,
        hash: &QueryKeyHash,
        result: &ExecutionResult,
        processing_id: ProcessingId,
        now_ms: i64,
    ) -> Result<bool, StoreError>;

    /// Removes the key in whatever stage it is in.
    fn get_query_and_remove(&mut self, hash: &QueryKeyHash)
    -> Result<Option<QueryDef>, StoreError>;

    /// Returns the current holder when `processing_id` no longer owns the key. A requeued key
    /// gets a fresh orphan deadline counted from `now_ms`.
    fn free_processing_lock(
        &mut self,
        hash: &QueryKeyHash,
        processing_id: ProcessingId,
        activated: bool,
        now_ms: i64,
    ) -> Result<Option<ProcessingId>, StoreError>;

    fn get_stalled_queries(&mut self, now_ms: i64) -> Result<Vec<QueryKeyHash>, StoreError>;

    fn get_orphaned_queries(&mut self, now_ms: i64) -> Result<Vec<QueryKeyHash>, StoreError>;

    fn get_queries_to_cancel(
        &mut self,
        now_ms: i64,
    ) -> Result<Vec<(QueryKeyHash, CancelReason)>, StoreError>;

    /// Requeues a stalled key, or fails it once it has been reclaimed `retry_budget` times.
    fn reclaim_stalled(
        &mut self,
        hash: &QueryKeyHash,
        retry_budget: u32,
        now_ms: i64,
    ) -> Result<StallOutcome, StoreError>;

    fn get_query_stage_state(&mut self, only_keys: bool) -> Result<QueueStageState, StoreError>;

    fn get_queries(&mut self) -> Result<Vec<QueueEntry>, StoreError>;

    fn get_query_def(&mut self, hash: &QueryKeyHash) -> Result<Option<QueryDef>, StoreError>;

    fn get_result(
        &mut self,
        hash: &QueryKeyHash,
        now_ms: i64,
    ) -> Result<Option<ExecutionResult>, StoreError>;

    fn get_next_processing_id(&mut self) -> Result<ProcessingId, StoreError>;

    fn cleanup_results(&mut self, now_ms: i64) -> Result<usize, StoreError>;
}
