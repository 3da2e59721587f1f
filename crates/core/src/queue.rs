#![forbid(unsafe_code)]

use crate::key::{QueryKey, QueryKeyHash};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MIN_PRIORITY: i32 = -10_000;
pub const MAX_PRIORITY: i32 = 10_000;

/// Width of the arrival-time band inside one priority level of a key score.
const SCORE_PRIORITY_STRIDE: i64 = 10_000_000_000_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    pub fn new(value: i32) -> Self {
        Self(value.clamp(MIN_PRIORITY, MAX_PRIORITY))
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

/// Ordering score of a pending key. Lower scores are served first: higher priority wins, then
/// earlier arrival.
pub fn key_score(priority: Priority, now_ms: i64) -> i64 {
    let band = i64::from(MAX_PRIORITY - priority.get());
    band * SCORE_PRIORITY_STRIDE + now_ms.clamp(0, SCORE_PRIORITY_STRIDE - 1)
}

/// Lease token minted per acquisition attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingId(i64);

impl ProcessingId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ProcessingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution payload stored alongside a queued key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDef {
    pub query_handler: String,
    pub query: Value,
    pub query_key: QueryKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_query_key: Option<Value>,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub added_to_queue_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_query_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Terminal outcome stored for a key: `{"result": ..}` or `{"error": ..}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionResult {
    Result(Value),
    Error(Value),
}

impl ExecutionResult {
    pub fn error_message(message: impl Into<String>) -> Self {
        Self::Error(Value::String(message.into()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddedToQueue {
    pub added: bool,
    pub query_key_hash: QueryKeyHash,
    pub queue_size: usize,
    pub added_to_queue_time: i64,
}

#[derive(Clone, Debug)]
pub struct RetrieveOutcome {
    pub lock_acquired: bool,
    pub active: Vec<QueryKeyHash>,
    pub pending_count: usize,
    pub def: Option<QueryDef>,
}

impl RetrieveOutcome {
    pub fn not_acquired(active: Vec<QueryKeyHash>, pending_count: usize) -> Self {
        Self {
            lock_acquired: false,
            active,
            pending_count,
            def: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    #[serde(rename = "toProcess")]
    Pending,
    #[serde(rename = "active")]
    Active,
}

impl QueueStatus {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "ACTIVE" => Some(Self::Active),
            _ => None,
        }
    }
}

/// Diagnostic row of the queue listing.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub query_key_hash: QueryKeyHash,
    pub status: QueueStatus,
    pub def: QueryDef,
    pub processing_id: Option<ProcessingId>,
    pub heartbeat_at_ms: Option<i64>,
    pub stall_count: u32,
}

#[derive(Clone, Debug, Default)]
pub struct QueueStageState {
    pub active: Vec<QueryKeyHash>,
    pub pending: Vec<QueryKeyHash>,
    pub defs: BTreeMap<QueryKeyHash, QueryDef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "camelCase")]
pub enum QueryStage {
    Executing { started_at: Option<i64> },
    Queued { position: usize },
}

impl std::fmt::Display for QueryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing { .. } => f.write_str("Executing query"),
            Self::Queued { position } => write!(f, "#{position} in queue"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StallOutcome {
    Requeued { attempt: u32 },
    Failed,
    /// The key completed or moved on before the reaper got to it.
    Gone,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn higher_priority_sorts_first_then_fifo() {
        let urgent_late = key_score(Priority::new(10), 2_000);
        let normal_early = key_score(Priority::new(0), 1_000);
        let normal_late = key_score(Priority::new(0), 1_500);
        assert!(urgent_late < normal_early);
        assert!(normal_early < normal_late);
    }

    #[test]
    fn priority_is_clamped() {
        assert_eq!(Priority::new(50_000).get(), MAX_PRIORITY);
        assert_eq!(Priority::new(-50_000).get(), MIN_PRIORITY);
        assert!(key_score(Priority::new(MIN_PRIORITY), i64::MAX) > 0);
    }

    #[test]
    fn execution_result_wire_shape() {
        let ok = ExecutionResult::Result(json!([{"a": 1}]));
        assert_eq!(serde_json::to_value(&ok).expect("encode"), json!({"result": [{"a": 1}]}));
        let err = ExecutionResult::error_message("boom");
        assert_eq!(serde_json::to_value(&err).expect("encode"), json!({"error": "boom"}));
    }

    #[test]
    fn query_def_keeps_unknown_fields() {
        let raw = json!({
            "queryHandler": "query",
            "query": {"sql": "SELECT 1"},
            "queryKey": {"value": "SELECT 1"},
            "priority": 0,
            "addedToQueueTime": 5,
            "progress": 0.5
        });
        let def: QueryDef = serde_json::from_value(raw).expect("decode");
        assert_eq!(def.extra.get("progress"), Some(&json!(0.5)));
        assert_eq!(def.start_query_time, None);
    }

    #[test]
    fn stage_renders_human_text() {
        assert_eq!(QueryStage::Queued { position: 3 }.to_string(), "#3 in queue");
        assert_eq!(
            QueryStage::Executing { started_at: None }.to_string(),
            "Executing query"
        );
    }
}
