#![forbid(unsafe_code)]

pub mod clock;
pub mod key;
pub mod queue;

pub use key::{QueryKey, QueryKeyHash, QueryKeyValue};
pub use queue::{
    AddedToQueue, ExecutionResult, Priority, ProcessingId, QueryDef, QueryStage, QueueEntry,
    QueueStageState, QueueStatus, RetrieveOutcome, StallOutcome, key_score,
};
