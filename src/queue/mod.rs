//! Durable task queue with priority lanes, retries, dead-letter storage,
//! and generation fencing

mod queue;
pub mod task;

pub use queue::{
    QueueError, QueueStats, RecoverOutcome, TaskFilter, TaskQueue, TaskQueueHandle,
};
pub use task::{
    CompletionOutcome, FailureOutcome, HistoryEntry, SubmitParams, Task, TaskStatus,
    TransitionError,
};
