//! EventSink port - エンジンイベントの通知
//!
//! scheduler と engine は状態が変わるたびに `EngineEvent` を emit します。
//! 実装は `impls::event_sinks` にあります（tracing へのログ出力、channel への転送）。

use serde::Serialize;

use crate::domain::{
    BatchId, CommitFailure, DeferReason, FailureReason, ResolvedConflict, TaskId, WorkerId,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskDispatched {
        task: TaskId,
        worker: WorkerId,
        attempt: u32,
    },
    TaskStarted {
        task: TaskId,
        worker: WorkerId,
    },
    TaskCompleted {
        task: TaskId,
        worker: WorkerId,
        mutations: usize,
    },
    TaskFailed {
        task: TaskId,
        worker: WorkerId,
        failure: FailureReason,
        will_retry: bool,
    },
    TaskDeferred {
        task: TaskId,
        reason: DeferReason,
    },
    CancelRequested,
    ConflictResolved {
        conflict: ResolvedConflict,
    },
    BatchCommitted {
        batch: BatchId,
        mutations: usize,
    },
    BatchRolledBack {
        batch: BatchId,
        failure: CommitFailure,
    },
}

/// Receives engine events. Must not block: it is called from the scheduler loop.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}
