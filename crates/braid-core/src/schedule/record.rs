//! Task record: a task plus its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::{
    ArtifactMutation, BatchId, DeferReason, FailureReason, Task, TaskStatus, WorkerId,
};
use crate::error::BraidError;

/// The single source of truth for one task's state.
///
/// Every status change goes through [`TaskRecord::transition`], which rejects
/// anything outside the allowed state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<DeferReason>,

    /// Last failure (kept after a retry so the report can explain it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    /// Worker chosen by the router. Retries reuse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,

    /// Executor calls in the current batch (including one in flight).
    #[serde(default)]
    pub attempts: u32,

    /// Mutations produced by the last successful attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result: Vec<ArtifactMutation>,

    /// Retry backoff: not dispatched before this instant.
    #[serde(skip)]
    pub not_before: Option<Instant>,

    /// Batch whose IntegrationRecord committed this task. Archived tasks are never re-run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_in: Option<BatchId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        let now = Utc::now();
        Self {
            task,
            status: TaskStatus::Pending,
            deferred: None,
            failure: None,
            worker: None,
            attempts: 0,
            result: Vec::new(),
            not_before: None,
            archived_in: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_in.is_some()
    }

    pub fn transition(&mut self, next: TaskStatus) -> Result<(), BraidError> {
        if !self.status.can_transition_to(next) {
            return Err(BraidError::InvalidTransition {
                task: self.task.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next != TaskStatus::Deferred {
            self.deferred = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pending/Deferred → Ready.
    pub fn mark_ready(&mut self) -> Result<(), BraidError> {
        self.transition(TaskStatus::Ready)
    }

    pub fn defer(&mut self, reason: DeferReason) -> Result<(), BraidError> {
        self.transition(TaskStatus::Deferred)?;
        self.deferred = Some(reason);
        Ok(())
    }

    /// Ready → Dispatched: a slot on `worker` is held from here on.
    pub fn mark_dispatched(&mut self, worker: WorkerId) -> Result<(), BraidError> {
        self.transition(TaskStatus::Dispatched)?;
        self.worker = Some(worker);
        self.attempts += 1;
        self.not_before = None;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), BraidError> {
        self.transition(TaskStatus::Running)
    }

    pub fn mark_completed(&mut self, result: Vec<ArtifactMutation>) -> Result<(), BraidError> {
        self.transition(TaskStatus::Completed)?;
        self.result = result;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: FailureReason) -> Result<(), BraidError> {
        self.transition(TaskStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Failed → Ready on the same worker, not before `not_before`.
    pub fn schedule_retry(&mut self, not_before: Instant) -> Result<(), BraidError> {
        self.transition(TaskStatus::Ready)?;
        self.not_before = Some(not_before);
        Ok(())
    }

    /// Completed/Failed → Ready after the integrator reverted the batch.
    ///
    /// The routing decision and attempt count start over.
    pub fn reopen(&mut self) -> Result<(), BraidError> {
        self.transition(TaskStatus::Ready)?;
        self.result.clear();
        self.worker = None;
        self.attempts = 0;
        self.not_before = None;
        Ok(())
    }

    pub fn archive(&mut self, batch: BatchId) {
        self.archived_in = Some(batch);
        self.updated_at = Utc::now();
    }
}
