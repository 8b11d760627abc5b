//! Attempt and Decision models for execution history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptId, TaskId, WorkerId};
use super::outcome::FailureReason;

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed { mutations: usize },
    Failed { failure: FailureReason },
}

/// A single executor call for a task.
///
/// Records which worker ran it, when, and how it ended. The mutations
/// themselves stay on the task record; this only keeps their count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub task_id: TaskId,
    pub worker_id: WorkerId,

    /// 1-based attempt number within the current batch.
    pub attempt: u32,

    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Completed { .. })
    }
}

/// A decision made after a failed attempt.
///
/// Records:
/// - What observation triggered it
/// - What policy was used
/// - What was decided (`schedule_retry`, `mark_failed`)
///
/// This enables "why did the system do X" explanations in the batch report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub task_id: TaskId,
    pub trigger: serde_json::Value,
    pub policy: String,
    pub decision: String,
    pub context: Option<serde_json::Value>,
    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        task_id: TaskId,
        trigger: serde_json::Value,
        policy: impl Into<String>,
        decision: impl Into<String>,
        context: Option<serde_json::Value>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            trigger,
            policy: policy.into(),
            decision: decision.into(),
            context,
            decided_at,
        }
    }
}
