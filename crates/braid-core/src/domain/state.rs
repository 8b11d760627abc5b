//! TaskStatus と Deferred の理由
//!
//! # 状態遷移
//! - pending → ready: 依存が全て completed になった
//! - ready → dispatched → running → completed | failed
//! - failed → ready: retry（同じ worker に固定）、または batch rollback
//! - completed → ready: integration で差し戻された（rollback / conflict で負けた）
//! - pending | ready → deferred、dispatched → deferred（batch cancel のみ）
//! - deferred → ready: ブロック要因が解消した

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::{ArtifactId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Ready,
    Dispatched,
    Running,
    Completed,
    Failed,
    Deferred,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Dispatched,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Deferred,
    ];

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Deferred)
                | (Ready, Dispatched)
                | (Ready, Deferred)
                | (Dispatched, Running)
                | (Dispatched, Deferred)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Ready)
                | (Deferred, Ready)
                | (Completed, Ready)
        )
    }

    /// Dispatched or Running: an executor slot is held.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Ready => "Ready",
            TaskStatus::Dispatched => "Dispatched",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Deferred => "Deferred",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task sits in `Deferred`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferReason {
    /// No registered worker covers the task's tags.
    NoCapableWorker,
    /// A direct or transitive dependency failed permanently.
    FailedAncestor { ancestor: TaskId },
    /// A dependency had not completed when the batch ended.
    BlockedBy { dependency: TaskId },
    DependencyCycle,
    BatchCancelled,
    SupersededByHigherPriority { winner: TaskId, artifact: ArtifactId },
    ManualReviewRequired { artifact: ArtifactId },
    /// Lost a delete-versus-update conflict on `artifact`.
    DeleteConflict { winner: TaskId, artifact: ArtifactId },
}

impl DeferReason {
    /// Reasons that clear on their own when the next batch starts.
    ///
    /// `BlockedBy` clears through readiness instead, once the dependency completes.
    /// `FailedAncestor`, `DependencyCycle` and `ManualReviewRequired` need an operator.
    pub fn clears_at_next_batch(&self) -> bool {
        matches!(
            self,
            DeferReason::NoCapableWorker
                | DeferReason::BatchCancelled
                | DeferReason::SupersededByHigherPriority { .. }
                | DeferReason::DeleteConflict { .. }
        )
    }
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::NoCapableWorker => f.write_str("NoCapableWorker"),
            DeferReason::FailedAncestor { ancestor } => write!(f, "FailedAncestor({ancestor})"),
            DeferReason::BlockedBy { dependency } => write!(f, "BlockedBy({dependency})"),
            DeferReason::DependencyCycle => f.write_str("DependencyCycle"),
            DeferReason::BatchCancelled => f.write_str("BatchCancelled"),
            DeferReason::SupersededByHigherPriority { winner, artifact } => {
                write!(f, "SupersededByHigherPriority({winner} on {artifact})")
            }
            DeferReason::ManualReviewRequired { artifact } => {
                write!(f, "ManualReviewRequired({artifact})")
            }
            DeferReason::DeleteConflict { winner, artifact } => {
                write!(f, "DeleteConflict({winner} on {artifact})")
            }
        }
    }
}
