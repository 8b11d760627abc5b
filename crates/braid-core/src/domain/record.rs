//! IntegrationRecord: the durable result of integrating one batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ArtifactId, BatchId, TaskId};
use super::mutation::{ArtifactMutation, MutationFingerprint};
use super::state::DeferReason;

/// Conflict resolution rules, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    /// 1. A strictly higher priority wins.
    HigherPriority,
    /// 2. Create vs Create: manual review.
    CreateCollision,
    /// 3. Delete vs Update/Create: delete loses unless it clears the margin.
    DeleteVersusWrite,
    /// 4. Anything else: manual review.
    Unresolvable,
}

impl ConflictRule {
    pub fn number(self) -> u8 {
        match self {
            ConflictRule::HigherPriority => 1,
            ConflictRule::CreateCollision => 2,
            ConflictRule::DeleteVersusWrite => 3,
            ConflictRule::Unresolvable => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictLoser {
    pub task_id: TaskId,
    pub reason: DeferReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub artifact_id: ArtifactId,
    pub rule: ConflictRule,
    /// `None` when every contender was deferred.
    pub winner: Option<TaskId>,
    pub losers: Vec<ConflictLoser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedMutation {
    pub fingerprint: MutationFingerprint,
    pub mutation: ArtifactMutation,
    /// Artifact version after this mutation was applied.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredTask {
    pub task_id: TaskId,
    pub reason: DeferReason,
}

/// The apply failure that forced a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitFailure {
    pub task_id: TaskId,
    pub artifact_id: ArtifactId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub batch_id: BatchId,
    pub committed_mutations: Vec<CommittedMutation>,
    pub resolved_conflicts: Vec<ResolvedConflict>,
    pub deferred_tasks: Vec<DeferredTask>,

    /// Mutations skipped because the ledger already held them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub already_applied: Vec<MutationFingerprint>,

    /// Set when the apply phase failed and the batch was rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<CommitFailure>,

    /// True when this batch id had already been committed and nothing was done.
    #[serde(default)]
    pub replayed: bool,

    pub timestamp: DateTime<Utc>,
}

impl IntegrationRecord {
    pub fn empty(batch_id: BatchId, timestamp: DateTime<Utc>) -> Self {
        Self {
            batch_id,
            committed_mutations: Vec::new(),
            resolved_conflicts: Vec::new(),
            deferred_tasks: Vec::new(),
            already_applied: Vec::new(),
            rolled_back: None,
            replayed: false,
            timestamp,
        }
    }

    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back.is_some()
    }

    /// Tasks that ended up deferred by this integration.
    pub fn deferred_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.deferred_tasks.iter().map(|d| &d.task_id)
    }
}
