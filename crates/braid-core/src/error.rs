use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    ArtifactId, BatchId, CapabilityTag, ExecutorFailure, TaskId, TaskStatus, WorkerId,
};

/// A source unit (or one item inside it) that could not become a Task.
///
/// Skip-and-report: the rest of the intake carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("{origin}: source unit is empty")]
    EmptyUnit { origin: String },

    #[error("{origin}: item has no title")]
    MissingTitle { origin: String },

    #[error("{origin}: no capability tag could be assigned to \"{title}\"")]
    NoCapabilityTags { origin: String, title: String },

    #[error("{origin}: invalid {field} score \"{value}\" (expected 1..=5)")]
    InvalidScore {
        origin: String,
        field: &'static str,
        value: String,
    },

    #[error("{origin}: task id \"{id}\" is already in use")]
    DuplicateId { origin: String, id: TaskId },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no worker covers the tags {tags:?} of task {task}")]
    NoCapableWorker {
        task: TaskId,
        tags: Vec<CapabilityTag>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("task {task} timed out after {after:?}")]
    Timeout { task: TaskId, after: Duration },

    #[error("task {task} failed: {failure}")]
    ExecutorFailure {
        task: TaskId,
        failure: ExecutorFailure,
    },
}

/// Reasons a single mutation cannot be applied to the artifact store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("{artifact}: mutation is based on version {base} but the artifact is at {current}")]
    StaleBase {
        artifact: ArtifactId,
        base: u64,
        current: u64,
    },

    #[error("{artifact}: already exists")]
    AlreadyExists { artifact: ArtifactId },

    #[error("{artifact}: does not exist")]
    Missing { artifact: ArtifactId },

    #[error("{artifact}: patch {start}..{end} is outside the artifact's {len} lines")]
    PatchOutOfRange {
        artifact: ArtifactId,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("{artifact}: cannot line-patch structured content")]
    PatchOnStructured { artifact: ArtifactId },
}

/// Fatal to the batch: the apply phase failed and everything was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("commit of batch {batch} failed on a mutation from task {task}: {source}")]
pub struct CommitError {
    pub batch: BatchId,
    pub task: TaskId,
    #[source]
    pub source: ApplyError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),

    #[error("worker {0} must allow at least one concurrent task")]
    ZeroCapacity(WorkerId),

    #[error("worker {0} declares no capabilities")]
    NoCapabilities(WorkerId),
}

/// Startup validation failures (fail-fast before any batch runs).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("Missing executors for workers: {0:?}. These workers are registered but nothing can run their tasks.")]
    MissingExecutors(Vec<WorkerId>),

    #[error("executor bound to unknown worker {0}")]
    UnknownWorker(WorkerId),

    #[error("duplicate executor for worker {0}")]
    DuplicateExecutor(WorkerId),
}

#[derive(Debug, Error)]
pub enum BraidError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("conflict on {artifact} needs manual review (tasks: {tasks:?})")]
    ConflictUnresolvable {
        artifact: ArtifactId,
        tasks: Vec<TaskId>,
    },

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("task {task}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("task {0} already exists")]
    DuplicateTask(TaskId),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BraidError {
    /// Short category used in batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BraidError::Classification(_) => "classification",
            BraidError::Routing(_) => "routing",
            BraidError::Execution(ExecutionError::Timeout { .. }) => "timeout",
            BraidError::Execution(ExecutionError::ExecutorFailure { .. }) => "executor_failure",
            BraidError::ConflictUnresolvable { .. } => "conflict_unresolvable",
            BraidError::Commit(_) => "commit",
            BraidError::Registry(_) | BraidError::Build(_) | BraidError::Config(_) => "config",
            BraidError::Toml(_) => "config",
            BraidError::InvalidTransition { .. } | BraidError::UnknownTask(_) => "state",
            BraidError::DuplicateTask(_) => "state",
            BraidError::Io(_) => "io",
        }
    }
}

/// An error as it appears in the batch report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub message: String,
}

impl ReportedError {
    pub fn new(task_id: Option<TaskId>, error: &BraidError) -> Self {
        Self {
            kind: error.kind().to_string(),
            task_id,
            message: error.to_string(),
        }
    }
}
