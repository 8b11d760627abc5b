//! Domain model (IDs, tasks, statuses, mutations, outcomes, records).

pub mod attempt;
pub mod decision;
pub mod ids;
pub mod mutation;
pub mod outcome;
pub mod record;
pub mod source;
pub mod state;
pub mod task;

pub use attempt::{AttemptOutcome, AttemptRecord, DecisionRecord};
pub use decision::{Decider, Decision, DefaultDecider};
pub use ids::{ArtifactId, AttemptId, BatchId, CapabilityTag, TaskId, WorkerId};
pub use mutation::{ArtifactMutation, LinePatch, MutationFingerprint, MutationKind, Payload};
pub use outcome::{ExecutorFailure, FailureReason};
pub use record::{
    CommitFailure, CommittedMutation, ConflictLoser, ConflictRule, DeferredTask,
    IntegrationRecord, ResolvedConflict,
};
pub use source::SourceUnit;
pub use state::{DeferReason, TaskStatus};
pub use task::{InvalidScore, Score, Task};
