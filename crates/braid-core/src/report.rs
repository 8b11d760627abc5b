//! Batch report and status snapshot.
//!
//! Both are plain data (serde) so the CLI can print them as JSON; the text
//! rendering is what `braid run-batch` and `braid status` show by default.

use std::fmt::{self, Write as _};

use serde::Serialize;

use crate::classify::ClassificationWarning;
use crate::domain::{
    BatchId, CommitFailure, CommittedMutation, DeferReason, ResolvedConflict, TaskId, TaskStatus,
};
use crate::error::ReportedError;
use crate::priority::Priority;
use crate::routing::WorkerLoad;
use crate::schedule::{StatusCounts, TaskBoard, TaskRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// Everything that ran was committed; nothing failed or was deferred.
    Clean,
    /// The batch committed, but some tasks failed, were deferred or reported errors.
    Partial,
    /// The apply phase failed and the whole batch was rolled back.
    Fatal,
}

impl BatchOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            BatchOutcome::Clean => 0,
            BatchOutcome::Partial => 1,
            BatchOutcome::Fatal => 2,
        }
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchOutcome::Clean => "clean",
            BatchOutcome::Partial => "partial",
            BatchOutcome::Fatal => "fatal",
        })
    }
}

/// A task still waiting for a later batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemainingTask {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeferReason>,
}

impl From<&TaskRecord> for RemainingTask {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task.id.clone(),
            title: record.task.title.clone(),
            status: record.status,
            priority: record.task.priority(),
            reason: record.deferred.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub outcome: BatchOutcome,

    /// Tasks dispatched at least once in this batch.
    pub processed: usize,
    /// Tasks whose result was committed.
    pub completed: usize,
    pub failed: usize,
    /// Tasks that ended the batch in Deferred.
    pub deferred: usize,

    pub committed: Vec<CommittedMutation>,
    pub conflicts: Vec<ResolvedConflict>,
    pub errors: Vec<ReportedError>,
    pub warnings: Vec<ClassificationWarning>,

    /// Ready and Deferred tasks in priority order.
    pub remaining: Vec<RemainingTask>,

    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back: Option<CommitFailure>,
}

impl BatchReport {
    pub fn outcome_for(rolled_back: bool, failed: usize, deferred: usize, errors: usize) -> BatchOutcome {
        if rolled_back {
            BatchOutcome::Fatal
        } else if failed > 0 || deferred > 0 || errors > 0 {
            BatchOutcome::Partial
        } else {
            BatchOutcome::Clean
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "batch {} ({})", self.batch_id, self.outcome);
        if self.cancelled {
            let _ = writeln!(out, "  cancelled by operator");
        }
        let _ = writeln!(
            out,
            "  processed {}  completed {}  failed {}  deferred {}",
            self.processed, self.completed, self.failed, self.deferred
        );

        if let Some(failure) = &self.rolled_back {
            let _ = writeln!(
                out,
                "  rolled back: {} on {}: {}",
                failure.task_id, failure.artifact_id, failure.error
            );
        }

        if !self.committed.is_empty() {
            let _ = writeln!(out, "committed:");
            for c in &self.committed {
                let _ = writeln!(
                    out,
                    "  {} {:?} -> v{}",
                    c.mutation.artifact_id, c.mutation.kind, c.version
                );
            }
        }

        if !self.conflicts.is_empty() {
            let _ = writeln!(out, "conflicts:");
            for conflict in &self.conflicts {
                let winner = conflict
                    .winner
                    .as_ref()
                    .map_or_else(|| "none".to_string(), ToString::to_string);
                let _ = writeln!(
                    out,
                    "  {} rule {} ({:?}) winner {}",
                    conflict.artifact_id,
                    conflict.rule.number(),
                    conflict.rule,
                    winner
                );
                for loser in &conflict.losers {
                    let _ = writeln!(out, "    - {} {}", loser.task_id, loser.reason);
                }
            }
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out, "errors:");
            for e in &self.errors {
                match &e.task_id {
                    Some(task) => {
                        let _ = writeln!(out, "  [{}] {}: {}", e.kind, task, e.message);
                    }
                    None => {
                        let _ = writeln!(out, "  [{}] {}", e.kind, e.message);
                    }
                }
            }
        }

        if !self.warnings.is_empty() {
            let _ = writeln!(out, "warnings:");
            for w in &self.warnings {
                let _ = writeln!(out, "  {w}");
            }
        }

        render_remaining(&mut out, &self.remaining);
        out
    }
}

fn render_remaining(out: &mut String, remaining: &[RemainingTask]) {
    if remaining.is_empty() {
        return;
    }
    let _ = writeln!(out, "remaining:");
    for task in remaining {
        let _ = write!(
            out,
            "  {:>5}  {}  {} [{}]",
            task.priority.to_string(),
            task.task_id,
            task.title,
            task.status
        );
        if let Some(reason) = &task.reason {
            let _ = write!(out, " {reason}");
        }
        out.push('\n');
    }
}

/// Point-in-time view for `braid status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub workers: Vec<WorkerLoad>,
    pub remaining: Vec<RemainingTask>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch: Option<BatchId>,
}

impl StatusReport {
    /// `workers` comes from the registry; outside a running batch every load is 0.
    pub fn from_board(
        board: &TaskBoard,
        workers: Vec<WorkerLoad>,
        last_batch: Option<BatchId>,
    ) -> Self {
        Self {
            counts: board.counts(),
            workers,
            remaining: board.remaining().into_iter().map(RemainingTask::from).collect(),
            last_batch,
        }
    }

    pub fn render_text(&self) -> String {
        let c = &self.counts;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "tasks: pending {} ready {} dispatched {} running {} completed {} failed {} deferred {} archived {}",
            c.pending, c.ready, c.dispatched, c.running, c.completed, c.failed, c.deferred, c.archived
        );
        if let Some(batch) = &self.last_batch {
            let _ = writeln!(out, "last batch: {batch}");
        }
        if !self.workers.is_empty() {
            let _ = writeln!(out, "workers:");
            for w in &self.workers {
                let _ = writeln!(out, "  {} {}/{}", w.id, w.current_load, w.max_concurrent);
            }
        }
        render_remaining(&mut out, &self.remaining);
        out
    }
}
