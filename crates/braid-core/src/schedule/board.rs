//! TaskBoard: all task records plus the dependency graph.
//!
//! readiness の判定はここに集約しています。
//! - 依存が全て Completed → Ready
//! - 依存（推移的）に Failed がある → Deferred(FailedAncestor)、自動では戻らない
//! - Ready なのに依存が満たされていない（rollback 後など）→ Deferred(BlockedBy)

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::dependency::DependencyGraph;
use super::record::TaskRecord;
use crate::domain::{BatchId, DeferReason, Score, Task, TaskId, TaskStatus};
use crate::error::BraidError;
use crate::priority::PriorityKey;

/// Status changes made by [`TaskBoard::refresh_readiness`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadinessChanges {
    pub promoted: Vec<TaskId>,
    pub deferred: Vec<(TaskId, DeferReason)>,
}

impl ReadinessChanges {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty() && self.deferred.is_empty()
    }
}

/// Task counts by status. Archived tasks are counted separately.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub dispatched: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub archived: usize,
}

enum Readiness {
    Promote,
    Defer(DeferReason),
}

#[derive(Debug, Default, Clone)]
pub struct TaskBoard {
    records: BTreeMap<TaskId, TaskRecord>,
    graph: DependencyGraph,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a board (and its dependency graph) from persisted records.
    pub fn from_records(records: impl IntoIterator<Item = TaskRecord>) -> Self {
        let mut board = Self::new();
        for record in records {
            board.add_edges(&record.task);
            board.records.insert(record.task.id.clone(), record);
        }
        board
    }

    pub fn insert(&mut self, task: Task) -> Result<(), BraidError> {
        if self.records.contains_key(&task.id) {
            return Err(BraidError::DuplicateTask(task.id));
        }
        self.add_edges(&task);
        self.records.insert(task.id.clone(), TaskRecord::new(task));
        Ok(())
    }

    fn add_edges(&mut self, task: &Task) {
        for dep in &task.depends_on {
            self.graph.add_dependency(task.id.clone(), dep.clone());
        }
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    pub fn record_mut(&mut self, id: &TaskId) -> Result<&mut TaskRecord, BraidError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| BraidError::UnknownTask(id.clone()))
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.records.get(id).map(|r| r.status)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.records.contains_key(id)
    }

    /// Records in task-id order.
    pub fn records(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.values()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.records.values().map(|r| &r.task)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    fn is_completed(&self, id: &TaskId) -> bool {
        self.status(id) == Some(TaskStatus::Completed)
    }

    pub fn unmet_dependencies(&self, task: &Task) -> usize {
        task.depends_on
            .iter()
            .filter(|dep| !self.is_completed(dep))
            .count()
    }

    fn first_unmet_dependency<'a>(&self, task: &'a Task) -> Option<&'a TaskId> {
        task.depends_on.iter().find(|dep| !self.is_completed(dep))
    }

    /// The permanently failed task this one (transitively) waits for, if any.
    fn failed_ancestor(&self, task: &Task) -> Option<TaskId> {
        task.depends_on.iter().find_map(|dep| {
            let record = self.records.get(dep)?;
            match (&record.status, &record.deferred) {
                (TaskStatus::Failed, _) => Some(dep.clone()),
                (TaskStatus::Deferred, Some(DeferReason::FailedAncestor { ancestor })) => {
                    Some(ancestor.clone())
                }
                _ => None,
            }
        })
    }

    pub fn priority_key(&self, id: &TaskId) -> Option<PriorityKey> {
        let record = self.records.get(id)?;
        Some(PriorityKey::new(
            &record.task,
            self.unmet_dependencies(&record.task),
        ))
    }

    fn sorted_by_priority<'a>(&self, records: impl Iterator<Item = &'a TaskRecord>) -> Vec<&'a TaskRecord> {
        let mut keyed: Vec<(PriorityKey, &TaskRecord)> = records
            .map(|r| (PriorityKey::new(&r.task, self.unmet_dependencies(&r.task)), r))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, r)| r).collect()
    }

    /// Ready tasks in scheduling order.
    pub fn ready_queue(&self) -> Vec<TaskId> {
        let ready = self
            .records
            .values()
            .filter(|r| r.status == TaskStatus::Ready && !r.is_archived());
        self.sorted_by_priority(ready)
            .into_iter()
            .map(|r| r.task.id.clone())
            .collect()
    }

    /// Ready and Deferred tasks still waiting for a future batch, in priority order.
    pub fn remaining(&self) -> Vec<&TaskRecord> {
        let waiting = self.records.values().filter(|r| {
            !r.is_archived() && matches!(r.status, TaskStatus::Ready | TaskStatus::Deferred)
        });
        self.sorted_by_priority(waiting)
    }

    /// Defers every not-yet-started task that sits on a dependency cycle.
    pub fn mark_cycles(&mut self) -> Result<Vec<TaskId>, BraidError> {
        let mut marked = Vec::new();
        for id in self.graph.tasks_on_cycles() {
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if matches!(record.status, TaskStatus::Pending | TaskStatus::Ready)
                && !record.is_archived()
            {
                record.defer(DeferReason::DependencyCycle)?;
                marked.push(id);
            }
        }
        if !marked.is_empty()
            && let Some(cycle) = self.graph.detect_cycle()
        {
            let path: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
            warn!(cycle = %path.join(" -> "), deferred = marked.len(), "dependency cycle found");
        }
        Ok(marked)
    }

    fn readiness_of(&self, record: &TaskRecord) -> Option<Readiness> {
        if record.is_archived() {
            return None;
        }
        let blocked = matches!(record.deferred, Some(DeferReason::BlockedBy { .. }));
        let open = match record.status {
            TaskStatus::Pending | TaskStatus::Ready => true,
            TaskStatus::Deferred => blocked,
            _ => false,
        };
        if !open {
            return None;
        }
        if let Some(ancestor) = self.failed_ancestor(&record.task) {
            return Some(Readiness::Defer(DeferReason::FailedAncestor { ancestor }));
        }
        match (record.status, self.first_unmet_dependency(&record.task)) {
            (TaskStatus::Pending, None) => Some(Readiness::Promote),
            (TaskStatus::Deferred, None) => Some(Readiness::Promote),
            (TaskStatus::Ready, Some(dep)) => Some(Readiness::Defer(DeferReason::BlockedBy {
                dependency: dep.clone(),
            })),
            _ => None,
        }
    }

    /// Applies readiness rules until nothing changes.
    ///
    /// Failures propagate transitively: each pass pushes `FailedAncestor`
    /// one level further down the graph.
    pub fn refresh_readiness(&mut self) -> Result<ReadinessChanges, BraidError> {
        let mut changes = ReadinessChanges::default();
        loop {
            let pending: Vec<(TaskId, Readiness)> = self
                .records
                .values()
                .filter_map(|r| self.readiness_of(r).map(|next| (r.task.id.clone(), next)))
                .collect();
            if pending.is_empty() {
                return Ok(changes);
            }
            for (id, next) in pending {
                let record = self.record_mut(&id)?;
                match next {
                    Readiness::Promote => {
                        record.mark_ready()?;
                        debug!(task = %id, "task ready");
                        changes.promoted.push(id);
                    }
                    Readiness::Defer(reason) => {
                        if record.status == TaskStatus::Deferred {
                            record.deferred = Some(reason.clone());
                        } else {
                            record.defer(reason.clone())?;
                        }
                        debug!(task = %id, %reason, "task deferred");
                        changes.deferred.push((id, reason));
                    }
                }
            }
        }
    }

    /// Start of a batch: deferrals with transient reasons go back to Ready.
    pub fn reopen_transient(&mut self) -> Result<Vec<TaskId>, BraidError> {
        let mut reopened = Vec::new();
        for record in self.records.values_mut() {
            let transient = record
                .deferred
                .as_ref()
                .is_some_and(DeferReason::clears_at_next_batch);
            if record.status == TaskStatus::Deferred && transient && !record.is_archived() {
                record.mark_ready()?;
                // 新しい batch では routing と retry budget をやり直す
                record.worker = None;
                record.attempts = 0;
                record.not_before = None;
                reopened.push(record.task.id.clone());
            }
        }
        Ok(reopened)
    }

    /// End of a batch: tasks still Pending are deferred behind their first unmet dependency.
    pub fn finalize(&mut self) -> Result<Vec<(TaskId, DeferReason)>, BraidError> {
        let stuck: Vec<(TaskId, TaskId)> = self
            .records
            .values()
            .filter(|r| r.status == TaskStatus::Pending && !r.is_archived())
            .filter_map(|r| {
                self.first_unmet_dependency(&r.task)
                    .map(|dep| (r.task.id.clone(), dep.clone()))
            })
            .collect();
        let mut deferred = Vec::with_capacity(stuck.len());
        for (id, dependency) in stuck {
            let reason = DeferReason::BlockedBy { dependency };
            self.record_mut(&id)?.defer(reason.clone())?;
            deferred.push((id, reason));
        }
        Ok(deferred)
    }

    /// Sends executed tasks back to Ready after a rollback.
    ///
    /// Tasks deferred because one of them failed now just wait for it again.
    pub fn revert(&mut self, ids: &BTreeSet<TaskId>) -> Result<Vec<TaskId>, BraidError> {
        let mut reverted = Vec::new();
        for id in ids {
            let record = self.record_mut(id)?;
            if matches!(record.status, TaskStatus::Completed | TaskStatus::Failed) {
                record.reopen()?;
                record.failure = None;
                reverted.push(id.clone());
            }
        }
        for record in self.records.values_mut() {
            if let Some(DeferReason::FailedAncestor { ancestor }) = &record.deferred
                && ids.contains(ancestor)
            {
                record.deferred = Some(DeferReason::BlockedBy {
                    dependency: ancestor.clone(),
                });
            }
        }
        Ok(reverted)
    }

    /// Completed → Ready → Deferred: the integrator did not accept this task's result.
    pub fn withdraw(&mut self, id: &TaskId, reason: DeferReason) -> Result<(), BraidError> {
        let record = self.record_mut(id)?;
        record.reopen()?;
        record.defer(reason)
    }

    pub fn archive(&mut self, id: &TaskId, batch: BatchId) -> Result<(), BraidError> {
        self.record_mut(id)?.archive(batch);
        Ok(())
    }

    /// Changes the scores of a task. The only way its ordering can move.
    pub fn rescore(
        &mut self,
        id: &TaskId,
        impact: Score,
        effort: Score,
        risk: Score,
    ) -> Result<(), BraidError> {
        let record = self.record_mut(id)?;
        record.task.impact = impact;
        record.task.effort = effort;
        record.task.risk = risk;
        Ok(())
    }

    /// Operator override: a Deferred task goes back to Ready (manual review done,
    /// failed ancestor fixed by hand). Readiness re-checks its dependencies.
    pub fn release(&mut self, id: &TaskId) -> Result<(), BraidError> {
        self.record_mut(id)?.mark_ready()?;
        self.refresh_readiness()?;
        Ok(())
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            if record.is_archived() {
                counts.archived += 1;
                continue;
            }
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Dispatched => counts.dispatched += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Deferred => counts.deferred += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureReason, WorkerId};
    use std::time::Duration;

    fn board(tasks: Vec<Task>) -> TaskBoard {
        let mut b = TaskBoard::new();
        for t in tasks {
            b.insert(t).unwrap();
        }
        b
    }

    fn run_to(board: &mut TaskBoard, id: &str, outcome: TaskStatus) {
        let r = board.record_mut(&TaskId::new(id)).unwrap();
        r.mark_dispatched(WorkerId::new("w1")).unwrap();
        r.mark_running().unwrap();
        match outcome {
            TaskStatus::Completed => r.mark_completed(vec![]).unwrap(),
            _ => r
                .mark_failed(FailureReason::timeout(Duration::from_secs(30)))
                .unwrap(),
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut b = board(vec![Task::new("a", "A", ["build"])]);
        assert!(matches!(
            b.insert(Task::new("a", "A again", ["build"])),
            Err(BraidError::DuplicateTask(_))
        ));
    }

    #[test]
    fn pending_becomes_ready_only_when_dependencies_complete() {
        let mut b = board(vec![
            Task::new("a", "A", ["build"]),
            Task::new("b", "B", ["build"]).depending_on(["a"]),
        ]);
        let changes = b.refresh_readiness().unwrap();
        assert_eq!(changes.promoted, vec![TaskId::new("a")]);
        assert_eq!(b.status(&TaskId::new("b")), Some(TaskStatus::Pending));

        run_to(&mut b, "a", TaskStatus::Completed);
        b.refresh_readiness().unwrap();
        assert_eq!(b.status(&TaskId::new("b")), Some(TaskStatus::Ready));
    }

    #[test]
    fn failed_dependency_defers_transitively_and_never_promotes() {
        let mut b = board(vec![
            Task::new("x", "X", ["build"]),
            Task::new("y", "Y", ["build"]).depending_on(["x"]),
            Task::new("z", "Z", ["build"]).depending_on(["y"]),
        ]);
        b.refresh_readiness().unwrap();
        run_to(&mut b, "x", TaskStatus::Failed);
        b.refresh_readiness().unwrap();

        for id in ["y", "z"] {
            let r = b.get(&TaskId::new(id)).unwrap();
            assert_eq!(r.status, TaskStatus::Deferred);
            assert_eq!(
                r.deferred,
                Some(DeferReason::FailedAncestor {
                    ancestor: TaskId::new("x")
                })
            );
        }

        // further refreshes and a new batch do not bring them back
        b.reopen_transient().unwrap();
        b.refresh_readiness().unwrap();
        assert_eq!(b.status(&TaskId::new("y")), Some(TaskStatus::Deferred));
    }

    #[test]
    fn ready_queue_follows_priority_order() {
        let s = |v| Score::new(v).unwrap();
        let mut b = board(vec![
            Task::new("low", "Low", ["build"])
                .with_scores(s(2), s(1), s(1))
                .with_source("p", 0),
            Task::new("high", "High", ["build"])
                .with_scores(s(5), s(1), s(1))
                .with_source("p", 1),
        ]);
        b.refresh_readiness().unwrap();
        assert_eq!(b.ready_queue(), vec![TaskId::new("high"), TaskId::new("low")]);

        b.rescore(&TaskId::new("low"), s(5), s(1), s(1)).unwrap();
        assert_eq!(b.ready_queue(), vec![TaskId::new("low"), TaskId::new("high")]);
    }

    #[test]
    fn cycles_are_deferred_and_tails_blocked_at_finalize() {
        let mut b = board(vec![
            Task::new("a", "A", ["build"]).depending_on(["b"]),
            Task::new("b", "B", ["build"]).depending_on(["a"]),
            Task::new("c", "C", ["build"]).depending_on(["a"]),
        ]);
        let marked = b.mark_cycles().unwrap();
        assert_eq!(marked, vec![TaskId::new("a"), TaskId::new("b")]);

        b.refresh_readiness().unwrap();
        let finalized = b.finalize().unwrap();
        assert_eq!(
            finalized,
            vec![(
                TaskId::new("c"),
                DeferReason::BlockedBy {
                    dependency: TaskId::new("a")
                }
            )]
        );
    }

    #[test]
    fn blocked_task_is_promoted_once_dependency_completes() {
        let mut b = board(vec![
            Task::new("a", "A", ["build"]),
            Task::new("b", "B", ["build"]).depending_on(["a"]),
        ]);
        b.refresh_readiness().unwrap();
        b.record_mut(&TaskId::new("a"))
            .unwrap()
            .defer(DeferReason::NoCapableWorker)
            .unwrap();
        b.finalize().unwrap();
        assert_eq!(b.status(&TaskId::new("b")), Some(TaskStatus::Deferred));

        b.reopen_transient().unwrap();
        run_to(&mut b, "a", TaskStatus::Completed);
        b.refresh_readiness().unwrap();
        assert_eq!(b.status(&TaskId::new("b")), Some(TaskStatus::Ready));
    }

    #[test]
    fn revert_reopens_executed_tasks_and_unblocks_failed_descendants() {
        let mut b = board(vec![
            Task::new("a", "A", ["build"]),
            Task::new("b", "B", ["build"]).depending_on(["a"]),
        ]);
        b.refresh_readiness().unwrap();
        run_to(&mut b, "a", TaskStatus::Failed);
        b.refresh_readiness().unwrap();

        let batch = BTreeSet::from([TaskId::new("a")]);
        assert_eq!(b.revert(&batch).unwrap(), vec![TaskId::new("a")]);
        assert_eq!(b.status(&TaskId::new("a")), Some(TaskStatus::Ready));
        assert_eq!(
            b.get(&TaskId::new("b")).unwrap().deferred,
            Some(DeferReason::BlockedBy {
                dependency: TaskId::new("a")
            })
        );
    }

    #[test]
    fn ready_task_with_unmet_dependency_is_demoted() {
        let mut b = board(vec![
            Task::new("a", "A", ["build"]),
            Task::new("b", "B", ["build"]).depending_on(["a"]),
        ]);
        b.refresh_readiness().unwrap();
        run_to(&mut b, "a", TaskStatus::Completed);
        b.refresh_readiness().unwrap();
        run_to(&mut b, "b", TaskStatus::Completed);

        let batch = BTreeSet::from([TaskId::new("a"), TaskId::new("b")]);
        b.revert(&batch).unwrap();
        b.refresh_readiness().unwrap();

        assert_eq!(b.status(&TaskId::new("a")), Some(TaskStatus::Ready));
        assert_eq!(b.status(&TaskId::new("b")), Some(TaskStatus::Deferred));
    }

    #[test]
    fn counts_separate_archived_tasks() {
        let mut b = board(vec![Task::new("a", "A", ["build"]), Task::new("b", "B", ["build"])]);
        b.refresh_readiness().unwrap();
        run_to(&mut b, "a", TaskStatus::Completed);
        b.archive(&TaskId::new("a"), BatchId::from_ulid(ulid::Ulid::new()))
            .unwrap();

        let counts = b.counts();
        assert_eq!(counts.archived, 1);
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.completed, 0);
    }
}
