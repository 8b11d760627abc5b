//! Engine - intake → schedule → integrate → report
//!
//! TaskBoard, artifact store と IntegrationRecord の履歴を所有し、
//! batch ごとに以下を順番に行います。
//!
//! 1. 前の batch の一時的な Deferred（cancel, conflict 負けなど）を Ready に戻す
//! 2. Scheduler で Ready を全部流す
//! 3. Completed になった task の結果を Integrator に渡す
//! 4. commit なら archive、rollback なら実行した task を Ready に戻す
//! 5. BatchReport を組み立てる

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::classify::{ClassificationWarning, Classifier, Intake, KnownTasks};
use crate::config::{EngineConfig, WorkerConfig};
use crate::domain::{
    BatchId, DeferReason, IntegrationRecord, Score, SourceUnit, TaskId, TaskStatus,
};
use crate::error::{BraidError, ReportedError};
use crate::impls::InMemoryArtifactStore;
use crate::integrate::{Integration, Integrator, TaskOutput};
use crate::ports::{ArtifactStore, EngineEvent, EventSink};
use crate::report::{BatchReport, RemainingTask, StatusReport};
use crate::schedule::{
    BatchRun, CancelSignal, Executor, Scheduler, SchedulerBuilder, TaskBoard,
};

/// Persisted state: everything the engine needs to resume in another process.
#[derive(Debug, Clone)]
pub struct EngineParts<S> {
    pub board: TaskBoard,
    pub store: S,
    pub history: Vec<IntegrationRecord>,
}

pub struct Engine<S = InMemoryArtifactStore> {
    classifier: Classifier,
    scheduler: Scheduler,
    integrator: Integrator,
    board: TaskBoard,
    store: S,
    history: Vec<IntegrationRecord>,

    // 次の batch report に載せる intake の結果
    intake_warnings: Vec<ClassificationWarning>,
    intake_errors: Vec<ReportedError>,
}

impl<S: ArtifactStore> Engine<S> {
    pub fn new(classifier: Classifier, scheduler: Scheduler, integrator: Integrator, store: S) -> Self {
        Self {
            classifier,
            scheduler,
            integrator,
            board: TaskBoard::new(),
            store,
            history: Vec::new(),
            intake_warnings: Vec::new(),
            intake_errors: Vec::new(),
        }
    }

    /// Wires classifier, scheduler and integrator from `config`.
    ///
    /// `executor_for` is called once per configured worker.
    pub fn from_config(
        config: &EngineConfig,
        store: S,
        events: Arc<dyn EventSink>,
        executor_for: impl FnMut(&WorkerConfig) -> Result<Arc<dyn Executor>, BraidError>,
    ) -> Result<Self, BraidError> {
        let scheduler = scheduler_builder(config, executor_for)?
            .event_sink(events)
            .build()?;
        Ok(Self::new(
            Classifier::new(config.classifier.keyword_table()),
            scheduler,
            Integrator::new(config.integrator.delete_margin),
            store,
        ))
    }

    /// Restores board, store and history saved from an earlier run.
    pub fn with_parts(mut self, parts: EngineParts<S>) -> Self {
        self.board = parts.board;
        self.store = parts.store;
        self.history = parts.history;
        self
    }

    pub fn into_parts(self) -> EngineParts<S> {
        EngineParts {
            board: self.board,
            store: self.store,
            history: self.history,
        }
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn history(&self) -> &[IntegrationRecord] {
        &self.history
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn emit(&self, event: EngineEvent) {
        self.scheduler.events().emit(event);
    }

    /// Classifies `units` and adds the resulting tasks to the board.
    ///
    /// Classification problems never fail the call; they are returned in the
    /// [`Intake`] and carried into the next batch report.
    #[instrument(skip_all, fields(units = units.len()))]
    pub fn intake(&mut self, units: &[SourceUnit]) -> Result<Intake, BraidError> {
        let known = KnownTasks::from_tasks(self.board.tasks());
        let intake = self.classifier.classify(units, &known);

        for task in &intake.tasks {
            self.board.insert(task.clone())?;
        }
        for id in self.board.mark_cycles()? {
            warn!(task = %id, "dependency cycle");
            self.emit(EngineEvent::TaskDeferred {
                task: id,
                reason: DeferReason::DependencyCycle,
            });
        }
        self.board.refresh_readiness()?;

        info!(
            tasks = intake.tasks.len(),
            warnings = intake.warnings.len(),
            errors = intake.errors.len(),
            "intake finished"
        );
        self.intake_warnings.extend(intake.warnings.iter().cloned());
        self.intake_errors.extend(
            intake
                .errors
                .iter()
                .map(|e| ReportedError::new(None, &BraidError::Classification(e.clone()))),
        );
        Ok(intake)
    }

    /// Runs one batch: every Ready task, then integration of the results.
    #[instrument(skip_all)]
    pub async fn run_batch(&mut self, cancel: CancelSignal) -> Result<BatchReport, BraidError> {
        for id in self.board.reopen_transient()? {
            info!(task = %id, "reopened for this batch");
        }
        self.board.refresh_readiness()?;

        let batch_id = self.scheduler.ids().generate_batch_id();
        info!(batch = %batch_id, "batch started");

        let run = self.scheduler.run(&mut self.board, cancel).await?;
        let outputs = self.collect_outputs(&run);
        let integration = self.integrator.integrate(
            batch_id,
            &outputs,
            &mut self.store,
            self.scheduler.clock().now(),
        );
        for conflict in &integration.record.resolved_conflicts {
            self.emit(EngineEvent::ConflictResolved {
                conflict: conflict.clone(),
            });
        }

        let mut ended_deferred: BTreeSet<TaskId> =
            run.deferred.iter().map(|d| d.task_id.clone()).collect();

        if let Some(failure) = &integration.record.rolled_back {
            let reverted = self.board.revert(&run.dispatched)?;
            warn!(batch = %batch_id, reverted = reverted.len(), "batch rolled back");
            self.emit(EngineEvent::BatchRolledBack {
                batch: batch_id,
                failure: failure.clone(),
            });
        } else {
            self.settle(batch_id, &outputs, &integration)?;
            ended_deferred.extend(integration.record.deferred_ids().cloned());
        }

        self.board.refresh_readiness()?;
        for (id, reason) in self.board.finalize()? {
            self.emit(EngineEvent::TaskDeferred {
                task: id.clone(),
                reason,
            });
            ended_deferred.insert(id);
        }

        let report = self.build_report(batch_id, &run, integration, &ended_deferred);
        info!(
            batch = %batch_id,
            outcome = %report.outcome,
            committed = report.committed.len(),
            "batch finished"
        );
        Ok(report)
    }

    /// Results of tasks that completed in this batch.
    fn collect_outputs(&self, run: &BatchRun) -> Vec<TaskOutput> {
        run.dispatched
            .iter()
            .filter_map(|id| self.board.get(id))
            .filter(|r| r.status == TaskStatus::Completed && !r.is_archived())
            .map(|r| TaskOutput {
                task_id: r.task.id.clone(),
                priority: r.task.priority(),
                depends_on: r.task.depends_on.clone(),
                mutations: r.result.clone(),
            })
            .collect()
    }

    /// Commit path: losers go back to Deferred, the rest is archived.
    fn settle(
        &mut self,
        batch_id: BatchId,
        outputs: &[TaskOutput],
        integration: &Integration,
    ) -> Result<(), BraidError> {
        let record = &integration.record;
        for deferred in &record.deferred_tasks {
            self.board.withdraw(&deferred.task_id, deferred.reason.clone())?;
            self.emit(EngineEvent::TaskDeferred {
                task: deferred.task_id.clone(),
                reason: deferred.reason.clone(),
            });
        }

        if !record.replayed {
            let withheld: BTreeSet<&TaskId> = record.deferred_ids().collect();
            for output in outputs.iter().filter(|o| !withheld.contains(&o.task_id)) {
                self.board.archive(&output.task_id, batch_id)?;
            }
            self.emit(EngineEvent::BatchCommitted {
                batch: batch_id,
                mutations: record.committed_mutations.len(),
            });
        }
        Ok(())
    }

    fn build_report(
        &mut self,
        batch_id: BatchId,
        run: &BatchRun,
        integration: Integration,
        ended_deferred: &BTreeSet<TaskId>,
    ) -> BatchReport {
        let Integration { record, errors } = integration;

        let completed = run
            .dispatched
            .iter()
            .filter(|id| {
                self.board
                    .get(id)
                    .is_some_and(|r| r.archived_in == Some(batch_id))
            })
            .count();
        let failed = run
            .dispatched
            .iter()
            .filter(|id| self.board.status(id) == Some(TaskStatus::Failed))
            .count();
        let deferred = ended_deferred
            .iter()
            .filter(|id| self.board.status(id) == Some(TaskStatus::Deferred))
            .count();

        let mut reported = std::mem::take(&mut self.intake_errors);
        reported.extend(run.errors.iter().cloned());
        reported.extend(errors.iter().map(|e| {
            let task = match e {
                BraidError::Commit(commit) => Some(commit.task.clone()),
                _ => None,
            };
            ReportedError::new(task, e)
        }));

        let outcome = BatchReport::outcome_for(
            record.is_rolled_back(),
            failed,
            deferred,
            reported.len(),
        );
        let report = BatchReport {
            batch_id,
            outcome,
            processed: run.dispatched.len(),
            completed,
            failed,
            deferred,
            committed: record.committed_mutations.clone(),
            conflicts: record.resolved_conflicts.clone(),
            errors: reported,
            warnings: std::mem::take(&mut self.intake_warnings),
            remaining: self.remaining(),
            cancelled: run.cancelled,
            rolled_back: record.rolled_back.clone(),
        };
        self.history.push(record);
        report
    }

    fn remaining(&self) -> Vec<RemainingTask> {
        self.board
            .remaining()
            .into_iter()
            .map(RemainingTask::from)
            .collect()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::from_board(
            &self.board,
            self.scheduler.registry().snapshot(),
            self.history.last().map(|r| r.batch_id),
        )
    }

    /// Changes a task's scores; its position in the ready queue follows.
    pub fn rescore(
        &mut self,
        id: &TaskId,
        impact: Score,
        effort: Score,
        risk: Score,
    ) -> Result<(), BraidError> {
        self.board.rescore(id, impact, effort, risk)?;
        info!(task = %id, impact = impact.get(), effort = effort.get(), risk = risk.get(), "rescored");
        Ok(())
    }

    /// Operator override for a Deferred task (manual review done).
    pub fn release(&mut self, id: &TaskId) -> Result<(), BraidError> {
        self.board.release(id)?;
        info!(task = %id, "released");
        Ok(())
    }
}

/// Scheduler builder with every configured worker registered and bound.
pub fn scheduler_builder(
    config: &EngineConfig,
    mut executor_for: impl FnMut(&WorkerConfig) -> Result<Arc<dyn Executor>, BraidError>,
) -> Result<SchedulerBuilder, BraidError> {
    let mut builder = Scheduler::builder()
        .timeout(config.scheduler.task_timeout())
        .decider(Arc::new(config.scheduler.decider()));
    for worker in &config.workers {
        builder = builder
            .register_worker(worker.descriptor())?
            .bind_executor(worker.id.clone(), executor_for(worker)?)?;
    }
    Ok(builder)
}
