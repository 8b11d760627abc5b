//! Schedule - task の状態管理と実行ループ
//!
//! # 主要コンポーネント
//! - **TaskBoard**: 全 task の TaskRecord と依存グラフ（readiness の判定）
//! - **Scheduler**: Ready を優先度順に worker へ割り当て、結果を待つループ
//! - **Executor**: worker ごとの実行ルーチン（外部）
//! - **CancelHandle / CancelSignal**: batch の cancel
//!
//! # 並行性
//! TaskBoard を触るのは `Scheduler::run` のループだけです。
//! executor には Task の clone を渡し、結果は mpsc で受け取ります。
//! 共有される可変状態は registry の load カウンタ（atomic）だけ。

pub mod board;
pub mod builder;
pub mod cancel;
pub mod dependency;
pub mod executor;
pub mod record;
pub mod retry;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use self::board::{ReadinessChanges, StatusCounts, TaskBoard};
pub use self::builder::{SchedulerBuilder, DEFAULT_TASK_TIMEOUT};
pub use self::cancel::{cancellation, CancelHandle, CancelSignal};
pub use self::dependency::DependencyGraph;
pub use self::executor::{Executor, ExecutorRegistry};
pub use self::record::TaskRecord;
pub use self::retry::{RetryPolicy, MAX_RETRY_DELAY};

use crate::domain::{
    ArtifactMutation, AttemptId, AttemptOutcome, AttemptRecord, Decider, Decision,
    DecisionRecord, DeferReason, DeferredTask, ExecutorFailure, FailureReason, Task, TaskId,
    TaskStatus, WorkerId,
};
use crate::error::{BraidError, ExecutionError, ReportedError};
use crate::ports::{Clock, EngineEvent, EventSink, IdGenerator};
use crate::routing::{CapabilityRegistry, Router};

/// What happened while the scheduler drove one batch.
#[derive(Debug, Default, Clone)]
pub struct BatchRun {
    pub attempts: Vec<AttemptRecord>,
    pub decisions: Vec<DecisionRecord>,
    pub errors: Vec<ReportedError>,
    /// Tasks dispatched at least once.
    pub dispatched: BTreeSet<TaskId>,
    /// Deferrals made during the run, in order.
    pub deferred: Vec<DeferredTask>,
    pub cancelled: bool,
}

enum AttemptEvent {
    Started {
        task: TaskId,
        worker: WorkerId,
        attempt: u32,
    },
    Finished(Box<FinishedAttempt>),
}

struct FinishedAttempt {
    attempt_id: AttemptId,
    task: TaskId,
    worker: WorkerId,
    attempt: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: Result<Vec<ArtifactMutation>, FailureReason>,
}

enum Wake {
    Event(AttemptEvent),
    Cancel,
    Timer,
    Joined,
    Idle,
}

pub struct Scheduler {
    pub(crate) router: Router,
    pub(crate) executors: ExecutorRegistry,
    pub(crate) timeout: Duration,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ids: Arc<dyn IdGenerator>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        self.router.registry()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// Drives every Ready task on `board` until nothing is in flight and
    /// nothing else can start.
    ///
    /// Per-task failures are recorded in the returned [`BatchRun`]; only a
    /// broken state machine (a bug) surfaces as `Err`.
    pub async fn run(
        &self,
        board: &mut TaskBoard,
        mut cancel: CancelSignal,
    ) -> Result<BatchRun, BraidError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AttemptEvent>();
        let mut joins: JoinSet<()> = JoinSet::new();
        let mut in_flight: BTreeMap<TaskId, AbortHandle> = BTreeMap::new();
        let mut run = BatchRun::default();
        let mut cancelled = false;

        let initial = board.refresh_readiness()?;
        self.note_deferrals(&mut run, initial);
        info!(
            ready = board.ready_queue().len(),
            capacity = self.registry().total_capacity(),
            "scheduler started"
        );

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                run.cancelled = true;
                self.events.emit(EngineEvent::CancelRequested);
            }
            if cancelled {
                self.defer_cancelled(board, &mut in_flight, &mut run)?;
            } else {
                self.dispatch_ready(board, &mut joins, &mut in_flight, &tx, &mut run)?;
            }

            let deadline = next_retry_deadline(board);
            if in_flight.is_empty() && deadline.is_none() {
                break;
            }
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let wake = tokio::select! {
                Some(event) = rx.recv() => Wake::Event(event),
                _ = cancel.cancelled(), if !cancelled => Wake::Cancel,
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => Wake::Timer,
                Some(joined) = joins.join_next(), if !joins.is_empty() => {
                    if let Err(err) = joined
                        && !err.is_cancelled()
                    {
                        warn!(error = %err, "attempt task ended abnormally");
                    }
                    Wake::Joined
                }
                else => Wake::Idle,
            };

            match wake {
                Wake::Event(event) => self.handle_event(board, event, &mut in_flight, &mut run)?,
                Wake::Cancel => {
                    cancelled = true;
                    run.cancelled = true;
                    self.events.emit(EngineEvent::CancelRequested);
                }
                Wake::Timer | Wake::Joined => {}
                Wake::Idle => break,
            }
        }

        info!(
            dispatched = run.dispatched.len(),
            attempts = run.attempts.len(),
            cancelled = run.cancelled,
            "scheduler finished"
        );
        Ok(run)
    }

    fn dispatch_ready(
        &self,
        board: &mut TaskBoard,
        joins: &mut JoinSet<()>,
        in_flight: &mut BTreeMap<TaskId, AbortHandle>,
        tx: &mpsc::UnboundedSender<AttemptEvent>,
        run: &mut BatchRun,
    ) -> Result<(), BraidError> {
        let now = Instant::now();
        for id in board.ready_queue() {
            let record = board.record_mut(&id)?;
            if record.not_before.is_some_and(|t| t > now) {
                continue;
            }

            // retry は同じ worker に固定
            let worker = match record.worker.clone() {
                Some(worker) => worker,
                None => match self.router.route(&record.task) {
                    Ok(worker) => worker,
                    Err(err) => {
                        record.defer(DeferReason::NoCapableWorker)?;
                        run.errors
                            .push(ReportedError::new(Some(id.clone()), &BraidError::Routing(err)));
                        self.note_deferred(run, id, DeferReason::NoCapableWorker);
                        continue;
                    }
                },
            };

            let Some(executor) = self.executors.get(&worker).cloned() else {
                warn!(task = %id, worker = %worker, "no executor bound to worker");
                record.defer(DeferReason::NoCapableWorker)?;
                self.note_deferred(run, id, DeferReason::NoCapableWorker);
                continue;
            };
            if !self.registry().try_acquire(&worker) {
                debug!(task = %id, worker = %worker, "worker saturated, task waits");
                continue;
            }

            record.mark_dispatched(worker.clone())?;
            let attempt = record.attempts;
            let job = AttemptJob {
                attempt_id: self.ids.generate_attempt_id(),
                attempt,
                task: record.task.clone(),
                worker: worker.clone(),
                executor,
                timeout: self.timeout,
                clock: Arc::clone(&self.clock),
                tx: tx.clone(),
            };
            let handle = joins.spawn(run_attempt(job));
            in_flight.insert(id.clone(), handle);
            run.dispatched.insert(id.clone());

            info!(task = %id, worker = %worker, attempt, "task dispatched");
            self.events.emit(EngineEvent::TaskDispatched {
                task: id,
                worker,
                attempt,
            });
        }
        Ok(())
    }

    /// Ready and Dispatched tasks stop here. Running ones are left to finish.
    fn defer_cancelled(
        &self,
        board: &mut TaskBoard,
        in_flight: &mut BTreeMap<TaskId, AbortHandle>,
        run: &mut BatchRun,
    ) -> Result<(), BraidError> {
        for id in board.ready_queue() {
            board.record_mut(&id)?.defer(DeferReason::BatchCancelled)?;
            self.note_deferred(run, id, DeferReason::BatchCancelled);
        }

        let dispatched: Vec<TaskId> = in_flight
            .keys()
            .filter(|id| board.status(id) == Some(TaskStatus::Dispatched))
            .cloned()
            .collect();
        for id in dispatched {
            if let Some(handle) = in_flight.remove(&id) {
                handle.abort();
            }
            let record = board.record_mut(&id)?;
            if let Some(worker) = &record.worker {
                self.registry().release(worker);
            }
            record.defer(DeferReason::BatchCancelled)?;
            self.note_deferred(run, id, DeferReason::BatchCancelled);
        }
        Ok(())
    }

    fn handle_event(
        &self,
        board: &mut TaskBoard,
        event: AttemptEvent,
        in_flight: &mut BTreeMap<TaskId, AbortHandle>,
        run: &mut BatchRun,
    ) -> Result<(), BraidError> {
        match event {
            AttemptEvent::Started {
                task,
                worker,
                attempt,
            } => {
                let record = board.record_mut(&task)?;
                if record.status != TaskStatus::Dispatched || record.attempts != attempt {
                    return Ok(());
                }
                record.mark_running()?;
                debug!(task = %task, worker = %worker, attempt, "task running");
                self.events.emit(EngineEvent::TaskStarted { task, worker });
            }
            AttemptEvent::Finished(finished) => self.finish_attempt(board, *finished, in_flight, run)?,
        }
        Ok(())
    }

    fn finish_attempt(
        &self,
        board: &mut TaskBoard,
        finished: FinishedAttempt,
        in_flight: &mut BTreeMap<TaskId, AbortHandle>,
        run: &mut BatchRun,
    ) -> Result<(), BraidError> {
        let FinishedAttempt {
            attempt_id,
            task,
            worker,
            attempt,
            started_at,
            finished_at,
            result,
        } = finished;

        let record = board.record_mut(&task)?;
        if !record.status.is_in_flight() || record.attempts != attempt {
            // cancel 済みの attempt: slot はもう返している
            debug!(task = %task, attempt, "stale attempt result ignored");
            return Ok(());
        }
        if record.status == TaskStatus::Dispatched {
            record.mark_running()?;
        }
        in_flight.remove(&task);
        self.registry().release(&worker);

        match result {
            Ok(mutations) => {
                let count = mutations.len();
                record.mark_completed(mutations)?;
                run.attempts.push(AttemptRecord {
                    attempt_id,
                    task_id: task.clone(),
                    worker_id: worker.clone(),
                    attempt,
                    outcome: AttemptOutcome::Completed { mutations: count },
                    started_at,
                    finished_at,
                });
                info!(task = %task, worker = %worker, mutations = count, "task completed");
                self.events.emit(EngineEvent::TaskCompleted {
                    task,
                    worker,
                    mutations: count,
                });
            }
            Err(failure) => {
                record.mark_failed(failure.clone())?;
                run.attempts.push(AttemptRecord {
                    attempt_id,
                    task_id: task.clone(),
                    worker_id: worker.clone(),
                    attempt,
                    outcome: AttemptOutcome::Failed {
                        failure: failure.clone(),
                    },
                    started_at,
                    finished_at,
                });
                run.errors.push(ReportedError::new(
                    Some(task.clone()),
                    &BraidError::Execution(execution_error(&task, &failure)),
                ));

                let decision = self.decider.decide(record, &failure);
                let trigger = json!({
                    "kind": "attempt_failed",
                    "attempt": attempt,
                    "failure": &failure,
                });
                let will_retry = match decision {
                    Decision::Retry { delay, reason } => {
                        let now = Instant::now();
                        let not_before = now
                            .checked_add(delay)
                            .unwrap_or_else(|| now + MAX_RETRY_DELAY);
                        record.schedule_retry(not_before)?;
                        warn!(task = %task, worker = %worker, %failure, ?delay, "attempt failed, retrying");
                        run.decisions.push(DecisionRecord::new(
                            task.clone(),
                            trigger,
                            "retry_policy",
                            "schedule_retry",
                            Some(json!({
                                "reason": reason,
                                "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                "worker": &worker,
                            })),
                            self.clock.now(),
                        ));
                        true
                    }
                    Decision::GiveUp { reason } => {
                        warn!(task = %task, worker = %worker, %failure, "task failed permanently");
                        run.decisions.push(DecisionRecord::new(
                            task.clone(),
                            trigger,
                            "retry_policy",
                            "mark_failed",
                            Some(json!({ "reason": reason })),
                            self.clock.now(),
                        ));
                        false
                    }
                };
                self.events.emit(EngineEvent::TaskFailed {
                    task,
                    worker,
                    failure,
                    will_retry,
                });
            }
        }

        let changes = board.refresh_readiness()?;
        self.note_deferrals(run, changes);
        Ok(())
    }

    fn note_deferrals(&self, run: &mut BatchRun, changes: ReadinessChanges) {
        for (id, reason) in changes.deferred {
            self.note_deferred(run, id, reason);
        }
    }

    fn note_deferred(&self, run: &mut BatchRun, task: TaskId, reason: DeferReason) {
        info!(task = %task, %reason, "task deferred");
        self.events.emit(EngineEvent::TaskDeferred {
            task: task.clone(),
            reason: reason.clone(),
        });
        run.deferred.push(DeferredTask {
            task_id: task,
            reason,
        });
    }
}

/// Earliest retry backoff still in the future.
fn next_retry_deadline(board: &TaskBoard) -> Option<Instant> {
    let now = Instant::now();
    board
        .records()
        .filter(|r| r.status == TaskStatus::Ready && !r.is_archived())
        .filter_map(|r| r.not_before)
        .filter(|t| *t > now)
        .min()
}

fn execution_error(task: &TaskId, failure: &FailureReason) -> ExecutionError {
    match failure {
        FailureReason::Timeout { after_ms } => ExecutionError::Timeout {
            task: task.clone(),
            after: Duration::from_millis(*after_ms),
        },
        FailureReason::Executor(failure) => ExecutionError::ExecutorFailure {
            task: task.clone(),
            failure: failure.clone(),
        },
    }
}

struct AttemptJob {
    attempt_id: AttemptId,
    attempt: u32,
    task: Task,
    worker: WorkerId,
    executor: Arc<dyn Executor>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    tx: mpsc::UnboundedSender<AttemptEvent>,
}

/// Aborts the executor call when the attempt itself is aborted or times out.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_attempt(job: AttemptJob) {
    let AttemptJob {
        attempt_id,
        attempt,
        task,
        worker,
        executor,
        timeout,
        clock,
        tx,
    } = job;
    let task_id = task.id.clone();

    // receiver が消えていたら結果を届ける先もないので無視
    let _ = tx.send(AttemptEvent::Started {
        task: task_id.clone(),
        worker: worker.clone(),
        attempt,
    });
    let started_at = clock.now();

    let call_worker = worker.clone();
    let mut call = tokio::spawn(async move { executor.execute(&task, &call_worker).await });
    let _guard = AbortOnDrop(call.abort_handle());

    let result = match tokio::time::timeout(timeout, &mut call).await {
        Ok(Ok(Ok(mutations))) => Ok(mutations),
        Ok(Ok(Err(failure))) => Err(FailureReason::Executor(failure)),
        Ok(Err(join)) if join.is_panic() => {
            let message = panic_message(join.into_panic());
            Err(FailureReason::Executor(ExecutorFailure::new("panic", message)))
        }
        Ok(Err(join)) => Err(FailureReason::Executor(ExecutorFailure::new(
            "aborted",
            join.to_string(),
        ))),
        Err(_elapsed) => Err(FailureReason::timeout(timeout)),
    };

    let _ = tx.send(AttemptEvent::Finished(Box::new(FinishedAttempt {
        attempt_id,
        task: task_id,
        worker,
        attempt,
        started_at,
        finished_at: clock.now(),
        result,
    })));
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}
