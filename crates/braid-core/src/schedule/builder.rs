//! SchedulerBuilder - scheduler の構築とワイヤリング
//!
//! # Fail-fast
//! build() の時点で「登録済み worker ⊆ executor が bind された worker」を確認します。
//! 実行途中で「この worker は誰が動かすの？」とならないようにするためです。

use std::sync::Arc;
use std::time::Duration;

use super::executor::{Executor, ExecutorRegistry};
use super::Scheduler;
use crate::domain::{Decider, DefaultDecider, WorkerId};
use crate::error::{BuildError, RegistryError};
use crate::impls::TracingSink;
use crate::ports::{Clock, EventSink, IdGenerator, SystemClock, UlidGenerator};
use crate::routing::{CapabilityRegistry, Router, WorkerDescriptor};

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .register_worker(WorkerDescriptor::new("w1", ["build"], 1))?
///     .bind_executor("w1", Arc::new(MyExecutor))?
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    registry: CapabilityRegistry,
    executors: ExecutorRegistry,
    timeout: Duration,
    decider: Option<Arc<dyn Decider>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            registry: CapabilityRegistry::new(),
            executors: ExecutorRegistry::new(),
            timeout: DEFAULT_TASK_TIMEOUT,
            decider: None,
            events: None,
            clock: None,
            ids: None,
        }
    }

    pub fn register_worker(mut self, descriptor: WorkerDescriptor) -> Result<Self, RegistryError> {
        self.registry.register(descriptor)?;
        Ok(self)
    }

    pub fn bind_executor(
        mut self,
        worker: impl Into<WorkerId>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self, BuildError> {
        self.executors.register(worker.into(), executor)?;
        Ok(self)
    }

    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        if let Some(unknown) = self
            .executors
            .workers()
            .find(|w| !self.registry.contains(w))
        {
            return Err(BuildError::UnknownWorker(unknown.clone()));
        }

        let missing: Vec<WorkerId> = self
            .registry
            .descriptors()
            .filter(|d| !self.executors.contains(&d.id))
            .map(|d| d.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingExecutors(missing));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        Ok(Scheduler {
            router: Router::new(Arc::new(self.registry)),
            executors: self.executors,
            timeout: self.timeout,
            decider: self
                .decider
                .unwrap_or_else(|| Arc::new(DefaultDecider::default())),
            events: self.events.unwrap_or_else(|| Arc::new(TracingSink)),
            clock,
            ids,
        })
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactMutation, ExecutorFailure, Task};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Executor for Noop {
        async fn execute(
            &self,
            _task: &Task,
            _worker: &WorkerId,
        ) -> Result<Vec<ArtifactMutation>, ExecutorFailure> {
            Ok(vec![])
        }
    }

    #[test]
    fn build_success() {
        let scheduler = SchedulerBuilder::new()
            .register_worker(WorkerDescriptor::new("w1", ["build"], 1))
            .unwrap()
            .bind_executor("w1", Arc::new(Noop))
            .unwrap()
            .build();
        assert!(scheduler.is_ok());
    }

    #[test]
    fn build_missing_executors() {
        let scheduler = SchedulerBuilder::new()
            .register_worker(WorkerDescriptor::new("w1", ["build"], 1))
            .unwrap()
            .register_worker(WorkerDescriptor::new("w2", ["testing"], 1))
            .unwrap()
            .bind_executor("w1", Arc::new(Noop))
            .unwrap()
            .build();
        assert!(matches!(
            scheduler,
            Err(BuildError::MissingExecutors(missing)) if missing == vec![WorkerId::new("w2")]
        ));
    }

    #[test]
    fn build_unknown_worker() {
        let scheduler = SchedulerBuilder::new()
            .bind_executor("ghost", Arc::new(Noop))
            .unwrap()
            .build();
        assert!(matches!(
            scheduler,
            Err(BuildError::UnknownWorker(id)) if id == WorkerId::new("ghost")
        ));
    }

    #[test]
    fn register_rejects_zero_capacity() {
        let res = SchedulerBuilder::new().register_worker(WorkerDescriptor::new("w1", ["build"], 0));
        assert!(matches!(res, Err(RegistryError::ZeroCapacity(_))));
    }
}
