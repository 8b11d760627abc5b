//! Executor: the external routine that actually performs a task.
//!
//! executor は worker ごとに 1 つ登録します。
//! 返すのは mutation の提案だけで、artifact には触れません。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ArtifactMutation, ExecutorFailure, Task, WorkerId};
use crate::error::BuildError;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        task: &Task,
        worker: &WorkerId,
    ) -> Result<Vec<ArtifactMutation>, ExecutorFailure>;
}

/// worker_id -> executor.
///
/// 初期化時に組み立てて、実行中は読むだけ（ロック不要）。
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: BTreeMap<WorkerId, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        worker: WorkerId,
        executor: Arc<dyn Executor>,
    ) -> Result<(), BuildError> {
        if self.executors.contains_key(&worker) {
            return Err(BuildError::DuplicateExecutor(worker));
        }
        self.executors.insert(worker, executor);
        Ok(())
    }

    pub fn get(&self, worker: &WorkerId) -> Option<&Arc<dyn Executor>> {
        self.executors.get(worker)
    }

    pub fn contains(&self, worker: &WorkerId) -> bool {
        self.executors.contains_key(worker)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.executors.keys()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
