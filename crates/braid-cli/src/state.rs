//! `.braid/` state directory.
//!
//! - `state.json`: task records, artifact store, integration history
//! - `running`: 実行中の batch があることを示すマーカー（中身は pid）
//! - `cancel`: `braid cancel-batch` が置くマーカー。実行中の batch がポーリングする

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use braid_core::domain::IntegrationRecord;
use braid_core::impls::InMemoryArtifactStore;
use braid_core::schedule::{TaskBoard, TaskRecord};
use braid_core::EngineParts;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const STATE_FILE: &str = "state.json";
const RUNNING_FILE: &str = "running";
const CANCEL_FILE: &str = "cancel";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub store: InMemoryArtifactStore,
    #[serde(default)]
    pub history: Vec<IntegrationRecord>,
}

impl PersistedState {
    pub fn from_parts(parts: EngineParts<InMemoryArtifactStore>) -> Self {
        Self {
            tasks: parts.board.records().cloned().collect(),
            store: parts.store,
            history: parts.history,
        }
    }

    pub fn into_parts(self) -> EngineParts<InMemoryArtifactStore> {
        EngineParts {
            board: TaskBoard::from_records(self.tasks),
            store: self.store,
            history: self.history,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Missing state file means a fresh board.
    pub async fn load(&self) -> Result<PersistedState> {
        let path = self.path(STATE_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        serde_json::from_slice(&bytes).with_context(|| format!("corrupt state file {}", path.display()))
    }

    /// 一時ファイルに書いてから rename（途中で落ちても古い state が残る）
    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path("state.json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, self.path(STATE_FILE)).await?;
        debug!(dir = %self.root.display(), tasks = state.tasks.len(), "state saved");
        Ok(())
    }

    /// Claims the directory for one batch. Fails if another batch holds it.
    pub fn begin_batch(&self) -> Result<RunningGuard> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let running = self.path(RUNNING_FILE);
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&running) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!(
                    "a batch is already running in {} (remove {} if it crashed)",
                    self.root.display(),
                    running.display()
                );
            }
            Err(e) => return Err(e).with_context(|| format!("failed to create {}", running.display())),
        }
        std::fs::write(&running, std::process::id().to_string())?;
        // 前回の残りで即 cancel しないように
        remove_if_exists(&self.path(CANCEL_FILE));
        Ok(RunningGuard {
            running,
            cancel: self.path(CANCEL_FILE),
        })
    }

    pub fn is_running(&self) -> bool {
        self.path(RUNNING_FILE).exists()
    }

    /// Leaves a cancel marker for the running batch. `false` if none is running.
    pub fn request_cancel(&self) -> Result<bool> {
        if !self.is_running() {
            return Ok(false);
        }
        let cancel = self.path(CANCEL_FILE);
        std::fs::write(&cancel, b"")
            .with_context(|| format!("failed to write {}", cancel.display()))?;
        Ok(true)
    }

    pub async fn cancel_requested(&self) -> bool {
        tokio::fs::try_exists(self.path(CANCEL_FILE))
            .await
            .unwrap_or(false)
    }
}

/// Removes the running and cancel markers on drop.
#[derive(Debug)]
pub struct RunningGuard {
    running: PathBuf,
    cancel: PathBuf,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        remove_if_exists(&self.cancel);
        remove_if_exists(&self.running);
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove marker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use braid_core::domain::{ArtifactMutation, BatchId, MutationFingerprint, Task, TaskId};
    use braid_core::ports::ArtifactStore;
    use ulid::Ulid;

    #[tokio::test]
    async fn missing_state_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path().join(".braid")).load().await.unwrap();
        assert!(state.tasks.is_empty());
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn saved_state_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = StateDir::new(dir.path().join(".braid"));

        let mut board = TaskBoard::new();
        board.insert(Task::new("t1", "Write docs", ["documentation"])).unwrap();
        board.refresh_readiness().unwrap();
        let mut store = InMemoryArtifactStore::new();
        let mutation = ArtifactMutation::create("README.md", "hello");
        store.begin();
        store
            .apply(&MutationFingerprint::of(&"t1".into(), 0, &mutation), &mutation)
            .unwrap();
        store.commit(BatchId::from(Ulid::new()));

        let parts = EngineParts { board, store, history: Vec::new() };
        state_dir.save(&PersistedState::from_parts(parts)).await.unwrap();

        let loaded = state_dir.load().await.unwrap().into_parts();
        assert_eq!(loaded.board.len(), 1);
        assert_eq!(loaded.board.ready_queue(), vec![TaskId::new("t1")]);
        assert_eq!(loaded.store.version(&"README.md".into()), 1);
    }

    #[tokio::test]
    async fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{not json").unwrap();
        let err = StateDir::new(dir.path()).load().await.unwrap_err();
        assert!(err.to_string().contains("corrupt state file"));
    }

    #[tokio::test]
    async fn cancel_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = StateDir::new(dir.path());

        assert!(!state_dir.request_cancel().unwrap());

        let guard = state_dir.begin_batch().unwrap();
        assert!(state_dir.is_running());
        assert!(!state_dir.cancel_requested().await);
        assert!(state_dir.request_cancel().unwrap());
        assert!(state_dir.cancel_requested().await);

        drop(guard);
        assert!(!state_dir.is_running());
        assert!(!state_dir.cancel_requested().await);
    }

    #[test]
    fn second_batch_is_refused_while_one_runs() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = StateDir::new(dir.path());
        let _guard = state_dir.begin_batch().unwrap();
        let err = state_dir.begin_batch().unwrap_err();
        assert!(err.to_string().contains("already running"));
    }
}
