//! In-memory ArtifactStore.
//!
//! transaction は begin 時点のスナップショット（clone）で実現しています。
//! rollback はスナップショットを書き戻すだけです。

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{
    ArtifactId, ArtifactMutation, BatchId, LinePatch, MutationFingerprint, MutationKind, Payload,
};
use crate::error::ApplyError;
use crate::ports::ArtifactStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArtifactContent {
    Text(String),
    Structured(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub version: u64,
    /// Tombstone: the artifact was deleted at `version`.
    #[serde(default)]
    pub deleted: bool,
    pub content: ArtifactContent,
}

impl Artifact {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            ArtifactContent::Text(text) if !self.deleted => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    artifacts: BTreeMap<ArtifactId, Artifact>,
    applied: BTreeSet<MutationFingerprint>,
    committed: BTreeSet<BatchId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryArtifactStore {
    artifacts: BTreeMap<ArtifactId, Artifact>,
    #[serde(default)]
    applied: BTreeSet<MutationFingerprint>,
    #[serde(default)]
    committed: BTreeSet<BatchId>,
    #[serde(skip)]
    snapshot: Option<Snapshot>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, artifact: &ArtifactId) -> Option<&Artifact> {
        self.artifacts.get(artifact)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = (&ArtifactId, &Artifact)> {
        self.artifacts.iter()
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

fn patch_text(artifact: &ArtifactId, text: &str, patch: &LinePatch) -> Result<String, ApplyError> {
    let mut lines: Vec<&str> = text.lines().collect();
    if patch.start > patch.end || patch.end > lines.len() {
        return Err(ApplyError::PatchOutOfRange {
            artifact: artifact.clone(),
            start: patch.start,
            end: patch.end,
            len: lines.len(),
        });
    }
    lines.splice(patch.range(), patch.lines.iter().map(String::as_str));
    let mut out = lines.join("\n");
    if text.ends_with('\n') || (text.is_empty() && !out.is_empty()) {
        out.push('\n');
    }
    Ok(out)
}

fn next_content(
    artifact: &ArtifactId,
    previous: Option<&ArtifactContent>,
    payload: &Payload,
) -> Result<ArtifactContent, ApplyError> {
    match payload {
        Payload::Replace(text) => Ok(ArtifactContent::Text(text.clone())),
        Payload::Opaque(value) => Ok(ArtifactContent::Structured(value.clone())),
        Payload::Patch(patch) => match previous {
            None => Ok(ArtifactContent::Text(patch_text(artifact, "", patch)?)),
            Some(ArtifactContent::Text(text)) => {
                Ok(ArtifactContent::Text(patch_text(artifact, text, patch)?))
            }
            Some(ArtifactContent::Structured(_)) => Err(ApplyError::PatchOnStructured {
                artifact: artifact.clone(),
            }),
        },
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn version(&self, artifact: &ArtifactId) -> u64 {
        self.artifacts.get(artifact).map_or(0, |a| a.version)
    }

    fn exists(&self, artifact: &ArtifactId) -> bool {
        self.artifacts.get(artifact).is_some_and(|a| !a.deleted)
    }

    fn begin(&mut self) {
        self.snapshot = Some(Snapshot {
            artifacts: self.artifacts.clone(),
            applied: self.applied.clone(),
            committed: self.committed.clone(),
        });
    }

    fn apply(
        &mut self,
        fingerprint: &MutationFingerprint,
        mutation: &ArtifactMutation,
    ) -> Result<u64, ApplyError> {
        let id = &mutation.artifact_id;
        let current = self.version(id);
        if mutation.base_version != current {
            return Err(ApplyError::StaleBase {
                artifact: id.clone(),
                base: mutation.base_version,
                current,
            });
        }

        let exists = self.exists(id);
        let previous = self.artifacts.get(id).filter(|a| !a.deleted);
        let next = match mutation.kind {
            MutationKind::Create if exists => {
                return Err(ApplyError::AlreadyExists {
                    artifact: id.clone(),
                });
            }
            MutationKind::Update | MutationKind::Delete if !exists => {
                return Err(ApplyError::Missing {
                    artifact: id.clone(),
                });
            }
            MutationKind::Create => Artifact {
                version: current + 1,
                deleted: false,
                content: next_content(id, None, &mutation.payload)?,
            },
            MutationKind::Update => Artifact {
                version: current + 1,
                deleted: false,
                content: next_content(id, previous.map(|a| &a.content), &mutation.payload)?,
            },
            MutationKind::Delete => Artifact {
                version: current + 1,
                deleted: true,
                content: previous
                    .map(|a| a.content.clone())
                    .unwrap_or(ArtifactContent::Text(String::new())),
            },
        };

        let version = next.version;
        self.artifacts.insert(id.clone(), next);
        self.applied.insert(fingerprint.clone());
        debug!(artifact = %id, version, kind = ?mutation.kind, "mutation applied");
        Ok(version)
    }

    fn commit(&mut self, batch: BatchId) {
        self.snapshot = None;
        self.committed.insert(batch);
    }

    fn rollback(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.artifacts = snapshot.artifacts;
            self.applied = snapshot.applied;
            self.committed = snapshot.committed;
        }
    }

    fn is_applied(&self, fingerprint: &MutationFingerprint) -> bool {
        self.applied.contains(fingerprint)
    }

    fn is_committed(&self, batch: &BatchId) -> bool {
        self.committed.contains(batch)
    }
}
