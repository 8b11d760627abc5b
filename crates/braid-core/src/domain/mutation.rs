//! ArtifactMutation: a proposed change to a shared artifact.
//!
//! Executors only ever produce these; artifact versions move exclusively
//! inside the integrator's commit.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::ids::{ArtifactId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// Replaces lines `start..end` (0-based, end exclusive) with `lines`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinePatch {
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub lines: Vec<String>,
}

impl LinePatch {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Two patches are independent when their line ranges do not touch.
    ///
    /// Pure insertions (`start == end`) at the same position are ordered
    /// ambiguously and therefore count as overlapping.
    pub fn is_disjoint(&self, other: &LinePatch) -> bool {
        if self.start == other.start {
            return false;
        }
        self.end <= other.start || other.end <= self.start
    }
}

/// Opaque change description. The engine only looks inside `Patch`
/// to prove that concurrent changes do not overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Replace(String),
    Patch(LinePatch),
    Opaque(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMutation {
    pub artifact_id: ArtifactId,
    /// Version of the artifact the mutation was computed against (0: never existed).
    pub base_version: u64,
    pub kind: MutationKind,
    pub payload: Payload,
}

impl ArtifactMutation {
    pub fn create(artifact: impl Into<ArtifactId>, content: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact.into(),
            base_version: 0,
            kind: MutationKind::Create,
            payload: Payload::Replace(content.into()),
        }
    }

    pub fn update(artifact: impl Into<ArtifactId>, base_version: u64, payload: Payload) -> Self {
        Self {
            artifact_id: artifact.into(),
            base_version,
            kind: MutationKind::Update,
            payload,
        }
    }

    pub fn delete(artifact: impl Into<ArtifactId>, base_version: u64) -> Self {
        Self {
            artifact_id: artifact.into(),
            base_version,
            kind: MutationKind::Delete,
            payload: Payload::Opaque(serde_json::Value::Null),
        }
    }

    pub fn as_patch(&self) -> Option<&LinePatch> {
        match &self.payload {
            Payload::Patch(patch) => Some(patch),
            _ => None,
        }
    }
}

/// Identity of one mutation inside the committed ledger.
///
/// `ordinal` is the position in the producing task's result list, so two
/// identical mutations from the same task stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutationFingerprint {
    pub task_id: TaskId,
    pub artifact_id: ArtifactId,
    pub base_version: u64,
    pub ordinal: usize,
}

impl MutationFingerprint {
    pub fn of(task_id: &TaskId, ordinal: usize, mutation: &ArtifactMutation) -> Self {
        Self {
            task_id: task_id.clone(),
            artifact_id: mutation.artifact_id.clone(),
            base_version: mutation.base_version,
            ordinal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn patch(start: usize, end: usize) -> LinePatch {
        LinePatch {
            start,
            end,
            lines: vec![],
        }
    }

    #[rstest]
    #[case::apart(patch(0, 2), patch(5, 6), true)]
    #[case::adjacent(patch(0, 2), patch(2, 4), true)]
    #[case::overlapping(patch(0, 3), patch(2, 4), false)]
    #[case::nested(patch(0, 10), patch(2, 4), false)]
    #[case::same_insert_point(patch(3, 3), patch(3, 3), false)]
    fn patch_disjointness(#[case] a: LinePatch, #[case] b: LinePatch, #[case] disjoint: bool) {
        assert_eq!(a.is_disjoint(&b), disjoint);
        assert_eq!(b.is_disjoint(&a), disjoint);
    }

    #[test]
    fn payload_is_tagged() {
        let m = ArtifactMutation::update(
            "config.yaml",
            1,
            Payload::Patch(LinePatch {
                start: 0,
                end: 1,
                lines: vec!["a: 1".into()],
            }),
        );
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["payload"]["type"], "patch");
        assert_eq!(v["payload"]["value"]["start"], 0);
        assert_eq!(v["kind"], "Update");
    }
}
