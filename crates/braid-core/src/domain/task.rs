//! Task: the canonical record flowing through classify → schedule → integrate.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{CapabilityTag, TaskId};
use crate::priority::Priority;

/// Raised when an impact/effort/risk value falls outside 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("score {0} is outside 1..=5")]
pub struct InvalidScore(pub u32);

/// Impact / effort / risk score, always within 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// Value used when neither the source nor the keyword tables say anything.
    pub const NEUTRAL: Score = Score(3);

    pub fn new(value: u32) -> Result<Self, InvalidScore> {
        if (u32::from(Self::MIN)..=u32::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(InvalidScore(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Score {
    type Error = InvalidScore;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(u32::from(value))
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> Self {
        score.0
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work with priority inputs, dependencies and a required capability set.
///
/// Status, attempts and results are tracked separately on
/// [`TaskRecord`](crate::schedule::TaskRecord); the task itself only changes
/// when it is explicitly re-scored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Where the task came from (file + line, external report id). Never resolved.
    pub source_ref: String,

    /// Insertion order at intake. Second tie-break level of the priority order.
    pub source_order: u64,

    pub tags: BTreeSet<CapabilityTag>,
    pub impact: Score,
    pub effort: Score,
    pub risk: Score,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<TaskId>,

    /// Textual dependency references the classifier could not resolve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependency_hints: Vec<String>,
}

impl Task {
    /// Creates a task with neutral scores and no dependencies.
    pub fn new<I, T>(id: impl Into<TaskId>, title: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CapabilityTag>,
    {
        let id = id.into();
        Self {
            source_ref: id.to_string(),
            id,
            title: title.into(),
            description: String::new(),
            source_order: 0,
            tags: tags.into_iter().map(Into::into).collect(),
            impact: Score::NEUTRAL,
            effort: Score::NEUTRAL,
            risk: Score::NEUTRAL,
            depends_on: BTreeSet::new(),
            dependency_hints: Vec::new(),
        }
    }

    pub fn with_scores(mut self, impact: Score, effort: Score, risk: Score) -> Self {
        self.impact = impact;
        self.effort = effort;
        self.risk = risk;
        self
    }

    pub fn with_source(mut self, source_ref: impl Into<String>, source_order: u64) -> Self {
        self.source_ref = source_ref.into();
        self.source_order = source_order;
        self
    }

    pub fn depending_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Derived priority. Never stored, so it cannot drift from the scores.
    pub fn priority(&self) -> Priority {
        Priority::from_scores(self.impact, self.effort, self.risk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, false)]
    #[case::min(1, true)]
    #[case::max(5, true)]
    #[case::above(6, false)]
    fn score_range_is_enforced(#[case] raw: u32, #[case] ok: bool) {
        assert_eq!(Score::new(raw).is_ok(), ok);
    }

    #[test]
    fn score_rejects_out_of_range_on_deserialize() {
        assert!(serde_json::from_str::<Score>("7").is_err());
        assert_eq!(serde_json::from_str::<Score>("4").unwrap().get(), 4);
    }

    #[test]
    fn new_task_uses_neutral_scores() {
        let task = Task::new("t1", "Compile release", ["build"]);
        assert_eq!(task.impact, Score::NEUTRAL);
        assert!(task.tags.contains(&CapabilityTag::new("build")));
        assert!(task.depends_on.is_empty());
    }
}
