//! Priority Scorer.
//!
//! `priority = 2*impact - effort - 0.5*risk`
//!
//! 値は 0.5 刻みなので、内部では「半ポイント」単位の整数で持ちます
//! (`4*impact - 2*effort - risk`)。浮動小数の比較を避け、順序を完全に決定的にするためです。

use std::cmp::Ordering;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::{Score, Task, TaskId};

/// Task priority, stored in half points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Priority(i32);

impl Priority {
    pub fn from_scores(impact: Score, effort: Score, risk: Score) -> Self {
        let (i, e, r) = (
            i32::from(impact.get()),
            i32::from(effort.get()),
            i32::from(risk.get()),
        );
        Self(4 * i - 2 * e - r)
    }

    pub fn half_points(self) -> i32 {
        self.0
    }

    pub fn value(self) -> f64 {
        f64::from(self.0) / 2.0
    }

    /// How far `self` is above `other`, in priority units.
    pub fn lead_over(self, other: Priority) -> f64 {
        f64::from(self.0 - other.0) / 2.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.value())
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.value())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        let half_points = (value * 2.0).round();
        if !half_points.is_finite()
            || half_points < f64::from(i32::MIN)
            || half_points > f64::from(i32::MAX)
        {
            return Err(D::Error::custom(format!("priority {value} is out of range")));
        }
        // 範囲チェック済みなので切り捨ては起きない
        Ok(Self(half_points as i32))
    }
}

/// Sort key giving the total scheduling order.
///
/// Smaller keys run first:
/// 1. higher priority
/// 2. fewer unmet dependencies
/// 3. earlier intake order
/// 4. lexicographic task id
///
/// Task ids are unique, so two distinct tasks never compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityKey {
    pub priority: Priority,
    pub unmet_dependencies: usize,
    pub source_order: u64,
    pub id: TaskId,
}

impl PriorityKey {
    pub fn new(task: &Task, unmet_dependencies: usize) -> Self {
        Self {
            priority: task.priority(),
            unmet_dependencies,
            source_order: task.source_order,
            id: task.id.clone(),
        }
    }
}

impl Ord for PriorityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.unmet_dependencies.cmp(&other.unmet_dependencies))
            .then_with(|| self.source_order.cmp(&other.source_order))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for PriorityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
