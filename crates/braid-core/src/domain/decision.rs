//! Decision model: what happens after an attempt fails.
//!
//! The Decider is a pure function: given the task record and the failure,
//! it returns the next action. Applying it (re-queueing, pinning, recording
//! the DecisionRecord) is the scheduler's job.

use std::time::Duration;

use super::outcome::FailureReason;
use crate::schedule::{RetryPolicy, TaskRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back to Ready on the same worker after `delay`.
    Retry { delay: Duration, reason: String },

    /// The retry budget is spent; the task stays Failed.
    GiveUp { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, failure: &FailureReason) -> Decision;
}

/// Budget-based retry with exponential backoff.
///
/// `retry_budget` counts retries, not attempts: a budget of 1 allows
/// two executor calls in total.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_budget: u32,
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_budget: u32, retry_policy: RetryPolicy) -> Self {
        Self {
            retry_budget,
            retry_policy,
        }
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(1, RetryPolicy::immediate())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, failure: &FailureReason) -> Decision {
        let retries_used = task.attempts.saturating_sub(1);
        if retries_used >= self.retry_budget {
            Decision::GiveUp {
                reason: format!(
                    "{failure}; retry budget spent ({retries_used}/{})",
                    self.retry_budget
                ),
            }
        } else {
            let delay = self.retry_policy.next_delay(task.attempts);
            Decision::Retry {
                delay,
                reason: format!(
                    "{failure}; retry {}/{} after {delay:?}",
                    retries_used + 1,
                    self.retry_budget
                ),
            }
        }
    }
}
