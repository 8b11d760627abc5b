//! Outcome of one executor call.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured failure returned by an executor: a short machine code plus a message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ExecutorFailure {
    pub code: String,
    pub message: String,
}

impl ExecutorFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Why an attempt ended in `Failed`.
///
/// Routing problems never show up here: a task nobody can run is deferred
/// before dispatch and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    Timeout { after_ms: u64 },
    Executor(ExecutorFailure),
}

impl FailureReason {
    pub fn timeout(after: Duration) -> Self {
        FailureReason::Timeout {
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FailureReason::Timeout { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { after_ms } => write!(f, "Timeout after {after_ms}ms"),
            FailureReason::Executor(failure) => write!(f, "ExecutorFailure({failure})"),
        }
    }
}
