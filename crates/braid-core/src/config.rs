//! Engine configuration loaded from `braid.toml`.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! valid configuration. `BRAID_TASK_TIMEOUT_SECS` and `BRAID_RETRY_BUDGET`
//! take precedence over the file.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::{KeywordRule, KeywordTable};
use crate::domain::{CapabilityTag, DefaultDecider, WorkerId};
use crate::error::BraidError;
use crate::routing::WorkerDescriptor;
use crate::schedule::retry::MAX_RETRY_DELAY;
use crate::schedule::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "braid.toml";

pub const ENV_TASK_TIMEOUT_SECS: &str = "BRAID_TASK_TIMEOUT_SECS";
pub const ENV_RETRY_BUDGET: &str = "BRAID_RETRY_BUDGET";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub integrator: IntegratorConfig,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,

    #[serde(default)]
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Per-attempt executor timeout.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Retries after the first failed attempt.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default)]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
}

fn default_task_timeout_secs() -> u64 {
    30
}

fn default_retry_budget() -> u32 {
    1
}

fn default_retry_multiplier() -> f64 {
    2.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout_secs(),
            retry_budget: default_retry_budget(),
            retry_base_delay_ms: 0,
            retry_multiplier: default_retry_multiplier(),
        }
    }
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_multiplier,
        )
    }

    pub fn decider(&self) -> DefaultDecider {
        DefaultDecider::new(self.retry_budget, self.retry_policy())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratorConfig {
    /// Tie-break for a delete against a write at the same top priority (rule 3).
    ///
    /// Rule 3 only sees tasks tied on priority, so the delete's lead is always 0
    /// there: with the default 0.0 the write wins, and only a negative margin lets
    /// the delete win. A delete with strictly higher priority already wins by rule 1.
    #[serde(default)]
    pub delete_margin: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: WorkerId,
    pub capabilities: BTreeSet<CapabilityTag>,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// External program run for each task (used by the CLI).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

fn default_max_concurrent() -> u32 {
    1
}

impl WorkerConfig {
    pub fn descriptor(&self) -> WorkerDescriptor {
        WorkerDescriptor::new(
            self.id.clone(),
            self.capabilities.iter().cloned(),
            self.max_concurrent,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Extra rows appended to the built-in keyword table.
    #[serde(default)]
    pub keywords: Vec<KeywordRule>,
}

impl ClassifierConfig {
    pub fn keyword_table(&self) -> KeywordTable {
        let mut table = KeywordTable::builtin();
        table.extend(self.keywords.iter().cloned());
        table
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, BraidError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, BraidError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`EngineConfig::load`], but a missing file means defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, BraidError> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// 環境変数はファイルより優先（空文字は無視）
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), BraidError> {
        if let Some(raw) = lookup(ENV_TASK_TIMEOUT_SECS)
            && !raw.trim().is_empty()
        {
            self.scheduler.task_timeout_secs = raw.trim().parse().map_err(|_| {
                BraidError::Config(format!("{ENV_TASK_TIMEOUT_SECS} must be an integer, got \"{raw}\""))
            })?;
        }
        if let Some(raw) = lookup(ENV_RETRY_BUDGET)
            && !raw.trim().is_empty()
        {
            self.scheduler.retry_budget = raw.trim().parse().map_err(|_| {
                BraidError::Config(format!("{ENV_RETRY_BUDGET} must be an integer, got \"{raw}\""))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BraidError> {
        if self.scheduler.task_timeout_secs == 0 {
            return Err(BraidError::Config(
                "scheduler.task_timeout_secs must be greater than 0".into(),
            ));
        }
        if !self.scheduler.retry_multiplier.is_finite() || self.scheduler.retry_multiplier < 1.0 {
            return Err(BraidError::Config(
                "scheduler.retry_multiplier must be a finite number >= 1.0".into(),
            ));
        }
        if self
            .scheduler
            .retry_policy()
            .exceeds_cap(self.scheduler.retry_budget)
        {
            return Err(BraidError::Config(format!(
                "scheduler.retry_base_delay_ms and retry_multiplier give a backoff above {}s within retry_budget",
                MAX_RETRY_DELAY.as_secs()
            )));
        }
        if !self.integrator.delete_margin.is_finite() {
            return Err(BraidError::Config(
                "integrator.delete_margin must be finite".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        for worker in &self.workers {
            if !seen.insert(&worker.id) {
                return Err(BraidError::Config(format!("duplicate worker id {}", worker.id)));
            }
            if worker.max_concurrent == 0 {
                return Err(BraidError::Config(format!(
                    "worker {} must have max_concurrent >= 1",
                    worker.id
                )));
            }
            if worker.capabilities.iter().all(CapabilityTag::is_empty) {
                return Err(BraidError::Config(format!(
                    "worker {} declares no capabilities",
                    worker.id
                )));
            }
            if worker.command.as_ref().is_some_and(Vec::is_empty) {
                return Err(BraidError::Config(format!(
                    "worker {} has an empty command",
                    worker.id
                )));
            }
        }
        Ok(())
    }
}
