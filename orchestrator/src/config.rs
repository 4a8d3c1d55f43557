//! Orchestrator configuration.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// What happens to in-flight tasks when a run is cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Let running tasks finish and keep their results.
    #[default]
    Drain,
    /// Abort running tasks and mark them cancelled.
    Abandon,
}

/// Engine-level settings, typically read from a `[orchestrator]`-style TOML
/// document. Crew-level switches live on the `Crew` itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently running tasks. `None` runs every ready
    /// task at once.
    pub max_concurrency: Option<usize>,
    pub cancel_policy: CancelPolicy,
    /// Cancels the run once this many milliseconds have elapsed.
    pub timeout_ms: Option<u64>,
    /// Re-dispatch failed tasks (and the dependents they caused to be
    /// skipped) when resuming from a checkpoint.
    pub retry_failed_on_resume: bool,
}

impl OrchestratorConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_cancel_policy(mut self, cancel_policy: CancelPolicy) -> Self {
        self.cancel_policy = cancel_policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_retry_failed_on_resume(mut self, retry: bool) -> Self {
        self.retry_failed_on_resume = retry;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Effective in-flight limit; never below one.
    pub(crate) fn concurrency_limit(&self) -> usize {
        self.max_concurrency.unwrap_or(usize::MAX).max(1)
    }
}
