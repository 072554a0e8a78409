//! Engine configuration, loaded from YAML.
//!
//! Every field has a default, so an empty file (or no file) is valid:
//!
//! ```yaml
//! node_id: worker-1
//! lock_duration_ms: 300000
//! backoff:
//!   initial_ms: 5000
//!   multiplier: 2.0
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lock owner written on acquired jobs. Must be unique per executor node.
    pub node_id: String,
    pub max_jobs_per_acquisition: usize,
    pub lock_duration_ms: u64,
    /// Sleep between executor polling cycles.
    pub acquire_interval_ms: u64,
    pub timer_reaper_batch: usize,
    /// Retries given to jobs whose definition does not say otherwise.
    pub default_job_retries: u32,
    pub backoff: BackoffConfig,
    pub version_conflict_retries: u32,
    /// Abort the command on expression failures instead of treating them as false.
    pub strict_expressions: bool,
    pub max_agenda_operations: usize,
    pub worker_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: format!("caseflow-{}", uuid::Uuid::now_v7()),
            max_jobs_per_acquisition: 10,
            lock_duration_ms: 5 * 60 * 1000,
            acquire_interval_ms: 1000,
            timer_reaper_batch: 50,
            default_job_retries: 3,
            backoff: BackoffConfig::default(),
            version_conflict_retries: 3,
            strict_expressions: false,
            max_agenda_operations: 10_000,
            worker_concurrency: 4,
        }
    }
}

/// Exponential retry delay: `initial_ms * multiplier^(attempt-1)`, capped at
/// `max_ms`, then reduced by up to `jitter` (a fraction in `0.0..=1.0`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 10_000,
            multiplier: 2.0,
            max_ms: 10 * 60 * 1000,
            jitter: 0.1,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if self.max_jobs_per_acquisition == 0 || self.worker_concurrency == 0 {
            anyhow::bail!("max_jobs_per_acquisition and worker_concurrency must be positive");
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            anyhow::bail!("backoff.jitter must be within 0.0..=1.0");
        }
        if self.backoff.multiplier < 1.0 {
            anyhow::bail!("backoff.multiplier must be at least 1.0");
        }
        Ok(())
    }
}
