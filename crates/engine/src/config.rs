//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

/// How a new work item is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    /// Give it to the least-loaded eligible worker
    Greedy,
    /// Even out eligible workers first, then give it to the least-loaded
    #[default]
    Rebalance,
}

impl std::str::FromStr for AssignmentPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "greedy" => Ok(AssignmentPolicy::Greedy),
            "rebalance" => Ok(AssignmentPolicy::Rebalance),
            other => Err(ConfigError::Invalid(format!("unknown policy: {other}"))),
        }
    }
}

/// What reassigning an item to the worker that already holds it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameWorkerPolicy {
    /// Leave the assignment and history untouched
    #[default]
    NoOp,
    /// Bump `assigned_at` and append a history entry
    Refresh,
}

/// Configuration for the assignment engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Policy for new items and for reassigning unassigned items
    pub policy: AssignmentPolicy,
    /// Behaviour of a reassignment onto the current worker
    pub same_worker: SameWorkerPolicy,
    /// Upper bound on one operation, lock wait included
    pub operation_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: AssignmentPolicy::default(),
            same_worker: SameWorkerPolicy::default(),
            operation_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Operation timeout as a [`Duration`].
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Set the assignment policy.
    pub fn with_policy(mut self, policy: AssignmentPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the same-worker reassignment policy.
    pub fn with_same_worker(mut self, same_worker: SameWorkerPolicy) -> Self {
        self.same_worker = same_worker;
        self
    }

    /// Set the operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "operation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config {path}: {reason}")]
    Read {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        reason: String,
    },

    /// File is not valid TOML for [`EngineConfig`]
    #[error("failed to parse config {path}: {reason}")]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        reason: String,
    },

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(String),
}
