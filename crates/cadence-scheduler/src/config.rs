//! Controller configuration.

use crate::redeployer::RetryPolicy;
use cadence_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Seconds since a job was triggered before it is retried as-is.
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,
    /// Seconds since the first retry before the pipeline restarts from the beginning.
    #[serde(default = "default_restart_after")]
    pub restart_after_secs: u64,
    /// Upgrader interval in seconds.
    #[serde(default = "default_upgrader_interval")]
    pub upgrader_interval_secs: u64,
    /// Failure redeployer interval in seconds.
    #[serde(default = "default_failure_redeployer_interval")]
    pub failure_redeployer_interval_secs: u64,
    /// Delayed trigger interval in seconds.
    #[serde(default = "default_delayed_trigger_interval")]
    pub delayed_trigger_interval_secs: u64,
}

fn default_retry_after() -> u64 {
    2 * 60 * 60
}

fn default_restart_after() -> u64 {
    12 * 60 * 60
}

fn default_upgrader_interval() -> u64 {
    60
}

fn default_failure_redeployer_interval() -> u64 {
    5 * 60
}

fn default_delayed_trigger_interval() -> u64 {
    30
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_after_secs: default_retry_after(),
            restart_after_secs: default_restart_after(),
            upgrader_interval_secs: default_upgrader_interval(),
            failure_redeployer_interval_secs: default_failure_redeployer_interval(),
            delayed_trigger_interval_secs: default_delayed_trigger_interval(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry_after_secs >= self.restart_after_secs {
            return Err(Error::Config(format!(
                "retry_after_secs ({}) must be less than restart_after_secs ({})",
                self.retry_after_secs, self.restart_after_secs
            )));
        }
        let intervals = [
            ("upgrader_interval_secs", self.upgrader_interval_secs),
            (
                "failure_redeployer_interval_secs",
                self.failure_redeployer_interval_secs,
            ),
            (
                "delayed_trigger_interval_secs",
                self.delayed_trigger_interval_secs,
            ),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_after: Duration::from_secs(self.retry_after_secs),
            restart_after: Duration::from_secs(self.restart_after_secs),
        }
    }

    pub fn upgrader_interval(&self) -> Duration {
        Duration::from_secs(self.upgrader_interval_secs)
    }

    pub fn failure_redeployer_interval(&self) -> Duration {
        Duration::from_secs(self.failure_redeployer_interval_secs)
    }

    pub fn delayed_trigger_interval(&self) -> Duration {
        Duration::from_secs(self.delayed_trigger_interval_secs)
    }
}
