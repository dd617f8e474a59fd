//! Configuration module
//!
//! Handles loading and managing configuration.

mod env;
mod file;

pub use env::{print_env_help, EnvConfig};
pub use file::{expand_path, CONFIG_LOCATIONS};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::RetryPolicy;
use crate::monitor::MonitorConfig;
use crate::queue::QueueConfig;
use crate::registry::RegistryConfig;
use crate::router::RouterConfig;

/// Application configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub workers: WorkerConfig,
    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
    pub registry: RegistryConfig,
    pub router: RouterConfig,
}

/// Worker pool and per-unit time limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Units executing at once
    pub concurrency: usize,

    /// Soft limit: the unit is interrupted and its cleanup hook runs
    pub soft_time_limit_secs: u64,

    /// Hard limit: the queue drops the unit and records a failure
    pub hard_time_limit_secs: u64,

    /// How long a closed group's bookkeeping stays in the store
    pub result_retention_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            soft_time_limit_secs: 300,
            hard_time_limit_secs: 360,
            result_retention_secs: 86_400,
        }
    }
}

impl WorkerConfig {
    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency,
            hard_time_limit: Duration::from_secs(self.hard_time_limit_secs),
            result_retention: self.result_retention(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if file::is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if file::is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolve the effective configuration.
    ///
    /// An explicit path wins, then `SUITE_CONDUCTOR_CONFIG`, then the standard
    /// locations; environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let env = EnvConfig::load();
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env.config_file.as_deref().map(expand_path))
            .or_else(file::find);

        let mut config = match &path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        env.apply(&mut config);
        config.validate()?;
        Ok((config, path))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers.concurrency == 0 {
            anyhow::bail!("workers.concurrency must be at least 1");
        }
        if self.workers.soft_time_limit_secs == 0 {
            anyhow::bail!("workers.soft_time_limit_secs must be positive");
        }
        if self.workers.hard_time_limit_secs < self.workers.soft_time_limit_secs {
            anyhow::bail!(
                "workers.hard_time_limit_secs ({}) must not be below the soft limit ({})",
                self.workers.hard_time_limit_secs,
                self.workers.soft_time_limit_secs
            );
        }
        if self.workers.result_retention_secs == 0 {
            anyhow::bail!("workers.result_retention_secs must be positive");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.base_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.monitor.stuck_threshold_minutes == 0 {
            anyhow::bail!("monitor.stuck_threshold_minutes must be positive");
        }
        if self.registry.refresh_interval_secs == 0
            || self.registry.refresh_interval_secs >= self.registry.ttl_secs
        {
            anyhow::bail!(
                "registry.refresh_interval_secs must be positive and below ttl_secs ({})",
                self.registry.ttl_secs
            );
        }
        if self.router.timeout_ms == 0 {
            anyhow::bail!("router.timeout_ms must be positive");
        }
        if self.router.request_channel.is_empty() {
            anyhow::bail!("router.request_channel must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.monitor.stuck_threshold_minutes, 30);
        assert_eq!(config.registry.ttl_secs, 3600);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load_yaml_and_json() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.workers.concurrency = 16;
        config.router.timeout_ms = 5_000;

        for name in ["config.yaml", "nested/config.json"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            assert_eq!(AppConfig::load(&path).unwrap(), config);
        }
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.yaml");
        std::fs::write(&path, "workers:\n  concurrency: 2\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.workers.concurrency, 2);
        assert_eq!(config.workers.hard_time_limit_secs, 360);
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let mut config = AppConfig::default();
        config.workers.hard_time_limit_secs = 10;
        config.workers.soft_time_limit_secs = 20;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.registry.refresh_interval_secs = config.registry.ttl_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.workers.result_retention_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_config_conversion() {
        let queue = WorkerConfig::default().queue_config();
        assert_eq!(queue.concurrency, 4);
        assert_eq!(queue.hard_time_limit, Duration::from_secs(360));
    }
}
