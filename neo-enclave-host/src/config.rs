//! Host configuration management.

use crate::logging::LogConfig;
use anyhow::{bail, Context};
use neo_enclave::{EnclaveConfig, StorageBackendKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Enclave configuration, passed through unchanged
    pub enclave: EnclaveConfig,
    /// Logging configuration
    pub logging: LogConfig,
    /// Schedule trigger driver
    pub scheduler: SchedulerConfig,
    /// Prometheus textfile export
    pub metrics: MetricsConfig,
}

/// Drives `process_scheduled_triggers` from the host clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Seconds between scheduler ticks
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 1,
        }
    }
}

/// Periodically writes the enclave's metrics to a Prometheus textfile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Target file, replaced atomically on every export
    pub textfile: PathBuf,
    /// Seconds between exports
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            textfile: PathBuf::from("./data/metrics/neo_enclave.prom"),
            interval_secs: 15,
        }
    }
}

impl HostConfig {
    /// Load configuration from `path`, writing the defaults there first if
    /// the file does not exist.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        let config = Self::default();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        config.save_to_file(path)?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: HostConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// Apply command line overrides.
    pub fn with_overrides(mut self, data_dir: Option<PathBuf>, in_memory: bool) -> Self {
        if let Some(data_dir) = data_dir {
            self.enclave.data_dir = data_dir;
        }
        if in_memory {
            self.enclave.storage_backend = StorageBackendKind::Memory;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.enabled && self.scheduler.poll_interval_secs == 0 {
            bail!("scheduler.poll_interval_secs must be greater than 0");
        }
        if self.metrics.enabled {
            if self.metrics.interval_secs == 0 {
                bail!("metrics.interval_secs must be greater than 0");
            }
            if self.metrics.textfile.as_os_str().is_empty() {
                bail!("metrics.textfile is required when metrics are enabled");
            }
        }
        if self.enclave.execution.default_gas_limit == 0 {
            bail!("enclave.execution.default_gas_limit must be greater than 0");
        }
        if self.enclave.storage_backend == StorageBackendKind::File
            && self.enclave.data_dir.as_os_str().is_empty()
        {
            bail!("enclave.data_dir is required for the file backend");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("host.toml");

        let created = HostConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = HostConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.scheduler, created.scheduler);
        assert_eq!(loaded.logging, created.logging);
        assert_eq!(loaded.metrics, created.metrics);
        assert_eq!(loaded.enclave.data_dir, created.enclave.data_dir);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(
            &path,
            "[scheduler]\npoll_interval_secs = 5\n\n[enclave]\nstorage_backend = \"memory\"\n",
        )
        .unwrap();

        let config = HostConfig::load_from_file(&path).unwrap();
        assert_eq!(config.scheduler.poll_interval_secs, 5);
        assert!(config.scheduler.enabled);
        assert_eq!(config.enclave.storage_backend, StorageBackendKind::Memory);
    }

    #[test]
    fn test_validation() {
        let mut config = HostConfig::default();
        config.scheduler.poll_interval_secs = 0;
        assert!(config.validate().is_err());
        config.scheduler.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metrics_section() {
        let config: HostConfig = toml::from_str(
            "[metrics]\nenabled = true\ntextfile = \"/var/lib/node_exporter/enclave.prom\"\n",
        )
        .unwrap();
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.interval_secs, 15);
        assert!(config.validate().is_ok());

        let mut config = config;
        config.metrics.interval_secs = 0;
        assert!(config.validate().is_err());
        config.metrics.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = HostConfig::default().with_overrides(Some("/tmp/enclave".into()), true);
        assert_eq!(config.enclave.data_dir, PathBuf::from("/tmp/enclave"));
        assert_eq!(config.enclave.storage_backend, StorageBackendKind::Memory);
    }
}
