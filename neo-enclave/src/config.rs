//! Enclave configuration.
//!
//! Every section carries defaults so a partial TOML document (or none at all)
//! yields a working simulation enclave.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where sealed values are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Process memory; lost on restart.
    Memory,
    /// One directory per namespace under `data_dir`.
    #[default]
    File,
}

/// Complete enclave configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    /// Directory for sealed data and the simulated identity seed
    pub data_dir: PathBuf,
    /// Storage backend selection
    pub storage_backend: StorageBackendKind,
    /// Run without SGX hardware
    pub simulation: bool,
    /// Script execution limits
    pub execution: ExecutionConfig,
    /// Randomness service settings
    pub randomness: RandomnessConfig,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/enclave"),
            storage_backend: StorageBackendKind::File,
            simulation: cfg!(feature = "simulation"),
            execution: ExecutionConfig::default(),
            randomness: RandomnessConfig::default(),
        }
    }
}

impl EnclaveConfig {
    /// In-memory configuration with an ephemeral identity, for tests.
    pub fn in_memory() -> Self {
        Self {
            storage_backend: StorageBackendKind::Memory,
            simulation: true,
            ..Default::default()
        }
    }

    /// File-backed configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            storage_backend: StorageBackendKind::File,
            simulation: true,
            ..Default::default()
        }
    }
}

/// Script execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Gas limit applied when a request does not name one
    pub default_gas_limit: u64,
    /// Wall-clock cap per execution in milliseconds
    pub timeout_ms: u64,
    /// Maximum nested user function calls
    pub max_call_depth: usize,
    /// Maximum serialized size of a script result
    pub max_output_bytes: usize,
    /// Maximum captured `console.log` lines
    pub max_log_lines: usize,
    /// Refuse executions for users without gas balance and cap each run at
    /// the remaining balance
    pub enforce_gas_balance: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_gas_limit: 1_000_000,
            timeout_ms: 5_000,
            max_call_depth: 64,
            max_output_bytes: 64 * 1024,
            max_log_lines: 100,
            enforce_gas_balance: false,
        }
    }
}

impl ExecutionConfig {
    /// Wall-clock cap as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Randomness service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomnessConfig {
    /// How long generated values stay in the verification cache
    pub cache_ttl_secs: u64,
    /// Maximum cached entries
    pub cache_capacity: usize,
}

impl Default for RandomnessConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_capacity: 1024,
        }
    }
}

impl RandomnessConfig {
    /// Cache lifetime as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
