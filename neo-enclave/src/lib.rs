//! # Neo Enclave
//!
//! Trusted-execution runtime for the Neo Service Layer.
//!
//! ## Crate Purpose
//!
//! Everything that must run inside the trust boundary lives here:
//!
//! - **Identity and sealing**: per-enclave root secret, HKDF key derivation,
//!   AES-256-GCM sealed records
//! - **Secure storage**: namespaced key/value store whose values are sealed
//!   before they reach the (untrusted) backend
//! - **Secrets**: per-user secret sets that only the script engine ever sees
//! - **Script engine**: a sandboxed, gas-metered JavaScript subset
//! - **Triggers**: schedule, blockchain, storage and external event triggers
//! - **Randomness**: signed, verifiable random numbers and bytes
//! - **Compliance**: jurisdiction rule checks over code and identity data
//! - **Attestation**: signed simulated attestation reports
//! - **Gas ledger**: per-user balances and per-function usage, charged after
//!   every execution
//! - **Keys**: rotating generations of the randomness and attestation keys
//! - **Metrics**: Prometheus counters for executions, triggers and boundary
//!   calls
//!
//! ## Architecture
//!
//! ```text
//!   host process                         enclave
//!  ┌────────────────┐  JSON bytes  ┌────────────────────────────────────┐
//!  │ EnclaveClient  │ ───────────► │ Enclave::call ─► dispatch ─► metrics│
//!  │  (transport)   │ ◄─────────── │   ├─ TriggerManager ─┐              │
//!  └────────────────┘              │   ├─ ScriptEngine ◄──┘ + Secrets    │
//!                                  │   │    └─ GasLedger                 │
//!                                  │   ├─ RandomnessService ─┐           │
//!                                  │   ├─ AttestationService ┴ KeyManager│
//!                                  │   └─ ComplianceService              │
//!                                  │ SecureStorage ─► StorageBackend     │
//!                                  └────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use neo_enclave::{Enclave, EnclaveClient, EnclaveConfig, InProcessTransport};
//! use std::sync::Arc;
//!
//! let enclave = Arc::new(Enclave::from_config(EnclaveConfig::in_memory())?);
//! let client = EnclaveClient::new(InProcessTransport::new(enclave));
//! let value = client.generate_random(1, 6, "user-1", "dice-roll-1")?;
//! ```

pub mod attestation;
pub mod boundary;
pub mod compliance;
pub mod config;
pub mod enclave;
pub mod error;
pub mod execution;
pub mod gas;
pub mod keys;
pub mod metrics;
pub mod randomness;
pub mod script;
pub mod secrets;
pub mod storage;
pub mod triggers;

// Re-exports
pub use attestation::{AttestationReport, AttestationService, ReportType};
pub use boundary::{
    Enclave, EnclaveClient, EnclaveRequest, EnclaveResponse, EnclaveTransport,
    InProcessTransport, SecretValue,
};
pub use compliance::{ComplianceReport, ComplianceService, JurisdictionRules, Violation};
pub use config::{EnclaveConfig, ExecutionConfig, RandomnessConfig, StorageBackendKind};
pub use enclave::{EnclaveIdentity, KeyPurpose};
pub use error::{
    AttestationError, ComplianceError, EnclaveError, EnclaveResult, ExecutionError, GasExhausted,
    GasLedgerError, KeyError, RandomnessError, SealingError, SecretError, StorageError,
    TransportError, TriggerError,
};
pub use execution::{ExecutionContext, ExecutionOutput, ScriptEngine};
pub use gas::{AccountingSession, FunctionUsage, GasAccount, GasCost, GasLedger, GasMeter};
pub use keys::{KeyInfo, KeyManager};
pub use metrics::EnclaveMetrics;
pub use randomness::{RandomBytesProof, RandomnessProof, RandomnessService};
pub use secrets::{SecretManager, SecretSet};
pub use storage::{
    BatchOp, FileBackend, MemoryBackend, SecureStorage, StorageBackend, StorageTransaction,
};
pub use triggers::{Trigger, TriggerDefinition, TriggerKind, TriggerManager, TriggerSummary};
