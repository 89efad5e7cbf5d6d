//! Error types for the enclave runtime.
//!
//! Each component owns a narrow error enum; [`EnclaveError`] is the umbrella
//! that the boundary dispatcher converts into a stable error code.

use thiserror::Error;

/// Errors raised by the secure storage manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Namespace or key was rejected before touching the medium.
    #[error("Invalid storage key: {message}")]
    InvalidKey {
        /// Why the key was rejected.
        message: String,
    },

    /// The underlying medium could not be reached. Callers may retry.
    #[error("Storage unavailable: {message}")]
    Unavailable {
        /// Backend error message.
        message: String,
    },

    /// The sealed value failed its integrity check. Fatal for that key.
    #[error("Corrupt value at {namespace}/{key}: {reason}")]
    Corrupt {
        /// Namespace holding the value.
        namespace: String,
        /// Key of the value.
        key: String,
        /// Integrity failure reason (never contains plaintext).
        reason: String,
    },
}

impl StorageError {
    /// Create an invalid key error.
    pub fn invalid_key<S: Into<String>>(message: S) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a corrupt value error.
    pub fn corrupt<N, K, R>(namespace: N, key: K, reason: R) -> Self
    where
        N: Into<String>,
        K: Into<String>,
        R: Into<String>,
    {
        Self::Corrupt {
            namespace: namespace.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether a higher layer may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::unavailable(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised while sealing or unsealing data and deriving keys.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealingError {
    /// Cipher or key material could not be constructed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Encryption failed.
    #[error("Sealing failed: {0}")]
    SealingFailed(String),

    /// Decryption or authentication failed.
    #[error("Unsealing failed: {0}")]
    UnsealingFailed(String),

    /// Sealed envelope could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Identity material could not be loaded or persisted.
    #[error("Identity error: {0}")]
    Identity(String),
}

/// Result type for sealing operations.
pub type SealingResult<T> = std::result::Result<T, SealingError>;

/// Errors raised by the secret manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    /// User id or secret name was empty.
    #[error("Invalid secret request: {0}")]
    InvalidRequest(String),

    /// Stored secret record could not be decoded.
    #[error("Secret record for user {user_id} is unreadable")]
    UnreadableRecord {
        /// Owner of the record.
        user_id: String,
    },

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for secret operations.
pub type SecretResult<T> = std::result::Result<T, SecretError>;

/// Charging gas past the configured limit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Gas exhausted: requested {requested} with {used} of {limit} used")]
pub struct GasExhausted {
    /// Amount that was requested by the failed charge.
    pub requested: u64,
    /// Gas consumed before the failed charge.
    pub used: u64,
    /// Configured limit.
    pub limit: u64,
}

/// Errors raised by the gas ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GasLedgerError {
    /// User or function id was empty.
    #[error("Invalid gas ledger request: {0}")]
    InvalidRequest(String),

    /// The user's balance cannot cover the execution.
    #[error("Insufficient gas balance: {balance} available")]
    InsufficientBalance {
        /// Balance at the time of the check.
        balance: u64,
    },

    /// Ledger record could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for gas ledger operations.
pub type GasLedgerResult<T> = std::result::Result<T, GasLedgerError>;

/// Errors raised by the signing key manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The purpose has no rotating signing key.
    #[error("Key purpose {0} cannot be rotated or listed")]
    UnsupportedPurpose(String),

    /// The generation was never issued.
    #[error("Unknown generation {generation} for {purpose} key")]
    UnknownGeneration {
        /// Purpose of the key.
        purpose: String,
        /// Requested generation.
        generation: u32,
    },

    /// Key derivation failed.
    #[error(transparent)]
    Sealing(#[from] SealingError),

    /// Key generation record could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for key manager operations.
pub type KeyResult<T> = std::result::Result<T, KeyError>;

/// Terminal failures of a single script execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    /// The execution context was missing required fields.
    #[error("Invalid execution context: {0}")]
    InvalidContext(String),

    /// The script failed to parse.
    #[error("Syntax error at {line}:{column}: {message}")]
    Syntax {
        /// Parser message.
        message: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
    },

    /// The script threw or hit an interpreter fault. The message is sanitized.
    #[error("Runtime error: {message}")]
    Runtime {
        /// Sanitized, bounded message.
        message: String,
    },

    /// The gas budget was exhausted.
    #[error(transparent)]
    GasExhausted(#[from] GasExhausted),

    /// The wall-clock cap elapsed.
    #[error("Execution timed out after {limit_ms} ms")]
    Timeout {
        /// Configured cap in milliseconds.
        limit_ms: u64,
    },

    /// The gas ledger refused or could not open the execution.
    #[error(transparent)]
    Ledger(#[from] GasLedgerError),
}

impl ExecutionError {
    /// Create a runtime error.
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Stable error code used at the boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidContext(_) => "invalid_context",
            Self::Syntax { .. } => "syntax_error",
            Self::Runtime { .. } => "runtime_error",
            Self::GasExhausted(_) => "gas_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::Ledger(GasLedgerError::InvalidRequest(_)) => "invalid_context",
            Self::Ledger(GasLedgerError::InsufficientBalance { .. }) => "insufficient_gas",
            Self::Ledger(GasLedgerError::Storage(StorageError::Unavailable { .. })) => {
                "storage_unavailable"
            }
            Self::Ledger(GasLedgerError::Storage(StorageError::Corrupt { .. })) => "storage_corrupt",
            Self::Ledger(GasLedgerError::Storage(StorageError::InvalidKey { .. })) => "invalid_key",
        }
    }
}

/// Result type for script execution.
pub type ExecutionResult<T> = std::result::Result<T, ExecutionError>;

/// Errors raised by the event trigger manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// The trigger definition failed validation.
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// A trigger with the same id is already registered.
    #[error("Trigger already exists: {0}")]
    DuplicateId(String),

    /// No trigger with this id is registered.
    #[error("Trigger not found: {0}")]
    NotFound(String),

    /// The condition could not be parsed for the trigger's kind.
    #[error("Invalid condition for trigger {id}: {reason}")]
    InvalidCondition {
        /// Trigger id.
        id: String,
        /// Parse failure.
        reason: String,
    },

    /// An incoming event payload could not be parsed.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// Trigger record could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisting or loading the durable copy failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for trigger operations.
pub type TriggerResult<T> = std::result::Result<T, TriggerError>;

/// Errors raised by the randomness service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RandomnessError {
    /// `min` was greater than `max`.
    #[error("Invalid range: min {min} is greater than max {max}")]
    InvalidRange {
        /// Requested lower bound.
        min: u64,
        /// Requested upper bound.
        max: u64,
    },

    /// Request id was empty.
    #[error("Invalid randomness request: {0}")]
    InvalidRequest(String),

    /// A proof was already issued for this request id.
    #[error("Request already fulfilled: {0}")]
    DuplicateRequest(String),

    /// No proof was issued for this request, or its fields differ.
    #[error("No matching randomness issued for request {0}")]
    UnknownRequest(String),

    /// Signing with the enclave key failed.
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Proof record could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persisting the issued proof failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for randomness operations.
pub type RandomnessResult<T> = std::result::Result<T, RandomnessError>;

/// Errors raised by the compliance service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComplianceError {
    /// Rule set was malformed.
    #[error("Invalid compliance rules: {0}")]
    InvalidRules(String),

    /// Identity document was not a JSON object.
    #[error("Invalid identity data: {0}")]
    InvalidIdentityData(String),

    /// Stored record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for compliance operations.
pub type ComplianceResult<T> = std::result::Result<T, ComplianceError>;

/// Errors raised while producing attestation reports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    /// Report data longer than a report can carry.
    #[error("Report data is {len} bytes; at most {max} allowed")]
    ReportDataTooLong {
        /// Supplied length.
        len: usize,
        /// Capacity of the report data field.
        max: usize,
    },

    /// Signing the report failed.
    #[error("Report signing failed: {0}")]
    Signing(String),
}

/// Umbrella error surfaced at the enclave boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnclaveError {
    /// The request could not be decoded or was missing fields.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The enclave failed to initialize.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Metrics could not be encoded.
    #[error("Metrics export failed: {0}")]
    Metrics(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sealing(#[from] SealingError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Randomness(#[from] RandomnessError),

    #[error(transparent)]
    Compliance(#[from] ComplianceError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    GasLedger(#[from] GasLedgerError),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl EnclaveError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Initialization(_) => "initialization_failed",
            Self::Metrics(_) => "metrics_error",
            Self::Storage(StorageError::Unavailable { .. }) => "storage_unavailable",
            Self::Storage(StorageError::Corrupt { .. }) => "storage_corrupt",
            Self::Storage(StorageError::InvalidKey { .. }) => "invalid_key",
            Self::Sealing(_) => "sealing_error",
            Self::Secret(SecretError::Storage(err)) => Self::Storage(err.clone()).code(),
            Self::Secret(_) => "secret_error",
            Self::Execution(ExecutionError::Ledger(GasLedgerError::Storage(err))) => {
                Self::Storage(err.clone()).code()
            }
            Self::Execution(err) => err.code(),
            Self::Trigger(TriggerError::InvalidTrigger(_)) => "invalid_trigger",
            Self::Trigger(TriggerError::DuplicateId(_)) => "duplicate_trigger",
            Self::Trigger(TriggerError::NotFound(_)) => "trigger_not_found",
            Self::Trigger(TriggerError::InvalidCondition { .. }) => "invalid_condition",
            Self::Trigger(TriggerError::MalformedEvent(_)) => "malformed_event",
            Self::Trigger(TriggerError::Serialization(_)) => "serialization_error",
            Self::Trigger(TriggerError::Storage(err)) => Self::Storage(err.clone()).code(),
            Self::Randomness(RandomnessError::InvalidRange { .. }) => "invalid_range",
            Self::Randomness(RandomnessError::DuplicateRequest(_)) => "duplicate_request",
            Self::Randomness(RandomnessError::UnknownRequest(_)) => "unknown_request",
            Self::Randomness(RandomnessError::Storage(err)) => Self::Storage(err.clone()).code(),
            Self::Randomness(_) => "randomness_error",
            Self::Compliance(ComplianceError::InvalidRules(_)) => "invalid_rules",
            Self::Compliance(ComplianceError::InvalidIdentityData(_)) => "invalid_identity_data",
            Self::Compliance(ComplianceError::Storage(err)) => Self::Storage(err.clone()).code(),
            Self::Compliance(_) => "compliance_error",
            Self::Attestation(AttestationError::ReportDataTooLong { .. }) => "invalid_report_data",
            Self::Attestation(_) => "attestation_error",
            Self::GasLedger(GasLedgerError::InvalidRequest(_)) => "invalid_request",
            Self::GasLedger(GasLedgerError::InsufficientBalance { .. }) => "insufficient_gas",
            Self::GasLedger(GasLedgerError::Storage(err)) => Self::Storage(err.clone()).code(),
            Self::Key(KeyError::UnsupportedPurpose(_)) => "unsupported_key_purpose",
            Self::Key(KeyError::UnknownGeneration { .. }) => "unknown_key_generation",
            Self::Key(KeyError::Sealing(_)) => "sealing_error",
            Self::Key(KeyError::Storage(err)) => Self::Storage(err.clone()).code(),
        }
    }

    /// The storage failure behind this error, however deeply wrapped.
    fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::Storage(err)
            | Self::Secret(SecretError::Storage(err))
            | Self::Trigger(TriggerError::Storage(err))
            | Self::Randomness(RandomnessError::Storage(err))
            | Self::Compliance(ComplianceError::Storage(err))
            | Self::GasLedger(GasLedgerError::Storage(err))
            | Self::Execution(ExecutionError::Ledger(GasLedgerError::Storage(err)))
            | Self::Key(KeyError::Storage(err)) => Some(err),
            _ => None,
        }
    }

    /// Message safe to hand to the untrusted host.
    ///
    /// Corrupt storage reports only the namespace; keys may embed user ids.
    pub fn public_message(&self) -> String {
        let message = match (self, self.storage_error()) {
            (_, Some(StorageError::Corrupt { namespace, .. })) => {
                format!("Corrupt value in namespace {namespace}")
            }
            (Self::Sealing(_) | Self::Key(KeyError::Sealing(_)), _) => {
                "Sealing operation failed".to_string()
            }
            (other, _) => other.to_string(),
        };
        crate::execution::sanitize_message(&message)
    }
}

/// Result type for boundary operations.
pub type EnclaveResult<T> = std::result::Result<T, EnclaveError>;

/// Failures seen by the host side of the boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The enclave could not be reached.
    #[error("Enclave unavailable: {0}")]
    Unavailable(String),

    /// The request could not be encoded.
    #[error("Request encoding failed: {0}")]
    Encode(String),

    /// The response could not be decoded.
    #[error("Response decoding failed: {0}")]
    Decode(String),

    /// The enclave answered with an error.
    #[error("Enclave error [{code}]: {message}")]
    Enclave {
        /// Stable error code.
        code: String,
        /// Sanitized message.
        message: String,
    },

    /// The enclave answered with a response of the wrong shape.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_retryable() {
        assert!(StorageError::unavailable("disk gone").is_retryable());
        assert!(!StorageError::corrupt("triggers", "trigger:a", "tag mismatch").is_retryable());
        assert!(!StorageError::invalid_key("empty").is_retryable());
    }

    #[test]
    fn test_corrupt_error_message() {
        let err = StorageError::corrupt("secrets", "user-1", "authentication failed");
        assert!(err.to_string().contains("secrets/user-1"));
        assert!(err.to_string().contains("authentication failed"));
    }

    #[test]
    fn test_public_message_hides_corrupt_key() {
        let err = EnclaveError::from(StorageError::corrupt("secrets", "alice", "bad tag"));
        let message = err.public_message();
        assert!(message.contains("secrets"));
        assert!(!message.contains("alice"));
        assert_eq!(err.code(), "storage_corrupt");

        let nested = EnclaveError::from(SecretError::Storage(StorageError::corrupt(
            "secrets", "alice", "bad tag",
        )));
        assert!(!nested.public_message().contains("alice"));
        assert_eq!(nested.code(), "storage_corrupt");
    }

    #[test]
    fn test_nested_storage_codes() {
        let err = EnclaveError::from(TriggerError::Storage(StorageError::unavailable("io")));
        assert_eq!(err.code(), "storage_unavailable");

        let err = EnclaveError::from(SecretError::Storage(StorageError::unavailable("io")));
        assert_eq!(err.code(), "storage_unavailable");

        let err = EnclaveError::from(GasLedgerError::Storage(StorageError::corrupt(
            "gas",
            "user:alice",
            "rolled back",
        )));
        assert_eq!(err.code(), "storage_corrupt");
        assert!(!err.public_message().contains("alice"));
    }

    #[test]
    fn test_ledger_and_key_codes() {
        let err = EnclaveError::from(GasLedgerError::InsufficientBalance { balance: 3 });
        assert_eq!(err.code(), "insufficient_gas");
        assert_eq!(err.public_message(), "Insufficient gas balance: 3 available");

        let err = EnclaveError::from(KeyError::UnsupportedPurpose("storage_sealing".into()));
        assert_eq!(err.code(), "unsupported_key_purpose");

        let err = EnclaveError::from(KeyError::Sealing(SealingError::Crypto("hkdf".into())));
        assert_eq!(err.code(), "sealing_error");
        assert_eq!(err.public_message(), "Sealing operation failed");
    }

    #[test]
    fn test_execution_codes() {
        let gas = GasExhausted {
            requested: 10,
            used: 95,
            limit: 100,
        };
        assert_eq!(ExecutionError::from(gas).code(), "gas_exhausted");
        assert_eq!(ExecutionError::Timeout { limit_ms: 5 }.code(), "timeout");
        assert_eq!(ExecutionError::runtime("boom").code(), "runtime_error");

        let refused = ExecutionError::from(GasLedgerError::InsufficientBalance { balance: 0 });
        assert_eq!(refused.code(), "insufficient_gas");
        let corrupt = EnclaveError::from(ExecutionError::from(GasLedgerError::Storage(
            StorageError::corrupt("gas", "user:bob", "rolled back"),
        )));
        assert_eq!(corrupt.code(), "storage_corrupt");
        assert!(!corrupt.public_message().contains("bob"));
    }

    #[test]
    fn test_io_error_maps_to_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing dir");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Unavailable { .. }));
    }
}
