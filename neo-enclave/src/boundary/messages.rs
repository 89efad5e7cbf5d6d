//! Wire types of the enclave boundary. Requests are tagged by `op`,
//! responses by `result`.

use crate::attestation::AttestationReport;
use crate::compliance::{ComplianceReport, JurisdictionRules};
use crate::enclave::KeyPurpose;
use crate::execution::ExecutionOutput;
use crate::gas::{FunctionUsage, GasAccount};
use crate::keys::KeyInfo;
use crate::randomness::{RandomBytesProof, RandomnessProof};
use crate::triggers::{TriggerDefinition, TriggerSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zeroize::Zeroize;

/// Secret value in transit. Redacted from `Debug` and wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EnclaveRequest {
    RegisterTrigger {
        trigger: TriggerDefinition,
    },
    UnregisterTrigger {
        id: String,
    },
    EnableTrigger {
        id: String,
    },
    DisableTrigger {
        id: String,
    },
    GetTrigger {
        id: String,
    },
    ListTriggers,
    ProcessScheduledTriggers {
        /// Unix seconds.
        current_time: u64,
    },
    ProcessBlockchainEvent {
        /// Serialized event object.
        event: String,
    },
    ProcessStorageEvent {
        key: String,
        operation: String,
    },
    ProcessExternalEvent {
        event_type: String,
        /// Serialized payload; empty means null.
        #[serde(default)]
        payload: String,
    },
    ExecuteScript {
        function_id: String,
        user_id: String,
        code: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        gas_limit: Option<u64>,
    },
    GenerateRandom {
        min: u64,
        max: u64,
        user_id: String,
        request_id: String,
    },
    GetRandomProof {
        value: u64,
        min: u64,
        max: u64,
        user_id: String,
        request_id: String,
    },
    VerifyRandom {
        value: u64,
        min: u64,
        max: u64,
        user_id: String,
        request_id: String,
        proof: RandomnessProof,
    },
    GenerateRandomBytes {
        length: usize,
        user_id: String,
        request_id: String,
    },
    GenerateSeed {
        user_id: String,
        request_id: String,
    },
    /// Verifies proofs from both `generate_seed` and `generate_random_bytes`.
    VerifySeed {
        proof: RandomBytesProof,
    },
    VerifyCompliance {
        code: String,
        user_id: String,
        function_id: String,
        /// Rules to check against. When absent the stored rules of
        /// `jurisdiction` (default `global`) apply.
        #[serde(default)]
        rules: Option<JurisdictionRules>,
        #[serde(default)]
        jurisdiction: Option<String>,
    },
    GetComplianceRules {
        jurisdiction: String,
    },
    SetComplianceRules {
        jurisdiction: String,
        rules: JurisdictionRules,
    },
    VerifyIdentity {
        user_id: String,
        identity_data: Value,
        jurisdiction: String,
    },
    GetComplianceStatus {
        function_id: String,
        jurisdiction: String,
    },
    GetIdentityStatus {
        user_id: String,
        jurisdiction: String,
    },
    StoreSecret {
        user_id: String,
        name: String,
        value: SecretValue,
    },
    DeleteSecret {
        user_id: String,
        name: String,
    },
    ListSecretNames {
        user_id: String,
    },
    GetAttestation {
        /// Hex, at most 64 bytes.
        #[serde(default)]
        report_data: String,
    },
    GetGasAccount {
        user_id: String,
    },
    /// Credit (positive) or debit (negative) a user's balance. The balance
    /// never drops below zero.
    UpdateGasBalance {
        user_id: String,
        amount: i64,
    },
    GetGasUsage {
        function_id: String,
    },
    ListKeys,
    RotateKey {
        purpose: KeyPurpose,
    },
    GetMetrics,
}

impl EnclaveRequest {
    /// The `op` tag, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Self::RegisterTrigger { .. } => "register_trigger",
            Self::UnregisterTrigger { .. } => "unregister_trigger",
            Self::EnableTrigger { .. } => "enable_trigger",
            Self::DisableTrigger { .. } => "disable_trigger",
            Self::GetTrigger { .. } => "get_trigger",
            Self::ListTriggers => "list_triggers",
            Self::ProcessScheduledTriggers { .. } => "process_scheduled_triggers",
            Self::ProcessBlockchainEvent { .. } => "process_blockchain_event",
            Self::ProcessStorageEvent { .. } => "process_storage_event",
            Self::ProcessExternalEvent { .. } => "process_external_event",
            Self::ExecuteScript { .. } => "execute_script",
            Self::GenerateRandom { .. } => "generate_random",
            Self::GetRandomProof { .. } => "get_random_proof",
            Self::VerifyRandom { .. } => "verify_random",
            Self::GenerateRandomBytes { .. } => "generate_random_bytes",
            Self::GenerateSeed { .. } => "generate_seed",
            Self::VerifySeed { .. } => "verify_seed",
            Self::VerifyCompliance { .. } => "verify_compliance",
            Self::GetComplianceRules { .. } => "get_compliance_rules",
            Self::SetComplianceRules { .. } => "set_compliance_rules",
            Self::VerifyIdentity { .. } => "verify_identity",
            Self::GetComplianceStatus { .. } => "get_compliance_status",
            Self::GetIdentityStatus { .. } => "get_identity_status",
            Self::StoreSecret { .. } => "store_secret",
            Self::DeleteSecret { .. } => "delete_secret",
            Self::ListSecretNames { .. } => "list_secret_names",
            Self::GetAttestation { .. } => "get_attestation",
            Self::GetGasAccount { .. } => "get_gas_account",
            Self::UpdateGasBalance { .. } => "update_gas_balance",
            Self::GetGasUsage { .. } => "get_gas_usage",
            Self::ListKeys => "list_keys",
            Self::RotateKey { .. } => "rotate_key",
            Self::GetMetrics => "get_metrics",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EnclaveResponse {
    Ack,
    TriggerRegistered {
        trigger_id: String,
    },
    Trigger {
        trigger: TriggerSummary,
    },
    Triggers {
        triggers: Vec<TriggerSummary>,
    },
    Processed {
        count: usize,
    },
    Execution {
        output: ExecutionOutput,
    },
    Random {
        value: u64,
    },
    RandomProof {
        proof: RandomnessProof,
    },
    RandomBytes {
        proof: RandomBytesProof,
    },
    Verified {
        valid: bool,
    },
    Compliance {
        report: ComplianceReport,
    },
    ComplianceStatus {
        report: Option<ComplianceReport>,
    },
    Rules {
        rules: JurisdictionRules,
    },
    Deleted {
        deleted: bool,
    },
    SecretNames {
        names: Vec<String>,
    },
    Attestation {
        report: AttestationReport,
        /// Hex SEC1 key that verifies randomness proofs.
        randomness_public_key: String,
        /// Hex SEC1 key that verifies attestation reports.
        attestation_public_key: String,
    },
    GasAccount {
        account: GasAccount,
    },
    GasUsage {
        usage: FunctionUsage,
    },
    Keys {
        keys: Vec<KeyInfo>,
    },
    Key {
        key: KeyInfo,
    },
    Metrics {
        /// Prometheus text exposition format.
        text: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl EnclaveResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_tagging() {
        let request: EnclaveRequest = serde_json::from_value(json!({
            "op": "process_external_event",
            "event_type": "price"
        }))
        .unwrap();
        assert_eq!(
            request,
            EnclaveRequest::ProcessExternalEvent {
                event_type: "price".into(),
                payload: String::new(),
            }
        );
        assert_eq!(request.op(), "process_external_event");

        let json = serde_json::to_value(EnclaveRequest::ListTriggers).unwrap();
        assert_eq!(json, json!({"op": "list_triggers"}));
    }

    #[test]
    fn test_response_tagging() {
        let json = serde_json::to_value(EnclaveResponse::Processed { count: 2 }).unwrap();
        assert_eq!(json, json!({"result": "processed", "count": 2}));
        let json = serde_json::to_value(EnclaveResponse::error("timeout", "slow")).unwrap();
        assert_eq!(json, json!({"result": "error", "code": "timeout", "message": "slow"}));
    }

    #[test]
    fn test_secret_value_is_redacted() {
        let request: EnclaveRequest = serde_json::from_value(json!({
            "op": "store_secret",
            "user_id": "u",
            "name": "API_KEY",
            "value": "hunter2"
        }))
        .unwrap();
        let debug = format!("{:?}", request);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[redacted]"));

        let EnclaveRequest::StoreSecret { value, .. } = request else {
            panic!("expected store_secret");
        };
        assert_eq!(value.expose(), "hunter2");
    }

    #[test]
    fn test_key_and_gas_requests() {
        let request: EnclaveRequest =
            serde_json::from_value(json!({"op": "rotate_key", "purpose": "randomness_signing"}))
                .unwrap();
        assert_eq!(
            request,
            EnclaveRequest::RotateKey {
                purpose: KeyPurpose::RandomnessSigning
            }
        );

        let request: EnclaveRequest = serde_json::from_value(
            json!({"op": "update_gas_balance", "user_id": "u", "amount": -50}),
        )
        .unwrap();
        assert_eq!(request.op(), "update_gas_balance");
        assert!(serde_json::from_value::<EnclaveRequest>(
            json!({"op": "rotate_key", "purpose": "master"})
        )
        .is_err());
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(serde_json::from_value::<EnclaveRequest>(json!({"op": "drop_tables"})).is_err());
    }
}
