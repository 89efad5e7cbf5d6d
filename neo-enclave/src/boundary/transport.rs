//! Host side of the boundary: a byte transport and a typed client over it.

use super::messages::{EnclaveRequest, EnclaveResponse, SecretValue};
use super::Enclave;
use crate::attestation::AttestationReport;
use crate::compliance::{ComplianceReport, JurisdictionRules};
use crate::enclave::KeyPurpose;
use crate::error::TransportError;
use crate::execution::ExecutionOutput;
use crate::gas::{FunctionUsage, GasAccount};
use crate::keys::KeyInfo;
use crate::randomness::{RandomBytesProof, RandomnessProof};
use crate::triggers::{TriggerDefinition, TriggerSummary};
use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

/// Moves serialized requests into the enclave and responses back out.
pub trait EnclaveTransport: Send + Sync {
    fn call(&self, request: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Transport for a simulated enclave living in the host process.
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    enclave: Arc<Enclave>,
}

impl InProcessTransport {
    pub fn new(enclave: Arc<Enclave>) -> Self {
        Self { enclave }
    }
}

impl EnclaveTransport for InProcessTransport {
    fn call(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(self.enclave.call(request))
    }
}

fn unexpected(response: EnclaveResponse) -> TransportError {
    let shape = serde_json::to_value(&response)
        .ok()
        .and_then(|v| v.get("result").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| "unknown".to_string());
    TransportError::UnexpectedResponse(shape)
}

/// Typed host API.
#[derive(Debug, Clone)]
pub struct EnclaveClient<T: EnclaveTransport> {
    transport: T,
}

macro_rules! expect_response {
    ($response:expr, $pattern:pat => $value:expr) => {
        match $response {
            $pattern => Ok($value),
            other => Err(unexpected(other)),
        }
    };
}

impl<T: EnclaveTransport> EnclaveClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send one request. Error responses become [`TransportError::Enclave`].
    pub fn send(&self, request: &EnclaveRequest) -> Result<EnclaveResponse, TransportError> {
        let bytes = serde_json::to_vec(request).map_err(|e| TransportError::Encode(e.to_string()))?;
        trace!(op = request.op(), bytes = bytes.len(), "sending boundary request");
        let reply = self.transport.call(&bytes)?;
        match serde_json::from_slice(&reply).map_err(|e| TransportError::Decode(e.to_string()))? {
            EnclaveResponse::Error { code, message } => Err(TransportError::Enclave { code, message }),
            response => Ok(response),
        }
    }

    fn ack(&self, request: EnclaveRequest) -> Result<(), TransportError> {
        expect_response!(self.send(&request)?, EnclaveResponse::Ack => ())
    }

    fn processed(&self, request: EnclaveRequest) -> Result<usize, TransportError> {
        expect_response!(self.send(&request)?, EnclaveResponse::Processed { count } => count)
    }

    fn verified(&self, request: EnclaveRequest) -> Result<bool, TransportError> {
        expect_response!(self.send(&request)?, EnclaveResponse::Verified { valid } => valid)
    }

    pub fn register_trigger(&self, trigger: TriggerDefinition) -> Result<String, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::RegisterTrigger { trigger })?,
            EnclaveResponse::TriggerRegistered { trigger_id } => trigger_id
        )
    }

    pub fn unregister_trigger(&self, id: &str) -> Result<(), TransportError> {
        self.ack(EnclaveRequest::UnregisterTrigger { id: id.to_string() })
    }

    pub fn enable_trigger(&self, id: &str) -> Result<(), TransportError> {
        self.ack(EnclaveRequest::EnableTrigger { id: id.to_string() })
    }

    pub fn disable_trigger(&self, id: &str) -> Result<(), TransportError> {
        self.ack(EnclaveRequest::DisableTrigger { id: id.to_string() })
    }

    pub fn get_trigger(&self, id: &str) -> Result<TriggerSummary, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetTrigger { id: id.to_string() })?,
            EnclaveResponse::Trigger { trigger } => trigger
        )
    }

    pub fn list_triggers(&self) -> Result<Vec<TriggerSummary>, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::ListTriggers)?,
            EnclaveResponse::Triggers { triggers } => triggers
        )
    }

    pub fn process_scheduled_triggers(&self, current_time: u64) -> Result<usize, TransportError> {
        self.processed(EnclaveRequest::ProcessScheduledTriggers { current_time })
    }

    pub fn process_blockchain_event(&self, event: &str) -> Result<usize, TransportError> {
        self.processed(EnclaveRequest::ProcessBlockchainEvent {
            event: event.to_string(),
        })
    }

    pub fn process_storage_event(&self, key: &str, operation: &str) -> Result<usize, TransportError> {
        self.processed(EnclaveRequest::ProcessStorageEvent {
            key: key.to_string(),
            operation: operation.to_string(),
        })
    }

    pub fn process_external_event(&self, event_type: &str, payload: &str) -> Result<usize, TransportError> {
        self.processed(EnclaveRequest::ProcessExternalEvent {
            event_type: event_type.to_string(),
            payload: payload.to_string(),
        })
    }

    pub fn execute_script(
        &self,
        function_id: &str,
        user_id: &str,
        code: &str,
        input: Value,
        gas_limit: Option<u64>,
    ) -> Result<ExecutionOutput, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::ExecuteScript {
                function_id: function_id.to_string(),
                user_id: user_id.to_string(),
                code: code.to_string(),
                input,
                gas_limit,
            })?,
            EnclaveResponse::Execution { output } => output
        )
    }

    pub fn generate_random(
        &self,
        min: u64,
        max: u64,
        user_id: &str,
        request_id: &str,
    ) -> Result<u64, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GenerateRandom {
                min,
                max,
                user_id: user_id.to_string(),
                request_id: request_id.to_string(),
            })?,
            EnclaveResponse::Random { value } => value
        )
    }

    pub fn get_random_proof(
        &self,
        value: u64,
        min: u64,
        max: u64,
        user_id: &str,
        request_id: &str,
    ) -> Result<RandomnessProof, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetRandomProof {
                value,
                min,
                max,
                user_id: user_id.to_string(),
                request_id: request_id.to_string(),
            })?,
            EnclaveResponse::RandomProof { proof } => proof
        )
    }

    pub fn verify_random(&self, proof: &RandomnessProof) -> Result<bool, TransportError> {
        self.verified(EnclaveRequest::VerifyRandom {
            value: proof.value,
            min: proof.min,
            max: proof.max,
            user_id: proof.user_id.clone(),
            request_id: proof.request_id.clone(),
            proof: proof.clone(),
        })
    }

    pub fn generate_random_bytes(
        &self,
        length: usize,
        user_id: &str,
        request_id: &str,
    ) -> Result<RandomBytesProof, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GenerateRandomBytes {
                length,
                user_id: user_id.to_string(),
                request_id: request_id.to_string(),
            })?,
            EnclaveResponse::RandomBytes { proof } => proof
        )
    }

    pub fn generate_seed(&self, user_id: &str, request_id: &str) -> Result<RandomBytesProof, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GenerateSeed {
                user_id: user_id.to_string(),
                request_id: request_id.to_string(),
            })?,
            EnclaveResponse::RandomBytes { proof } => proof
        )
    }

    pub fn verify_seed(&self, proof: &RandomBytesProof) -> Result<bool, TransportError> {
        self.verified(EnclaveRequest::VerifySeed {
            proof: proof.clone(),
        })
    }

    pub fn verify_compliance(
        &self,
        code: &str,
        user_id: &str,
        function_id: &str,
        jurisdiction: Option<&str>,
        rules: Option<JurisdictionRules>,
    ) -> Result<ComplianceReport, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::VerifyCompliance {
                code: code.to_string(),
                user_id: user_id.to_string(),
                function_id: function_id.to_string(),
                rules,
                jurisdiction: jurisdiction.map(str::to_owned),
            })?,
            EnclaveResponse::Compliance { report } => report
        )
    }

    pub fn get_compliance_rules(&self, jurisdiction: &str) -> Result<JurisdictionRules, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetComplianceRules {
                jurisdiction: jurisdiction.to_string(),
            })?,
            EnclaveResponse::Rules { rules } => rules
        )
    }

    pub fn set_compliance_rules(
        &self,
        jurisdiction: &str,
        rules: JurisdictionRules,
    ) -> Result<JurisdictionRules, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::SetComplianceRules {
                jurisdiction: jurisdiction.to_string(),
                rules,
            })?,
            EnclaveResponse::Rules { rules } => rules
        )
    }

    pub fn verify_identity(
        &self,
        user_id: &str,
        identity_data: Value,
        jurisdiction: &str,
    ) -> Result<ComplianceReport, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::VerifyIdentity {
                user_id: user_id.to_string(),
                identity_data,
                jurisdiction: jurisdiction.to_string(),
            })?,
            EnclaveResponse::Compliance { report } => report
        )
    }

    pub fn get_compliance_status(
        &self,
        function_id: &str,
        jurisdiction: &str,
    ) -> Result<Option<ComplianceReport>, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetComplianceStatus {
                function_id: function_id.to_string(),
                jurisdiction: jurisdiction.to_string(),
            })?,
            EnclaveResponse::ComplianceStatus { report } => report
        )
    }

    pub fn get_identity_status(
        &self,
        user_id: &str,
        jurisdiction: &str,
    ) -> Result<Option<ComplianceReport>, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetIdentityStatus {
                user_id: user_id.to_string(),
                jurisdiction: jurisdiction.to_string(),
            })?,
            EnclaveResponse::ComplianceStatus { report } => report
        )
    }

    pub fn store_secret(&self, user_id: &str, name: &str, value: &str) -> Result<(), TransportError> {
        self.ack(EnclaveRequest::StoreSecret {
            user_id: user_id.to_string(),
            name: name.to_string(),
            value: SecretValue::new(value),
        })
    }

    pub fn delete_secret(&self, user_id: &str, name: &str) -> Result<bool, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::DeleteSecret {
                user_id: user_id.to_string(),
                name: name.to_string(),
            })?,
            EnclaveResponse::Deleted { deleted } => deleted
        )
    }

    pub fn list_secret_names(&self, user_id: &str) -> Result<Vec<String>, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::ListSecretNames {
                user_id: user_id.to_string(),
            })?,
            EnclaveResponse::SecretNames { names } => names
        )
    }

    /// Attestation report over `report_data` plus the enclave's public keys
    /// (randomness, attestation).
    pub fn get_attestation(&self, report_data: &[u8]) -> Result<(AttestationReport, String, String), TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetAttestation {
                report_data: hex::encode(report_data),
            })?,
            EnclaveResponse::Attestation {
                report,
                randomness_public_key,
                attestation_public_key,
            } => (report, randomness_public_key, attestation_public_key)
        )
    }

    pub fn get_gas_account(&self, user_id: &str) -> Result<GasAccount, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetGasAccount {
                user_id: user_id.to_string(),
            })?,
            EnclaveResponse::GasAccount { account } => account
        )
    }

    /// Credit or debit `user_id`; returns the updated account.
    pub fn update_gas_balance(&self, user_id: &str, amount: i64) -> Result<GasAccount, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::UpdateGasBalance {
                user_id: user_id.to_string(),
                amount,
            })?,
            EnclaveResponse::GasAccount { account } => account
        )
    }

    pub fn get_gas_usage(&self, function_id: &str) -> Result<FunctionUsage, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetGasUsage {
                function_id: function_id.to_string(),
            })?,
            EnclaveResponse::GasUsage { usage } => usage
        )
    }

    pub fn list_keys(&self) -> Result<Vec<KeyInfo>, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::ListKeys)?,
            EnclaveResponse::Keys { keys } => keys
        )
    }

    pub fn rotate_key(&self, purpose: KeyPurpose) -> Result<KeyInfo, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::RotateKey { purpose })?,
            EnclaveResponse::Key { key } => key
        )
    }

    /// Prometheus text exposition of the enclave's metrics.
    pub fn get_metrics(&self) -> Result<String, TransportError> {
        expect_response!(
            self.send(&EnclaveRequest::GetMetrics)?,
            EnclaveResponse::Metrics { text } => text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnclaveConfig;
    use crate::triggers::TriggerKind;

    struct OfflineTransport;

    impl EnclaveTransport for OfflineTransport {
        fn call(&self, _: &[u8]) -> Result<Vec<u8>, TransportError> {
            Err(TransportError::Unavailable("enclave not loaded".into()))
        }
    }

    struct GarbageTransport;

    impl EnclaveTransport for GarbageTransport {
        fn call(&self, _: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(b"<html>".to_vec())
        }
    }

    fn client() -> EnclaveClient<InProcessTransport> {
        let enclave = Enclave::from_config(EnclaveConfig::in_memory()).unwrap();
        EnclaveClient::new(InProcessTransport::new(Arc::new(enclave)))
    }

    #[test]
    fn test_trigger_lifecycle_through_client() {
        let client = client();
        let id = client
            .register_trigger(TriggerDefinition {
                id: Some("sched".into()),
                kind: TriggerKind::Schedule,
                condition: String::new(),
                function_id: "f".into(),
                owner_user_id: "u".into(),
                code: "function main() { return 1; }".into(),
                input: Value::Null,
                gas_limit: None,
                enabled: true,
                next_execution_time: 1000,
                interval_seconds: 60,
            })
            .unwrap();
        assert_eq!(id, "sched");

        assert_eq!(client.process_scheduled_triggers(1000).unwrap(), 1);
        assert_eq!(client.get_trigger("sched").unwrap().next_execution_time, 1060);
        assert_eq!(client.process_scheduled_triggers(1030).unwrap(), 0);

        client.disable_trigger("sched").unwrap();
        client.disable_trigger("sched").unwrap();
        assert_eq!(client.list_triggers().unwrap().len(), 1);

        client.unregister_trigger("sched").unwrap();
        let err = client.get_trigger("sched").unwrap_err();
        assert!(matches!(err, TransportError::Enclave { ref code, .. } if code == "trigger_not_found"));
    }

    #[test]
    fn test_randomness_through_client() {
        let client = client();
        let value = client.generate_random(1, 6, "u", "dice").unwrap();
        assert!((1..=6).contains(&value));
        let proof = client.get_random_proof(value, 1, 6, "u", "dice").unwrap();
        assert!(client.verify_random(&proof).unwrap());

        let mut forged = proof.clone();
        forged.value = if value == 6 { 5 } else { value + 1 };
        assert!(!client.verify_random(&forged).unwrap());

        let seed = client.generate_seed("u", "seed-1").unwrap();
        assert!(client.verify_seed(&seed).unwrap());
        let bytes = client.generate_random_bytes(8, "u", "bytes-1").unwrap();
        assert!(client.verify_seed(&bytes).unwrap());
    }

    #[test]
    fn test_transport_failures() {
        let offline = EnclaveClient::new(OfflineTransport);
        assert!(matches!(
            offline.list_triggers(),
            Err(TransportError::Unavailable(_))
        ));

        let garbage = EnclaveClient::new(GarbageTransport);
        assert!(matches!(
            garbage.list_triggers(),
            Err(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_unexpected_response_shape() {
        let err = unexpected(EnclaveResponse::Ack);
        assert_eq!(err, TransportError::UnexpectedResponse("ack".into()));
    }

    #[test]
    fn test_gas_keys_and_metrics_through_client() {
        let client = client();
        assert_eq!(client.update_gas_balance("u", 50_000).unwrap().balance, 50_000);
        let output = client
            .execute_script("f", "u", "function main() { return 2; }", Value::Null, None)
            .unwrap();
        let account = client.get_gas_account("u").unwrap();
        assert_eq!(account.balance, 50_000 - output.gas_used);
        assert_eq!(client.get_gas_usage("f").unwrap().executions, 1);

        let rotated = client.rotate_key(KeyPurpose::Attestation).unwrap();
        assert_eq!(rotated.generation, 1);
        let keys = client.list_keys().unwrap();
        assert_eq!(keys.iter().filter(|key| key.active).count(), 2);
        let (report, _, attestation_key) = client.get_attestation(b"").unwrap();
        assert_eq!(report.key_generation, 1);
        assert_eq!(attestation_key, rotated.public_key);

        let text = client.get_metrics().unwrap();
        assert!(text.contains("neo_enclave_boundary_calls_total"));
        assert!(text.contains("op=\"rotate_key\""));
    }

    #[test]
    fn test_attestation_through_client() {
        let client = client();
        let (report, randomness_key, attestation_key) = client.get_attestation(b"nonce").unwrap();
        assert!(report.report_data.starts_with(&hex::encode(b"nonce")));
        assert_ne!(randomness_key, attestation_key);
    }
}
