//! Enclave boundary.
//!
//! [`Enclave`] wires every trusted component together and is the only thing
//! the untrusted host talks to. [`Enclave::call`] takes and returns JSON
//! bytes; [`Enclave::handle`] is the typed dispatcher behind it. Errors leave
//! as a stable code plus a sanitized message. Every call is counted in the
//! enclave's metrics by op and outcome.

mod messages;
mod transport;

pub use messages::{EnclaveRequest, EnclaveResponse, SecretValue};
pub use transport::{EnclaveClient, EnclaveTransport, InProcessTransport};

use crate::attestation::AttestationService;
use crate::compliance::{ComplianceService, GLOBAL_JURISDICTION};
use crate::config::{EnclaveConfig, StorageBackendKind};
use crate::enclave::EnclaveIdentity;
use crate::error::{EnclaveError, EnclaveResult};
use crate::execution::{ExecutionContext, ExecutionOutput, ScriptEngine};
use crate::gas::GasLedger;
use crate::keys::KeyManager;
use crate::metrics::{EnclaveMetrics, STATUS_OK};
use crate::randomness::RandomnessService;
use crate::secrets::SecretManager;
use crate::storage::{SecureStorage, StorageBackend};
use crate::triggers::TriggerManager;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sent when a response cannot be serialized at all.
const ENCODE_FAILURE: &[u8] =
    br#"{"result":"error","code":"internal_error","message":"Response encoding failed"}"#;

fn require(field: &str, value: &str) -> EnclaveResult<()> {
    if value.trim().is_empty() {
        return Err(EnclaveError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}

/// The trusted side of the boundary.
pub struct Enclave {
    config: EnclaveConfig,
    identity: Arc<EnclaveIdentity>,
    storage: Arc<SecureStorage>,
    secrets: Arc<SecretManager>,
    engine: Arc<ScriptEngine>,
    keys: Arc<KeyManager>,
    gas: Arc<GasLedger>,
    metrics: Arc<EnclaveMetrics>,
    triggers: TriggerManager,
    randomness: RandomnessService,
    compliance: ComplianceService,
    attestation: AttestationService,
}

impl Enclave {
    /// Start an enclave as configured. File-backed enclaves keep their
    /// identity seed in `data_dir`; in-memory ones get an ephemeral identity.
    pub fn from_config(config: EnclaveConfig) -> EnclaveResult<Self> {
        let identity = match config.storage_backend {
            StorageBackendKind::File => EnclaveIdentity::load_or_create(&config.data_dir)?,
            StorageBackendKind::Memory => EnclaveIdentity::ephemeral(),
        };
        let backend = SecureStorage::open_backend(&config)?;
        Self::with_backend(config, Arc::new(identity), backend)
    }

    /// Start an enclave over an explicit identity and backend.
    pub fn with_backend(
        config: EnclaveConfig,
        identity: Arc<EnclaveIdentity>,
        backend: Arc<dyn StorageBackend>,
    ) -> EnclaveResult<Self> {
        let storage = Arc::new(SecureStorage::new(backend, identity.clone())?);
        let secrets = Arc::new(SecretManager::new(storage.clone()));
        let metrics = Arc::new(
            EnclaveMetrics::new().map_err(|e| EnclaveError::Initialization(e.to_string()))?,
        );
        let keys = Arc::new(KeyManager::new(identity.clone(), storage.clone())?);
        let gas = Arc::new(GasLedger::new(
            storage.clone(),
            config.execution.enforce_gas_balance,
        ));
        let engine = Arc::new(
            ScriptEngine::new(config.execution.clone())
                .with_gas_ledger(gas.clone())
                .with_metrics(metrics.clone()),
        );
        let triggers = TriggerManager::new(storage.clone(), engine.clone(), secrets.clone())?
            .with_metrics(metrics.clone());
        let randomness = RandomnessService::new(storage.clone(), keys.clone(), &config.randomness)?;
        let compliance = ComplianceService::new(storage.clone());
        let attestation = AttestationService::new(&identity, keys.clone());

        info!(
            backend = ?config.storage_backend,
            simulation = config.simulation,
            mrenclave = %hex::encode(identity.measurement()),
            "enclave initialized"
        );
        Ok(Self {
            config,
            identity,
            storage,
            secrets,
            engine,
            keys,
            gas,
            metrics,
            triggers,
            randomness,
            compliance,
            attestation,
        })
    }

    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<SecureStorage> {
        &self.storage
    }

    pub fn triggers(&self) -> &TriggerManager {
        &self.triggers
    }

    pub fn secrets(&self) -> &SecretManager {
        &self.secrets
    }

    pub fn randomness(&self) -> &RandomnessService {
        &self.randomness
    }

    pub fn compliance(&self) -> &ComplianceService {
        &self.compliance
    }

    pub fn attestation(&self) -> &AttestationService {
        &self.attestation
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn gas_ledger(&self) -> &GasLedger {
        &self.gas
    }

    pub fn metrics(&self) -> &EnclaveMetrics {
        &self.metrics
    }

    /// Serialized entry point. Never fails; problems become error responses.
    pub fn call(&self, request: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<EnclaveRequest>(request) {
            Ok(request) => self.handle(request),
            Err(err) => {
                warn!(error = %err, "undecodable boundary request");
                let err = EnclaveError::InvalidRequest(err.to_string());
                EnclaveResponse::error(err.code(), err.public_message())
            }
        };
        serde_json::to_vec(&response).unwrap_or_else(|_| ENCODE_FAILURE.to_vec())
    }

    /// Typed dispatcher.
    pub fn handle(&self, request: EnclaveRequest) -> EnclaveResponse {
        let op = request.op();
        match self.dispatch(request) {
            Ok(response) => {
                debug!(op, "boundary call completed");
                self.metrics.observe_call(op, STATUS_OK);
                response
            }
            Err(err) => {
                warn!(op, code = err.code(), "boundary call failed");
                self.metrics.observe_call(op, err.code());
                EnclaveResponse::error(err.code(), err.public_message())
            }
        }
    }

    /// Run `code` directly for `user_id`, with that user's secrets bound.
    pub fn execute_script(
        &self,
        function_id: &str,
        user_id: &str,
        code: &str,
        input: Value,
        gas_limit: Option<u64>,
    ) -> EnclaveResult<ExecutionOutput> {
        let secrets = self.secrets.get_secrets(user_id)?;
        let gas_limit = gas_limit.unwrap_or(self.config.execution.default_gas_limit);
        let mut context =
            ExecutionContext::new(function_id, user_id, code, input, gas_limit).with_secrets(secrets);
        Ok(self.engine.execute(&mut context)?)
    }

    fn dispatch(&self, request: EnclaveRequest) -> EnclaveResult<EnclaveResponse> {
        use EnclaveRequest as Req;
        use EnclaveResponse as Resp;

        Ok(match request {
            Req::RegisterTrigger { trigger } => {
                let trigger = trigger.into_trigger(self.config.execution.default_gas_limit);
                let trigger_id = self.triggers.register(trigger)?;
                Resp::TriggerRegistered { trigger_id }
            }
            Req::UnregisterTrigger { id } => {
                self.triggers.unregister(&id)?;
                Resp::Ack
            }
            Req::EnableTrigger { id } => {
                self.triggers.enable(&id)?;
                Resp::Ack
            }
            Req::DisableTrigger { id } => {
                self.triggers.disable(&id)?;
                Resp::Ack
            }
            Req::GetTrigger { id } => Resp::Trigger {
                trigger: self.triggers.get_trigger(&id)?,
            },
            Req::ListTriggers => Resp::Triggers {
                triggers: self.triggers.list_triggers(),
            },
            Req::ProcessScheduledTriggers { current_time } => Resp::Processed {
                count: self.triggers.process_scheduled(current_time),
            },
            Req::ProcessBlockchainEvent { event } => Resp::Processed {
                count: self.triggers.process_blockchain_event(&event)?,
            },
            Req::ProcessStorageEvent { key, operation } => Resp::Processed {
                count: self.triggers.process_storage_event(&key, &operation),
            },
            Req::ProcessExternalEvent {
                event_type,
                payload,
            } => Resp::Processed {
                count: self.triggers.process_external_event(&event_type, &payload)?,
            },
            Req::ExecuteScript {
                function_id,
                user_id,
                code,
                input,
                gas_limit,
            } => Resp::Execution {
                output: self.execute_script(&function_id, &user_id, &code, input, gas_limit)?,
            },
            Req::GenerateRandom {
                min,
                max,
                user_id,
                request_id,
            } => Resp::Random {
                value: self.randomness.generate(min, max, &user_id, &request_id)?,
            },
            Req::GetRandomProof {
                value,
                min,
                max,
                user_id,
                request_id,
            } => Resp::RandomProof {
                proof: self
                    .randomness
                    .prove(value, min, max, &user_id, &request_id)?,
            },
            Req::VerifyRandom {
                value,
                min,
                max,
                user_id,
                request_id,
                proof,
            } => Resp::Verified {
                valid: self
                    .randomness
                    .verify(value, min, max, &user_id, &request_id, &proof),
            },
            Req::GenerateRandomBytes {
                length,
                user_id,
                request_id,
            } => Resp::RandomBytes {
                proof: self
                    .randomness
                    .generate_bytes(length, &user_id, &request_id)?,
            },
            Req::GenerateSeed {
                user_id,
                request_id,
            } => Resp::RandomBytes {
                proof: self.randomness.generate_seed(&user_id, &request_id)?,
            },
            Req::VerifySeed { proof } => Resp::Verified {
                valid: self.randomness.verify_bytes(&proof),
            },
            Req::VerifyCompliance {
                code,
                user_id,
                function_id,
                rules,
                jurisdiction,
            } => {
                require("user_id", &user_id)?;
                require("function_id", &function_id)?;
                let mut rules = match rules {
                    Some(rules) => rules,
                    None => self
                        .compliance
                        .get_rules(jurisdiction.as_deref().unwrap_or(GLOBAL_JURISDICTION))?,
                };
                if let Some(jurisdiction) = jurisdiction {
                    rules.jurisdiction = jurisdiction;
                }
                require("jurisdiction", &rules.jurisdiction)?;
                Resp::Compliance {
                    report: self
                        .compliance
                        .verify_code(&code, &user_id, &function_id, &rules)?,
                }
            }
            Req::GetComplianceRules { jurisdiction } => Resp::Rules {
                rules: self.compliance.get_rules(&jurisdiction)?,
            },
            Req::SetComplianceRules {
                jurisdiction,
                rules,
            } => Resp::Rules {
                rules: self.compliance.set_rules(&jurisdiction, rules)?,
            },
            Req::VerifyIdentity {
                user_id,
                identity_data,
                jurisdiction,
            } => {
                require("user_id", &user_id)?;
                require("jurisdiction", &jurisdiction)?;
                Resp::Compliance {
                    report: self
                        .compliance
                        .verify_identity(&user_id, &identity_data, &jurisdiction)?,
                }
            }
            Req::GetComplianceStatus {
                function_id,
                jurisdiction,
            } => Resp::ComplianceStatus {
                report: self
                    .compliance
                    .get_compliance_status(&function_id, &jurisdiction)?,
            },
            Req::GetIdentityStatus {
                user_id,
                jurisdiction,
            } => Resp::ComplianceStatus {
                report: self.compliance.get_identity_status(&user_id, &jurisdiction)?,
            },
            Req::StoreSecret {
                user_id,
                name,
                value,
            } => {
                self.secrets.store_secret(&user_id, &name, value.expose())?;
                Resp::Ack
            }
            Req::DeleteSecret { user_id, name } => Resp::Deleted {
                deleted: self.secrets.delete_secret(&user_id, &name)?,
            },
            Req::ListSecretNames { user_id } => Resp::SecretNames {
                names: self.secrets.list_secret_names(&user_id)?,
            },
            Req::GetAttestation { report_data } => {
                let data = hex::decode(report_data.trim()).map_err(|e| {
                    EnclaveError::InvalidRequest(format!("report_data is not hex: {e}"))
                })?;
                Resp::Attestation {
                    report: self.attestation.generate_report(&data)?,
                    randomness_public_key: self.randomness.public_key_hex()?,
                    attestation_public_key: self.attestation.public_key_hex()?,
                }
            }
            Req::GetGasAccount { user_id } => Resp::GasAccount {
                account: self.gas.get_account(&user_id)?,
            },
            Req::UpdateGasBalance { user_id, amount } => Resp::GasAccount {
                account: self.gas.update_gas_balance(&user_id, amount)?,
            },
            Req::GetGasUsage { function_id } => Resp::GasUsage {
                usage: self.gas.get_gas_usage(&function_id)?,
            },
            Req::ListKeys => Resp::Keys {
                keys: self.keys.list_keys()?,
            },
            Req::RotateKey { purpose } => Resp::Key {
                key: self.keys.rotate(purpose)?,
            },
            Req::GetMetrics => Resp::Metrics {
                text: self
                    .metrics
                    .gather_text()
                    .map_err(|e| EnclaveError::Metrics(e.to_string()))?,
            },
        })
    }
}

impl std::fmt::Debug for Enclave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enclave")
            .field("identity", &self.identity)
            .field("backend", &self.config.storage_backend)
            .finish_non_exhaustive()
    }
}
