//! Simulated attestation reports.
//!
//! A report binds caller-supplied data to the enclave measurement and is
//! signed with the current generation of the attestation key.

use crate::enclave::{EnclaveIdentity, KeyPurpose};
use crate::error::AttestationError;
use crate::keys::KeyManager;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::Signature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Capacity of the report data field, in bytes.
pub const REPORT_DATA_LEN: usize = 64;

const REPORT_VERSION: u16 = 1;

/// How a report was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    /// Signed by the simulated enclave key.
    Simulated,
}

impl ReportType {
    fn tag(&self) -> u8 {
        match self {
            ReportType::Simulated => 0,
        }
    }
}

/// Signed statement about the running enclave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationReport {
    pub version: u16,
    pub report_type: ReportType,
    /// Hex enclave measurement.
    pub mrenclave: String,
    /// Hex report data, zero-padded to 64 bytes.
    pub report_data: String,
    /// Unix seconds.
    pub timestamp: u64,
    /// Base64 ECDSA P-256 signature.
    pub signature: String,
    /// Generation of the attestation key that signed the report.
    #[serde(default)]
    pub key_generation: u32,
}

impl AttestationReport {
    /// Digest covered by the signature, or `None` when a hex field is malformed.
    fn digest(&self) -> Option<[u8; 32]> {
        let mrenclave = hex::decode(&self.mrenclave).ok()?;
        let report_data = hex::decode(&self.report_data).ok()?;
        if mrenclave.len() != 32 || report_data.len() != REPORT_DATA_LEN {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_be_bytes());
        hasher.update([self.report_type.tag()]);
        hasher.update(&mrenclave);
        hasher.update(&report_data);
        hasher.update(self.timestamp.to_be_bytes());
        Some(hasher.finalize().into())
    }
}

/// Produces and checks reports for one enclave identity.
pub struct AttestationService {
    measurement: [u8; 32],
    keys: Arc<KeyManager>,
}

impl AttestationService {
    pub fn new(identity: &EnclaveIdentity, keys: Arc<KeyManager>) -> Self {
        Self {
            measurement: identity.measurement(),
            keys,
        }
    }

    /// SEC1 compressed public key of the current attestation key, hex-encoded.
    pub fn public_key_hex(&self) -> Result<String, AttestationError> {
        self.keys
            .public_key_hex(KeyPurpose::Attestation)
            .map_err(|e| AttestationError::Signing(e.to_string()))
    }

    pub fn generate_report(&self, report_data: &[u8]) -> Result<AttestationReport, AttestationError> {
        if report_data.len() > REPORT_DATA_LEN {
            return Err(AttestationError::ReportDataTooLong {
                len: report_data.len(),
                max: REPORT_DATA_LEN,
            });
        }
        let mut padded = [0u8; REPORT_DATA_LEN];
        padded[..report_data.len()].copy_from_slice(report_data);

        let mut report = AttestationReport {
            version: REPORT_VERSION,
            report_type: ReportType::Simulated,
            mrenclave: hex::encode(self.measurement),
            report_data: hex::encode(padded),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            signature: String::new(),
            key_generation: 0,
        };
        let digest = report
            .digest()
            .ok_or_else(|| AttestationError::Signing("report fields are malformed".into()))?;
        let (generation, signing_key) = self
            .keys
            .current_key(KeyPurpose::Attestation)
            .map_err(|e| AttestationError::Signing(e.to_string()))?;
        report.key_generation = generation;
        let signature: Signature = signing_key
            .sign_prehash(&digest)
            .map_err(|e| AttestationError::Signing(e.to_string()))?;
        report.signature = BASE64.encode(signature.to_bytes());
        debug!(key_generation = generation, "attestation report generated");
        Ok(report)
    }

    /// Whether `report` was signed by this enclave for its own measurement.
    pub fn verify_report(&self, report: &AttestationReport) -> bool {
        if report.version != REPORT_VERSION || report.mrenclave != hex::encode(self.measurement) {
            return false;
        }
        let Some(digest) = report.digest() else {
            return false;
        };
        let Ok(bytes) = BASE64.decode(&report.signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        let Ok(verifying_key) = self
            .keys
            .verifying_key(KeyPurpose::Attestation, report.key_generation)
        else {
            return false;
        };
        verifying_key.verify_prehash(&digest, &signature).is_ok()
    }
}

impl std::fmt::Debug for AttestationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationService")
            .field("mrenclave", &hex::encode(self.measurement))
            .finish_non_exhaustive()
    }
}
