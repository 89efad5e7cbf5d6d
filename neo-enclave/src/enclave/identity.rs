//! Enclave identity and key derivation.
//!
//! All long-lived keys (storage sealing, randomness signing, attestation) are
//! derived from one root secret bound to the enclave measurement. In
//! simulation mode the root secret is a random seed persisted next to the
//! sealed data, so keys are stable across restarts of the same deployment.

use super::sealing::{derive_key_hkdf, SecureKey};
use crate::error::{SealingError, SealingResult};
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// File holding the simulated root secret.
pub const SEED_FILE_NAME: &str = "enclave.seed";

const ENCLAVE_TAG: &[u8] = b"neo-service-layer-enclave-v1";

/// Purpose of a derived key. Each purpose yields an independent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    /// AES-256-GCM key sealing storage values.
    StorageSealing,
    /// ECDSA P-256 key signing randomness proofs.
    RandomnessSigning,
    /// ECDSA P-256 key signing attestation reports.
    Attestation,
}

impl KeyPurpose {
    fn info(self) -> &'static [u8] {
        match self {
            Self::StorageSealing => b"neo-enclave/storage-sealing/v1",
            Self::RandomnessSigning => b"neo-enclave/randomness-signing/v1",
            Self::Attestation => b"neo-enclave/attestation/v1",
        }
    }

    /// Wire name of the purpose.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StorageSealing => "storage_sealing",
            Self::RandomnessSigning => "randomness_signing",
            Self::Attestation => "attestation",
        }
    }

    /// Purposes whose key is an ECDSA signing key.
    pub const SIGNING: [KeyPurpose; 2] = [Self::RandomnessSigning, Self::Attestation];
}

impl std::fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the running enclave.
pub struct EnclaveIdentity {
    measurement: [u8; 32],
    root_secret: SecureKey,
    seal_counter: AtomicU64,
}

impl EnclaveIdentity {
    /// Identity built from a known root secret.
    pub fn from_root_secret(root_secret: [u8; 32]) -> Self {
        Self {
            measurement: Self::compute_measurement(),
            root_secret: SecureKey::new(root_secret),
            seal_counter: AtomicU64::new(Self::counter_floor()),
        }
    }

    /// Sealing counters start at the current time in microseconds so values
    /// written after a restart order after those written before it.
    fn counter_floor() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
            .max(1)
    }

    /// Identity with a fresh random root secret that is never persisted.
    pub fn ephemeral() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        Self::from_root_secret(*seed)
    }

    /// Load the simulated root secret from `dir`, creating it on first start.
    pub fn load_or_create(dir: &Path) -> SealingResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| SealingError::Identity(format!("Cannot create {}: {}", dir.display(), e)))?;
        let path = dir.join(SEED_FILE_NAME);

        if path.exists() {
            let encoded = Zeroizing::new(
                std::fs::read_to_string(&path)
                    .map_err(|e| SealingError::Identity(format!("Cannot read seed: {}", e)))?,
            );
            let bytes = Zeroizing::new(
                hex::decode(encoded.trim())
                    .map_err(|e| SealingError::Identity(format!("Seed is not hex: {}", e)))?,
            );
            if bytes.len() != 32 {
                return Err(SealingError::Identity(format!(
                    "Seed must be 32 bytes, found {}",
                    bytes.len()
                )));
            }
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            debug!(path = %path.display(), "loaded enclave identity seed");
            return Ok(Self::from_root_secret(seed));
        }

        let identity = Self::ephemeral();
        let encoded = Zeroizing::new(hex::encode(identity.root_secret.as_bytes()));
        std::fs::write(&path, encoded.as_bytes())
            .map_err(|e| SealingError::Identity(format!("Cannot persist seed: {}", e)))?;
        info!(path = %path.display(), "created new enclave identity seed");
        Ok(identity)
    }

    fn compute_measurement() -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(ENCLAVE_TAG);
        hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
        hasher.finalize().into()
    }

    /// Simulated MRENCLAVE.
    pub fn measurement(&self) -> [u8; 32] {
        self.measurement
    }

    /// Derive the symmetric key for `purpose`.
    pub fn derive_key(&self, purpose: KeyPurpose) -> SealingResult<SecureKey> {
        derive_key_hkdf(self.root_secret.as_bytes(), &self.measurement, purpose.info())
    }

    /// Derive the first-generation P-256 signing key for `purpose`.
    pub fn signing_key(&self, purpose: KeyPurpose) -> SealingResult<SigningKey> {
        self.signing_key_at(purpose, 0)
    }

    /// Derive a deterministic P-256 signing key for `purpose` at
    /// `generation`. Each rotation moves to the next generation; older
    /// generations stay derivable so their signatures keep verifying.
    ///
    /// HKDF output outside the curve order is rejected by `from_slice`; the
    /// attempt index is mixed into the info string until a valid scalar comes out.
    pub fn signing_key_at(&self, purpose: KeyPurpose, generation: u32) -> SealingResult<SigningKey> {
        let mut base = purpose.info().to_vec();
        if generation > 0 {
            base.extend_from_slice(b"/gen/");
            base.extend_from_slice(&generation.to_be_bytes());
        }
        for attempt in 0u8..8 {
            let mut info = base.clone();
            info.push(attempt);
            let candidate =
                derive_key_hkdf(self.root_secret.as_bytes(), &self.measurement, &info)?;
            if let Ok(key) = SigningKey::from_slice(candidate.as_bytes()) {
                return Ok(key);
            }
        }
        Err(SealingError::Crypto(
            "Unable to derive a valid signing key".to_string(),
        ))
    }

    /// Next value of the sealing counter.
    pub fn next_counter(&self) -> u64 {
        self.seal_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Move the sealing counter past a value read back from storage, so the
    /// next seal always carries a larger counter than anything seen so far.
    pub fn observe_counter(&self, counter: u64) {
        self.seal_counter
            .fetch_max(counter.saturating_add(1), Ordering::SeqCst);
    }
}

impl std::fmt::Debug for EnclaveIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveIdentity")
            .field("measurement", &hex::encode(self.measurement))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_seed_persists_across_loads() {
        let temp = tempdir().unwrap();
        let first = EnclaveIdentity::load_or_create(temp.path()).unwrap();
        let second = EnclaveIdentity::load_or_create(temp.path()).unwrap();

        let a = first.derive_key(KeyPurpose::StorageSealing).unwrap();
        let b = second.derive_key(KeyPurpose::StorageSealing).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert!(temp.path().join(SEED_FILE_NAME).exists());
    }

    #[test]
    fn test_purposes_are_independent() {
        let identity = EnclaveIdentity::ephemeral();
        let storage = identity.derive_key(KeyPurpose::StorageSealing).unwrap();
        let attestation = identity.derive_key(KeyPurpose::Attestation).unwrap();
        assert_ne!(storage.as_bytes(), attestation.as_bytes());
    }

    #[test]
    fn test_signing_key_is_deterministic() {
        let identity = EnclaveIdentity::from_root_secret([7u8; 32]);
        let a = identity.signing_key(KeyPurpose::RandomnessSigning).unwrap();
        let b = identity.signing_key(KeyPurpose::RandomnessSigning).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn test_signing_generations_differ() {
        let identity = EnclaveIdentity::from_root_secret([7u8; 32]);
        let first = identity.signing_key(KeyPurpose::Attestation).unwrap();
        let gen0 = identity.signing_key_at(KeyPurpose::Attestation, 0).unwrap();
        let gen1 = identity.signing_key_at(KeyPurpose::Attestation, 1).unwrap();
        assert_eq!(first.to_bytes(), gen0.to_bytes());
        assert_ne!(gen0.to_bytes(), gen1.to_bytes());
        assert_eq!(
            gen1.to_bytes(),
            identity.signing_key_at(KeyPurpose::Attestation, 1).unwrap().to_bytes()
        );
    }

    #[test]
    fn test_ephemeral_identities_differ() {
        let a = EnclaveIdentity::ephemeral();
        let b = EnclaveIdentity::ephemeral();
        assert_ne!(
            a.derive_key(KeyPurpose::StorageSealing).unwrap().as_bytes(),
            b.derive_key(KeyPurpose::StorageSealing).unwrap().as_bytes()
        );
        assert_eq!(a.measurement(), b.measurement());
    }

    #[test]
    fn test_rejects_malformed_seed() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join(SEED_FILE_NAME), "abcd").unwrap();
        assert!(EnclaveIdentity::load_or_create(temp.path()).is_err());
    }

    #[test]
    fn test_counter_is_monotonic() {
        let identity = EnclaveIdentity::ephemeral();
        let a = identity.next_counter();
        let b = identity.next_counter();
        assert!(b > a);
    }

    #[test]
    fn test_observed_counter_moves_floor() {
        let identity = EnclaveIdentity::ephemeral();
        let current = identity.next_counter();
        identity.observe_counter(current + 1_000);
        assert!(identity.next_counter() > current + 1_000);

        // Older values never move the counter back.
        identity.observe_counter(1);
        assert!(identity.next_counter() > current + 1_000);
    }
}
