//! Data sealing for the enclave
//!
//! Provides encryption/decryption of data using enclave-specific keys.
//! In SGX mode the root key would come from EGETKEY; in simulation mode it is
//! a software seed held by [`super::EnclaveIdentity`].

use crate::error::{SealingError, SealingResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

/// Sealed data container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedData {
    /// Encrypted data
    pub ciphertext: Vec<u8>,
    /// Nonce used for encryption
    pub nonce: [u8; 12],
    /// Additional authenticated data (AAD)
    pub aad: Vec<u8>,
    /// Monotonic counter value when sealed (for replay protection)
    pub counter: u64,
    /// Version of the sealing format
    pub version: u8,
}

impl SealedData {
    /// Current sealing format version
    pub const CURRENT_VERSION: u8 = 1;

    /// Serialize to bytes
    pub fn to_bytes(&self) -> SealingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SealingError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> SealingResult<Self> {
        serde_json::from_slice(data).map_err(|e| SealingError::Serialization(e.to_string()))
    }
}

/// Seal data using the enclave's sealing key
pub fn seal_data(
    plaintext: &[u8],
    sealing_key: &SecureKey,
    aad: &[u8],
    counter: u64,
) -> SealingResult<SealedData> {
    // SECURITY: Must use OsRng for AES-GCM nonce generation
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(sealing_key.as_bytes())
        .map_err(|e| SealingError::Crypto(format!("Failed to create cipher: {}", e)))?;

    let ciphertext = cipher
        .encrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| SealingError::SealingFailed(format!("Encryption failed: {}", e)))?;

    Ok(SealedData {
        ciphertext,
        nonce: nonce_bytes,
        aad: aad.to_vec(),
        counter,
        version: SealedData::CURRENT_VERSION,
    })
}

/// Unseal data using the enclave's sealing key.
///
/// `expected_aad` must match the AAD recorded at sealing time; a value copied
/// under a different namespace or key is rejected before decryption.
pub fn unseal_data(
    sealed: &SealedData,
    sealing_key: &SecureKey,
    expected_aad: &[u8],
    min_counter: Option<u64>,
) -> SealingResult<Vec<u8>> {
    if sealed.version != SealedData::CURRENT_VERSION {
        return Err(SealingError::UnsealingFailed(format!(
            "Unsupported sealing version: {}",
            sealed.version
        )));
    }

    if sealed.aad != expected_aad {
        return Err(SealingError::UnsealingFailed(
            "AAD mismatch - possible tampering".to_string(),
        ));
    }

    if let Some(min) = min_counter {
        if sealed.counter < min {
            return Err(SealingError::UnsealingFailed(
                "Sealed data counter too old (potential replay attack)".to_string(),
            ));
        }
    }

    let cipher = Aes256Gcm::new_from_slice(sealing_key.as_bytes())
        .map_err(|e| SealingError::Crypto(format!("Failed to create cipher: {}", e)))?;

    let nonce = Nonce::from_slice(&sealed.nonce);
    cipher
        .decrypt(
            nonce,
            aes_gcm::aead::Payload {
                msg: &sealed.ciphertext,
                aad: &sealed.aad,
            },
        )
        .map_err(|e| SealingError::UnsealingFailed(format!("Decryption failed: {}", e)))
}

/// Derive a 32-byte key with HKDF-SHA256.
pub fn derive_key_hkdf(ikm: &[u8], salt: &[u8], info: &[u8]) -> SealingResult<SecureKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| SealingError::Crypto(format!("HKDF expand failed: {}", e)))?;
    let key = SecureKey::new(okm);
    okm.zeroize();
    Ok(key)
}

/// Secure key container that zeros memory on drop
#[derive(Clone)]
pub struct SecureKey {
    key: [u8; 32],
}

impl SecureKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecureKey(..)")
    }
}

impl Zeroize for SecureKey {
    fn zeroize(&mut self) {
        self.key.zeroize();
    }
}

impl Drop for SecureKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> SecureKey {
        SecureKey::new(rand::random())
    }

    #[test]
    fn test_seal_unseal() {
        let key = random_key();
        let plaintext = b"Hello, enclave world!";
        let aad = b"triggers\x00trigger:1";

        let sealed = seal_data(plaintext, &key, aad, 1).unwrap();
        let unsealed = unseal_data(&sealed, &key, aad, None).unwrap();

        assert_eq!(unsealed, plaintext);
    }

    #[test]
    fn test_replay_protection() {
        let key = random_key();
        let sealed = seal_data(b"secret data", &key, &[], 5).unwrap();

        assert!(unseal_data(&sealed, &key, &[], Some(5)).is_ok());
        assert!(unseal_data(&sealed, &key, &[], Some(4)).is_ok());
        assert!(unseal_data(&sealed, &key, &[], Some(6)).is_err());
    }

    #[test]
    fn test_tamper_detection() {
        let key = random_key();
        let mut sealed = seal_data(b"important data", &key, &[], 1).unwrap();

        sealed.ciphertext[0] ^= 0xFF;

        assert!(unseal_data(&sealed, &key, &[], None).is_err());
    }

    #[test]
    fn test_aad_mismatch_rejected() {
        let key = random_key();
        let sealed = seal_data(b"value", &key, b"ns\x00a", 1).unwrap();

        let err = unseal_data(&sealed, &key, b"ns\x00b", None).unwrap_err();
        assert!(matches!(err, SealingError::UnsealingFailed(_)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = seal_data(b"value", &random_key(), b"aad", 1).unwrap();
        assert!(unseal_data(&sealed, &random_key(), b"aad", None).is_err());
    }

    #[test]
    fn test_hkdf_is_deterministic_and_domain_separated() {
        let a = derive_key_hkdf(b"root", b"salt", b"storage").unwrap();
        let b = derive_key_hkdf(b"root", b"salt", b"storage").unwrap();
        let c = derive_key_hkdf(b"root", b"salt", b"signing").unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_sealed_data_bytes_roundtrip() {
        let key = random_key();
        let sealed = seal_data(b"payload", &key, b"aad", 3).unwrap();
        let restored = SealedData::from_bytes(&sealed.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.counter, 3);
        assert_eq!(unseal_data(&restored, &key, b"aad", None).unwrap(), b"payload");
    }
}
