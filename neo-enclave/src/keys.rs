//! Signing key generations.
//!
//! The randomness and attestation keys are derived from the enclave identity
//! per generation. Rotation moves a purpose to its next generation; every
//! earlier generation stays derivable, so proofs and reports signed before a
//! rotation keep verifying. Only the generation numbers and their creation
//! times are persisted, never key material.
//!
//! The storage sealing key does not rotate: every sealed record depends on it.

use crate::enclave::{EnclaveIdentity, KeyPurpose};
use crate::error::{KeyError, KeyResult};
use crate::storage::{SecureStorage, KEYS_NAMESPACE};
use p256::ecdsa::{SigningKey, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn record_key(purpose: KeyPurpose) -> String {
    format!("purpose:{purpose}")
}

/// Public view of one key generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub purpose: KeyPurpose,
    pub generation: u32,
    /// SEC1 compressed public key, hex-encoded.
    pub public_key: String,
    /// Unix seconds.
    pub created_at: u64,
    /// Whether new signatures use this generation.
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct KeyRecord {
    purpose: KeyPurpose,
    /// Creation time of each generation; the last entry is current.
    created_at: Vec<u64>,
}

impl KeyRecord {
    fn new(purpose: KeyPurpose) -> Self {
        Self {
            purpose,
            created_at: vec![now_secs()],
        }
    }

    fn current(&self) -> u32 {
        self.created_at.len().saturating_sub(1) as u32
    }
}

/// Tracks the current generation of each signing purpose.
pub struct KeyManager {
    identity: Arc<EnclaveIdentity>,
    storage: Arc<SecureStorage>,
    records: RwLock<BTreeMap<KeyPurpose, KeyRecord>>,
}

impl KeyManager {
    /// Load the generation records, creating first-generation records on the
    /// first start.
    pub fn new(identity: Arc<EnclaveIdentity>, storage: Arc<SecureStorage>) -> KeyResult<Self> {
        let mut records = BTreeMap::new();
        let mut tx = storage.transaction();
        for purpose in KeyPurpose::SIGNING {
            let key = record_key(purpose);
            let record = match storage.retrieve_json::<KeyRecord>(KEYS_NAMESPACE, &key)? {
                Some(record) if !record.created_at.is_empty() => record,
                _ => {
                    let record = KeyRecord::new(purpose);
                    tx.put_json(KEYS_NAMESPACE, &key, &record)?;
                    record
                }
            };
            records.insert(purpose, record);
        }
        if !tx.is_empty() {
            info!(created = tx.len(), "initialized signing key records");
        }
        tx.commit()?;

        Ok(Self {
            identity,
            storage,
            records: RwLock::new(records),
        })
    }

    fn check_purpose(purpose: KeyPurpose) -> KeyResult<()> {
        if KeyPurpose::SIGNING.contains(&purpose) {
            Ok(())
        } else {
            Err(KeyError::UnsupportedPurpose(purpose.to_string()))
        }
    }

    /// Current generation of `purpose`.
    pub fn current_generation(&self, purpose: KeyPurpose) -> KeyResult<u32> {
        Self::check_purpose(purpose)?;
        Ok(self
            .records
            .read()
            .get(&purpose)
            .map(KeyRecord::current)
            .unwrap_or(0))
    }

    /// Key that new signatures for `purpose` use, with its generation.
    pub fn current_key(&self, purpose: KeyPurpose) -> KeyResult<(u32, SigningKey)> {
        let generation = self.current_generation(purpose)?;
        Ok((generation, self.identity.signing_key_at(purpose, generation)?))
    }

    /// Verifying key of an issued generation.
    pub fn verifying_key(&self, purpose: KeyPurpose, generation: u32) -> KeyResult<VerifyingKey> {
        if generation > self.current_generation(purpose)? {
            return Err(KeyError::UnknownGeneration {
                purpose: purpose.to_string(),
                generation,
            });
        }
        Ok(*self.identity.signing_key_at(purpose, generation)?.verifying_key())
    }

    /// Current public key of `purpose`, SEC1 compressed and hex-encoded.
    pub fn public_key_hex(&self, purpose: KeyPurpose) -> KeyResult<String> {
        let generation = self.current_generation(purpose)?;
        Ok(encode_public(&self.verifying_key(purpose, generation)?))
    }

    /// Move `purpose` to a new generation. The record is persisted before
    /// the new key is used.
    pub fn rotate(&self, purpose: KeyPurpose) -> KeyResult<KeyInfo> {
        Self::check_purpose(purpose)?;
        let mut records = self.records.write();
        let mut record = records
            .get(&purpose)
            .cloned()
            .unwrap_or_else(|| KeyRecord::new(purpose));
        let created_at = now_secs();
        record.created_at.push(created_at);
        let generation = record.current();
        let public_key = encode_public(
            self.identity
                .signing_key_at(purpose, generation)?
                .verifying_key(),
        );

        self.storage
            .store_json(KEYS_NAMESPACE, &record_key(purpose), &record)?;
        records.insert(purpose, record);
        info!(%purpose, generation, "signing key rotated");
        Ok(KeyInfo {
            purpose,
            generation,
            public_key,
            created_at,
            active: true,
        })
    }

    /// Every generation of every signing purpose, oldest first.
    pub fn list_keys(&self) -> KeyResult<Vec<KeyInfo>> {
        let records = self.records.read();
        let mut keys = Vec::new();
        for (purpose, record) in records.iter() {
            let current = record.current();
            for (generation, created_at) in record.created_at.iter().enumerate() {
                let generation = generation as u32;
                let signing = self.identity.signing_key_at(*purpose, generation)?;
                keys.push(KeyInfo {
                    purpose: *purpose,
                    generation,
                    public_key: encode_public(signing.verifying_key()),
                    created_at: *created_at,
                    active: generation == current,
                });
            }
        }
        Ok(keys)
    }
}

fn encode_public(key: &VerifyingKey) -> String {
    hex::encode(key.to_encoded_point(true).as_bytes())
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let generations: BTreeMap<_, _> = self
            .records
            .read()
            .iter()
            .map(|(purpose, record)| (*purpose, record.current()))
            .collect();
        f.debug_struct("KeyManager")
            .field("generations", &generations)
            .finish_non_exhaustive()
    }
}
