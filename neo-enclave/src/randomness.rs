//! Verifiable randomness.
//!
//! Every issued value is signed with the current generation of the
//! randomness signing key and persisted, so a proof can be re-fetched and checked after a
//! restart. Recently issued proofs are also kept in a TTL-bounded LRU cache
//! that short-circuits verification; both paths give the same answer.

use crate::config::RandomnessConfig;
use crate::enclave::KeyPurpose;
use crate::error::{RandomnessError, RandomnessResult};
use crate::keys::KeyManager;
use crate::storage::{SecureStorage, RANDOMNESS_NAMESPACE};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use lru::LruCache;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::Signature;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Largest byte string served by [`RandomnessService::generate_bytes`].
pub const MAX_RANDOM_BYTES: usize = 1024;

/// Length of a seed from [`RandomnessService::generate_seed`].
pub const SEED_LENGTH: usize = 32;

const BYTES_DOMAIN: &[u8] = b"neo-enclave/random-bytes/v1";

/// Signed record of one bounded random value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessProof {
    pub value: u64,
    pub min: u64,
    pub max: u64,
    pub user_id: String,
    pub request_id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Base64 ECDSA P-256 signature over [`RandomnessProof::digest`].
    pub signature: String,
    /// Generation of the signing key.
    #[serde(default)]
    pub key_generation: u32,
}

impl RandomnessProof {
    /// SHA-256 over the first six fields. Integers are big-endian, strings
    /// carry a u64 length prefix.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.value.to_be_bytes());
        hasher.update(self.min.to_be_bytes());
        hasher.update(self.max.to_be_bytes());
        update_prefixed(&mut hasher, self.user_id.as_bytes());
        update_prefixed(&mut hasher, self.request_id.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.finalize().into()
    }

    fn matches(&self, value: u64, min: u64, max: u64, user_id: &str, request_id: &str) -> bool {
        self.value == value
            && self.min == min
            && self.max == max
            && self.user_id == user_id
            && self.request_id == request_id
    }
}

/// Signed record of random bytes or a seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomBytesProof {
    /// Hex-encoded random bytes.
    pub data: String,
    pub user_id: String,
    pub request_id: String,
    pub timestamp: u64,
    pub signature: String,
    #[serde(default)]
    pub key_generation: u32,
}

impl RandomBytesProof {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(BYTES_DOMAIN);
        update_prefixed(&mut hasher, self.data.as_bytes());
        update_prefixed(&mut hasher, self.user_id.as_bytes());
        update_prefixed(&mut hasher, self.request_id.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.finalize().into()
    }
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn proof_key(request_id: &str) -> String {
    format!("proof:{}", request_id)
}

fn bytes_key(request_id: &str) -> String {
    format!("bytes:{}", request_id)
}

struct CachedProof {
    proof: RandomnessProof,
    inserted: Instant,
}

/// Issues and verifies signed random values.
pub struct RandomnessService {
    storage: Arc<SecureStorage>,
    keys: Arc<KeyManager>,
    cache: Mutex<LruCache<String, CachedProof>>,
    ttl: Duration,
    issue_lock: Mutex<()>,
}

impl RandomnessService {
    pub fn new(
        storage: Arc<SecureStorage>,
        keys: Arc<KeyManager>,
        config: &RandomnessConfig,
    ) -> RandomnessResult<Self> {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            storage,
            keys,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl: config.cache_ttl(),
            issue_lock: Mutex::new(()),
        })
    }

    /// SEC1 compressed public key of the current generation, hex-encoded.
    pub fn public_key_hex(&self) -> RandomnessResult<String> {
        self.keys
            .public_key_hex(KeyPurpose::RandomnessSigning)
            .map_err(|e| RandomnessError::Signing(e.to_string()))
    }

    fn check_ids(user_id: &str, request_id: &str) -> RandomnessResult<()> {
        if user_id.is_empty() {
            return Err(RandomnessError::InvalidRequest("user id is required".into()));
        }
        if request_id.is_empty() {
            return Err(RandomnessError::InvalidRequest("request id is required".into()));
        }
        Ok(())
    }

    /// Sign with the current generation, returning the signature and the
    /// generation that made it.
    fn sign(&self, digest: &[u8; 32]) -> RandomnessResult<(String, u32)> {
        let (generation, signing_key) = self
            .keys
            .current_key(KeyPurpose::RandomnessSigning)
            .map_err(|e| RandomnessError::Signing(e.to_string()))?;
        let signature: Signature = signing_key
            .sign_prehash(digest)
            .map_err(|e| RandomnessError::Signing(e.to_string()))?;
        Ok((BASE64.encode(signature.to_bytes()), generation))
    }

    fn signature_valid(&self, digest: &[u8; 32], signature: &str, generation: u32) -> bool {
        let Ok(verifying_key) = self.keys.verifying_key(KeyPurpose::RandomnessSigning, generation)
        else {
            return false;
        };
        let Ok(bytes) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };
        verifying_key.verify_prehash(digest, &signature).is_ok()
    }

    fn cached(&self, request_id: &str) -> Option<RandomnessProof> {
        let mut cache = self.cache.lock();
        let expired = match cache.get(request_id) {
            Some(entry) if entry.inserted.elapsed() <= self.ttl => return Some(entry.proof.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(request_id);
        }
        None
    }

    fn stored(&self, request_id: &str) -> RandomnessResult<Option<RandomnessProof>> {
        Ok(self
            .storage
            .retrieve_json(RANDOMNESS_NAMESPACE, &proof_key(request_id))?)
    }

    /// Draw a value uniformly from `min..=max`. Each request id is served once.
    pub fn generate(&self, min: u64, max: u64, user_id: &str, request_id: &str) -> RandomnessResult<u64> {
        if min > max {
            return Err(RandomnessError::InvalidRange { min, max });
        }
        Self::check_ids(user_id, request_id)?;

        let _guard = self.issue_lock.lock();
        if self.cached(request_id).is_some() || self.stored(request_id)?.is_some() {
            return Err(RandomnessError::DuplicateRequest(request_id.to_string()));
        }

        let value = OsRng.gen_range(min..=max);
        let mut proof = RandomnessProof {
            value,
            min,
            max,
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            timestamp: now_millis(),
            signature: String::new(),
            key_generation: 0,
        };
        (proof.signature, proof.key_generation) = self.sign(&proof.digest())?;

        self.storage
            .store_json(RANDOMNESS_NAMESPACE, &proof_key(request_id), &proof)?;
        self.cache.lock().put(
            request_id.to_string(),
            CachedProof {
                proof,
                inserted: Instant::now(),
            },
        );
        debug!(request_id, "issued random value");
        Ok(value)
    }

    /// The proof issued for this request. Fails when nothing was issued or
    /// any field differs from what was issued.
    pub fn prove(
        &self,
        value: u64,
        min: u64,
        max: u64,
        user_id: &str,
        request_id: &str,
    ) -> RandomnessResult<RandomnessProof> {
        let proof = match self.cached(request_id) {
            Some(proof) => Some(proof),
            None => self.stored(request_id)?,
        };
        match proof {
            Some(proof) if proof.matches(value, min, max, user_id, request_id) => Ok(proof),
            _ => Err(RandomnessError::UnknownRequest(request_id.to_string())),
        }
    }

    /// Check `proof` against the supplied fields.
    pub fn verify(
        &self,
        value: u64,
        min: u64,
        max: u64,
        user_id: &str,
        request_id: &str,
        proof: &RandomnessProof,
    ) -> bool {
        if !proof.matches(value, min, max, user_id, request_id) {
            return false;
        }
        if let Some(issued) = self.cached(request_id) {
            return issued == *proof;
        }
        self.verify_signature(proof)
    }

    /// Cryptographic check only, independent of any cache.
    pub fn verify_signature(&self, proof: &RandomnessProof) -> bool {
        proof.min <= proof.value
            && proof.value <= proof.max
            && self.signature_valid(&proof.digest(), &proof.signature, proof.key_generation)
    }

    /// `len` random bytes with a proof.
    pub fn generate_bytes(&self, len: usize, user_id: &str, request_id: &str) -> RandomnessResult<RandomBytesProof> {
        if len == 0 || len > MAX_RANDOM_BYTES {
            return Err(RandomnessError::InvalidRequest(format!(
                "length must be between 1 and {}",
                MAX_RANDOM_BYTES
            )));
        }
        Self::check_ids(user_id, request_id)?;

        let _guard = self.issue_lock.lock();
        let key = bytes_key(request_id);
        if self.storage.exists(RANDOMNESS_NAMESPACE, &key)? {
            return Err(RandomnessError::DuplicateRequest(request_id.to_string()));
        }

        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        let mut proof = RandomBytesProof {
            data: hex::encode(&bytes),
            user_id: user_id.to_string(),
            request_id: request_id.to_string(),
            timestamp: now_millis(),
            signature: String::new(),
            key_generation: 0,
        };
        (proof.signature, proof.key_generation) = self.sign(&proof.digest())?;
        self.storage.store_json(RANDOMNESS_NAMESPACE, &key, &proof)?;
        debug!(request_id, len, "issued random bytes");
        Ok(proof)
    }

    /// A 32-byte seed with a proof.
    pub fn generate_seed(&self, user_id: &str, request_id: &str) -> RandomnessResult<RandomBytesProof> {
        self.generate_bytes(SEED_LENGTH, user_id, request_id)
    }

    /// Check a bytes or seed proof.
    pub fn verify_bytes(&self, proof: &RandomBytesProof) -> bool {
        if hex::decode(&proof.data).is_err() {
            warn!(request_id = %proof.request_id, "random bytes proof carries malformed data");
            return false;
        }
        self.signature_valid(&proof.digest(), &proof.signature, proof.key_generation)
    }
}

impl std::fmt::Debug for RandomnessService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomnessService")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::EnclaveIdentity;
    use crate::storage::MemoryBackend;
    use proptest::prelude::*;

    struct Fixture {
        storage: Arc<SecureStorage>,
        identity: Arc<EnclaveIdentity>,
    }

    impl Fixture {
        fn new() -> Self {
            let identity = Arc::new(EnclaveIdentity::ephemeral());
            let storage = Arc::new(
                SecureStorage::new(Arc::new(MemoryBackend::new()), identity.clone()).unwrap(),
            );
            Self { storage, identity }
        }

        /// Key records are reloaded from storage, like a restart.
        fn keys(&self) -> Arc<KeyManager> {
            Arc::new(KeyManager::new(self.identity.clone(), self.storage.clone()).unwrap())
        }

        fn service(&self) -> RandomnessService {
            self.service_with(self.keys())
        }

        fn service_with(&self, keys: Arc<KeyManager>) -> RandomnessService {
            RandomnessService::new(self.storage.clone(), keys, &RandomnessConfig::default())
                .unwrap()
        }
    }

    #[test]
    fn test_generate_within_inclusive_range() {
        let fixture = Fixture::new();
        let service = fixture.service();
        for i in 0..50 {
            let value = service.generate(10, 12, "user", &format!("req-{}", i)).unwrap();
            assert!((10..=12).contains(&value));
        }
        assert_eq!(service.generate(7, 7, "user", "fixed").unwrap(), 7);
        assert!(service.generate(0, u64::MAX, "user", "full").is_ok());
    }

    #[test]
    fn test_invalid_range_and_duplicate() {
        let fixture = Fixture::new();
        let service = fixture.service();
        assert_eq!(
            service.generate(5, 4, "user", "r1"),
            Err(RandomnessError::InvalidRange { min: 5, max: 4 })
        );
        service.generate(1, 100, "user", "r1").unwrap();
        assert!(matches!(
            service.generate(1, 100, "user", "r1"),
            Err(RandomnessError::DuplicateRequest(_))
        ));
        assert!(matches!(
            service.generate(1, 100, "user", ""),
            Err(RandomnessError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_prove_and_verify_via_cache() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let value = service.generate(1, 1000, "alice", "req").unwrap();
        let proof = service.prove(value, 1, 1000, "alice", "req").unwrap();

        assert!(service.verify(value, 1, 1000, "alice", "req", &proof));
        assert!(!service.verify(value, 1, 1001, "alice", "req", &proof));
        assert!(!service.verify(value, 1, 1000, "bob", "req", &proof));

        let mut forged = proof.clone();
        forged.timestamp += 1;
        assert!(!service.verify(value, 1, 1000, "alice", "req", &forged));

        assert!(matches!(
            service.prove(value.wrapping_add(1), 1, 1000, "alice", "req"),
            Err(RandomnessError::UnknownRequest(_))
        ));
        assert!(matches!(
            service.prove(value, 1, 1000, "alice", "missing"),
            Err(RandomnessError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_crypto_path_after_restart() {
        let fixture = Fixture::new();
        let (value, proof) = {
            let service = fixture.service();
            let value = service.generate(0, 50, "alice", "req").unwrap();
            (value, service.prove(value, 0, 50, "alice", "req").unwrap())
        };

        let restarted = fixture.service();
        assert_eq!(restarted.prove(value, 0, 50, "alice", "req").unwrap(), proof);
        assert!(restarted.verify(value, 0, 50, "alice", "req", &proof));

        let mut forged = proof.clone();
        forged.timestamp += 1;
        assert!(!restarted.verify(value, 0, 50, "alice", "req", &forged));

        let mut bad_signature = proof.clone();
        bad_signature.signature = BASE64.encode([0u8; 64]);
        assert!(!restarted.verify(value, 0, 50, "alice", "req", &bad_signature));

        assert!(matches!(
            restarted.generate(0, 50, "alice", "req"),
            Err(RandomnessError::DuplicateRequest(_))
        ));
    }

    #[test]
    fn test_cache_and_crypto_paths_agree() {
        let fixture = Fixture::new();
        let service = fixture.service();
        let value = service.generate(3, 9, "u", "agree").unwrap();
        let proof = service.prove(value, 3, 9, "u", "agree").unwrap();

        let cached = service.verify(value, 3, 9, "u", "agree", &proof);
        assert_eq!(cached, service.verify_signature(&proof));
        assert!(cached);
    }

    #[test]
    fn test_expired_cache_falls_back_to_signature() {
        let fixture = Fixture::new();
        let service = RandomnessService::new(
            fixture.storage.clone(),
            fixture.keys(),
            &RandomnessConfig {
                cache_ttl_secs: 0,
                cache_capacity: 4,
            },
        )
        .unwrap();
        let value = service.generate(1, 6, "u", "ttl").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let proof = service.prove(value, 1, 6, "u", "ttl").unwrap();
        assert!(service.verify(value, 1, 6, "u", "ttl", &proof));
    }

    #[test]
    fn test_other_identity_rejects_proof() {
        let fixture = Fixture::new();
        let value = fixture.service().generate(0, 9, "u", "x").unwrap();
        let proof = fixture.service().prove(value, 0, 9, "u", "x").unwrap();

        let other = Fixture::new().service();
        assert!(!other.verify(value, 0, 9, "u", "x", &proof));
    }

    #[test]
    fn test_bytes_and_seed() {
        let fixture = Fixture::new();
        let service = fixture.service();

        let bytes = service.generate_bytes(16, "u", "b1").unwrap();
        assert_eq!(hex::decode(&bytes.data).unwrap().len(), 16);
        assert!(service.verify_bytes(&bytes));

        let seed = service.generate_seed("u", "s1").unwrap();
        assert_eq!(hex::decode(&seed.data).unwrap().len(), SEED_LENGTH);
        assert!(service.verify_bytes(&seed));

        let mut tampered = seed.clone();
        tampered.data = hex::encode([0u8; SEED_LENGTH]);
        assert!(!service.verify_bytes(&tampered));

        assert!(matches!(
            service.generate_seed("u", "s1"),
            Err(RandomnessError::DuplicateRequest(_))
        ));
        assert!(service.generate_bytes(0, "u", "b2").is_err());
        assert!(service.generate_bytes(MAX_RANDOM_BYTES + 1, "u", "b3").is_err());
    }

    #[test]
    fn test_proofs_survive_key_rotation() {
        let fixture = Fixture::new();
        let keys = fixture.keys();
        let service = fixture.service_with(keys.clone());
        let before_key = service.public_key_hex().unwrap();

        let old_value = service.generate(0, 9, "u", "before").unwrap();
        let old_proof = service.prove(old_value, 0, 9, "u", "before").unwrap();
        assert_eq!(old_proof.key_generation, 0);

        keys.rotate(KeyPurpose::RandomnessSigning).unwrap();
        assert_ne!(service.public_key_hex().unwrap(), before_key);

        let new_value = service.generate(0, 9, "u", "after").unwrap();
        let new_proof = service.prove(new_value, 0, 9, "u", "after").unwrap();
        assert_eq!(new_proof.key_generation, 1);

        let restarted = fixture.service();
        assert!(restarted.verify_signature(&old_proof));
        assert!(restarted.verify_signature(&new_proof));

        // A generation label that does not match the signer fails.
        let mut relabelled = old_proof.clone();
        relabelled.key_generation = 1;
        assert!(!restarted.verify_signature(&relabelled));
        relabelled.key_generation = 7;
        assert!(!restarted.verify_signature(&relabelled));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_value_within_bounds(min in 0u64..1_000_000, span in 0u64..1_000_000) {
            let fixture = Fixture::new();
            let service = fixture.service();
            let max = min + span;
            let value = service.generate(min, max, "p", "prop").unwrap();
            prop_assert!(min <= value && value <= max);

            let proof = service.prove(value, min, max, "p", "prop").unwrap();
            prop_assert!(service.verify_signature(&proof));
        }
    }
}
