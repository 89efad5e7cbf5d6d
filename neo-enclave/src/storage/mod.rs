//! Secure storage manager.
//!
//! Namespaced key/value store whose values are sealed with a key derived from
//! the enclave identity before they reach the backend. The AAD of every
//! envelope binds the namespace, the key and the sealing counter, so the
//! untrusted medium cannot swap values between slots or relabel an old
//! envelope without detection.
//!
//! Each retrieved or stored counter becomes the high-water mark of its slot.
//! An envelope older than the mark (a rollback or replay of a previously
//! valid value) is reported as corrupt. Marks live for the lifetime of the
//! process; across restarts only the counter floor of
//! [`EnclaveIdentity`] applies.

mod backend;
mod transaction;

pub use backend::{BatchOp, FileBackend, MemoryBackend, StorageBackend, JOURNAL_FILE_NAME};
pub use transaction::StorageTransaction;

#[cfg(test)]
pub(crate) use backend::UnavailableBackend;

use crate::config::{EnclaveConfig, StorageBackendKind};
use crate::enclave::{seal_data, unseal_data, EnclaveIdentity, KeyPurpose, SealedData, SecureKey};
use crate::error::{SealingError, StorageError, StorageResult};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Namespace holding trigger definitions.
pub const TRIGGERS_NAMESPACE: &str = "triggers";
/// Namespace holding per-user secret records.
pub const SECRETS_NAMESPACE: &str = "secrets";
/// Namespace holding compliance rules and results.
pub const COMPLIANCE_NAMESPACE: &str = "compliance";
/// Namespace holding issued randomness proofs.
pub const RANDOMNESS_NAMESPACE: &str = "randomness";
/// Namespace holding gas balances and per-function usage.
pub const GAS_NAMESPACE: &str = "gas";
/// Namespace holding signing key generations.
pub const KEYS_NAMESPACE: &str = "keys";

type Slot = (String, String);

/// Sealed, namespaced key/value store.
pub struct SecureStorage {
    backend: Arc<dyn StorageBackend>,
    sealing_key: SecureKey,
    identity: Arc<EnclaveIdentity>,
    namespace_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    high_water: Mutex<HashMap<Slot, u64>>,
}

impl SecureStorage {
    /// Create a storage manager over `backend`.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        identity: Arc<EnclaveIdentity>,
    ) -> Result<Self, SealingError> {
        let sealing_key = identity.derive_key(KeyPurpose::StorageSealing)?;
        Ok(Self {
            backend,
            sealing_key,
            identity,
            namespace_locks: Mutex::new(HashMap::new()),
            high_water: Mutex::new(HashMap::new()),
        })
    }

    /// Build the backend named by `config`.
    pub fn open_backend(config: &EnclaveConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        Ok(match config.storage_backend {
            StorageBackendKind::Memory => Arc::new(MemoryBackend::new()),
            StorageBackendKind::File => Arc::new(FileBackend::open(config.data_dir.join("sealed"))?),
        })
    }

    fn namespace_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.namespace_locks
            .lock()
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn validate(namespace: &str, key: &str) -> StorageResult<()> {
        if namespace.is_empty() {
            return Err(StorageError::invalid_key("namespace must not be empty"));
        }
        if key.is_empty() {
            return Err(StorageError::invalid_key("key must not be empty"));
        }
        Ok(())
    }

    fn aad(namespace: &str, key: &str, counter: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(namespace.len() + key.len() + 10);
        aad.extend_from_slice(namespace.as_bytes());
        aad.push(0);
        aad.extend_from_slice(key.as_bytes());
        aad.push(0);
        aad.extend_from_slice(&counter.to_be_bytes());
        aad
    }

    /// Seal `value` for a slot under a fresh counter.
    fn seal(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<(Vec<u8>, u64)> {
        let counter = self.identity.next_counter();
        let sealed = seal_data(
            value,
            &self.sealing_key,
            &Self::aad(namespace, key, counter),
            counter,
        )
        .and_then(|sealed| sealed.to_bytes())
        .map_err(|e| StorageError::unavailable(format!("sealing failed: {}", e)))?;
        Ok((sealed, counter))
    }

    fn mark(&self, namespace: &str, key: &str, counter: u64) {
        let mut marks = self.high_water.lock();
        let mark = marks
            .entry((namespace.to_string(), key.to_string()))
            .or_insert(0);
        *mark = (*mark).max(counter);
    }

    fn high_water_mark(&self, namespace: &str, key: &str) -> Option<u64> {
        self.high_water
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .copied()
    }

    /// Seal and persist `value`.
    pub fn store(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        Self::validate(namespace, key)?;
        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock();

        let (sealed, counter) = self.seal(namespace, key, value)?;
        self.backend.put(namespace, key, &sealed)?;
        self.mark(namespace, key, counter);
        debug!(namespace, bytes = value.len(), "stored sealed value");
        Ok(())
    }

    /// Fetch and unseal a value. Integrity failures, including envelopes
    /// older than the slot's high-water mark, are reported as
    /// [`StorageError::Corrupt`] and logged without content.
    pub fn retrieve(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Self::validate(namespace, key)?;
        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock();

        let Some(raw) = self.backend.get(namespace, key)? else {
            return Ok(None);
        };

        let min_counter = self.high_water_mark(namespace, key);
        let (plaintext, counter) = SealedData::from_bytes(&raw)
            .and_then(|sealed| {
                let expected_aad = Self::aad(namespace, key, sealed.counter);
                unseal_data(&sealed, &self.sealing_key, &expected_aad, min_counter)
                    .map(|plaintext| (plaintext, sealed.counter))
            })
            .map_err(|e| {
                error!(namespace, key, error = %e, "sealed value failed integrity check");
                StorageError::corrupt(namespace, key, e.to_string())
            })?;

        self.mark(namespace, key, counter);
        self.identity.observe_counter(counter);
        Ok(Some(plaintext))
    }

    /// Delete a value, returning whether it existed. The slot's mark moves
    /// to a fresh counter, so a replayed copy of the deleted value is rejected.
    pub fn remove(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Self::validate(namespace, key)?;
        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock();
        let existed = self.backend.delete(namespace, key)?;
        self.mark(namespace, key, self.identity.next_counter());
        Ok(existed)
    }

    /// Whether a value exists. Does not unseal it.
    pub fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Self::validate(namespace, key)?;
        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock();
        Ok(self.backend.get(namespace, key)?.is_some())
    }

    /// Keys of a namespace in sorted order.
    pub fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        if namespace.is_empty() {
            return Err(StorageError::invalid_key("namespace must not be empty"));
        }
        let lock = self.namespace_lock(namespace);
        let _guard = lock.lock();
        self.backend.keys(namespace)
    }

    /// Serialize `value` as JSON and store it.
    pub fn store_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> StorageResult<()> {
        let bytes = to_json(value)?;
        self.store(namespace, key, &bytes)
    }

    /// Retrieve and decode a JSON value. An authentic value that no longer
    /// decodes is reported as corrupt.
    pub fn retrieve_json<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Option<T>> {
        match self.retrieve(namespace, key)? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                error!(namespace, key, error = %e, "sealed value has unexpected shape");
                StorageError::corrupt(namespace, key, "record does not decode")
            }),
            None => Ok(None),
        }
    }

    /// Start an atomic multi-key write. Nothing reaches the backend until
    /// [`StorageTransaction::commit`].
    pub fn transaction(&self) -> StorageTransaction<'_> {
        StorageTransaction::new(self)
    }
}

fn to_json<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| StorageError::invalid_key(format!("value is not serializable: {}", e)))
}

impl std::fmt::Debug for SecureStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStorage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    fn memory_storage() -> (Arc<MemoryBackend>, SecureStorage) {
        let backend = Arc::new(MemoryBackend::new());
        let storage =
            SecureStorage::new(backend.clone(), Arc::new(EnclaveIdentity::ephemeral())).unwrap();
        (backend, storage)
    }

    #[test]
    fn test_store_retrieve_remove() {
        let (_, storage) = memory_storage();

        storage.store("ns", "key", b"value").unwrap();
        assert_eq!(storage.retrieve("ns", "key").unwrap(), Some(b"value".to_vec()));
        assert!(storage.exists("ns", "key").unwrap());
        assert_eq!(storage.list_keys("ns").unwrap(), vec!["key"]);

        assert!(storage.remove("ns", "key").unwrap());
        assert!(!storage.remove("ns", "key").unwrap());
        assert_eq!(storage.retrieve("ns", "key").unwrap(), None);
    }

    #[test]
    fn test_backend_never_sees_plaintext() {
        let (backend, storage) = memory_storage();
        storage.store("secrets", "alice", b"api-key-123").unwrap();

        let raw = backend.get("secrets", "alice").unwrap().unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("api-key-123"));
    }

    #[test]
    fn test_tampered_value_is_corrupt() {
        let (backend, storage) = memory_storage();
        storage.store("ns", "key", b"value").unwrap();

        let raw = backend.get("ns", "key").unwrap().unwrap();
        let mut sealed = SealedData::from_bytes(&raw).unwrap();
        sealed.ciphertext[0] ^= 0x01;
        backend.put("ns", "key", &sealed.to_bytes().unwrap()).unwrap();

        let err = storage.retrieve("ns", "key").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_garbage_value_is_corrupt() {
        let (backend, storage) = memory_storage();
        backend.put("ns", "key", b"not an envelope").unwrap();
        assert!(matches!(
            storage.retrieve("ns", "key"),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_swapped_values_are_corrupt() {
        let (backend, storage) = memory_storage();
        storage.store("ns", "a", b"first").unwrap();
        storage.store("ns", "b", b"second").unwrap();

        let raw_a = backend.get("ns", "a").unwrap().unwrap();
        backend.put("ns", "b", &raw_a).unwrap();

        assert!(matches!(
            storage.retrieve("ns", "b"),
            Err(StorageError::Corrupt { .. })
        ));
        assert_eq!(storage.retrieve("ns", "a").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn test_different_identity_cannot_read() {
        let backend = Arc::new(MemoryBackend::new());
        let writer =
            SecureStorage::new(backend.clone(), Arc::new(EnclaveIdentity::ephemeral())).unwrap();
        let reader = SecureStorage::new(backend, Arc::new(EnclaveIdentity::ephemeral())).unwrap();

        writer.store("ns", "key", b"value").unwrap();
        assert!(matches!(
            reader.retrieve("ns", "key"),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_empty_names_rejected() {
        let (_, storage) = memory_storage();
        assert!(matches!(
            storage.store("", "key", b"v"),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(matches!(
            storage.retrieve("ns", ""),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(storage.list_keys("").is_err());
    }

    #[test]
    fn test_unavailable_backend_is_retryable() {
        let storage = SecureStorage::new(
            Arc::new(UnavailableBackend),
            Arc::new(EnclaveIdentity::ephemeral()),
        )
        .unwrap();

        let err = storage.store("ns", "key", b"v").unwrap_err();
        assert!(err.is_retryable());
        assert!(storage.retrieve("ns", "key").unwrap_err().is_retryable());
    }

    #[test]
    fn test_file_storage_survives_reopen() {
        let temp = tempdir().unwrap();
        let identity = Arc::new(EnclaveIdentity::load_or_create(temp.path()).unwrap());

        {
            let backend = Arc::new(FileBackend::open(temp.path().join("sealed")).unwrap());
            let storage = SecureStorage::new(backend, identity.clone()).unwrap();
            storage.store("triggers", "trigger:1", b"{}").unwrap();
        }

        let reopened_identity = Arc::new(EnclaveIdentity::load_or_create(temp.path()).unwrap());
        let backend = Arc::new(FileBackend::open(temp.path().join("sealed")).unwrap());
        let storage = SecureStorage::new(backend, reopened_identity).unwrap();
        assert_eq!(storage.retrieve("triggers", "trigger:1").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn test_rolled_back_value_is_corrupt() {
        let (backend, storage) = memory_storage();
        storage.store("gas", "user:alice", b"balance=100").unwrap();
        let old = backend.get("gas", "user:alice").unwrap().unwrap();

        storage.store("gas", "user:alice", b"balance=5").unwrap();
        backend.put("gas", "user:alice", &old).unwrap();

        let err = storage.retrieve("gas", "user:alice").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
        assert!(err.to_string().contains("replay"));
    }

    #[test]
    fn test_replayed_value_after_delete_is_corrupt() {
        let (backend, storage) = memory_storage();
        storage.store("secrets", "alice", b"old").unwrap();
        let old = backend.get("secrets", "alice").unwrap().unwrap();
        assert!(storage.remove("secrets", "alice").unwrap());
        storage.store("secrets", "bob", b"unrelated").unwrap();

        backend.put("secrets", "alice", &old).unwrap();
        assert!(matches!(
            storage.retrieve("secrets", "alice"),
            Err(StorageError::Corrupt { .. })
        ));

        storage.store("secrets", "alice", b"new").unwrap();
        assert_eq!(storage.retrieve("secrets", "alice").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_relabelled_counter_is_corrupt() {
        let (backend, storage) = memory_storage();
        storage.store("ns", "key", b"first").unwrap();
        let old = backend.get("ns", "key").unwrap().unwrap();
        storage.store("ns", "key", b"second").unwrap();

        // Lifting the counter of an old envelope past the mark breaks the tag.
        let mut sealed = SealedData::from_bytes(&old).unwrap();
        sealed.counter = u64::MAX;
        backend.put("ns", "key", &sealed.to_bytes().unwrap()).unwrap();
        assert!(matches!(
            storage.retrieve("ns", "key"),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_counters_seen_on_reopen_are_exceeded() {
        let backend = Arc::new(MemoryBackend::new());
        let identity = Arc::new(EnclaveIdentity::from_root_secret([3u8; 32]));
        let storage = SecureStorage::new(backend.clone(), identity).unwrap();
        storage.store("ns", "key", b"v1").unwrap();

        let raw = backend.get("ns", "key").unwrap().unwrap();
        let written = SealedData::from_bytes(&raw).unwrap().counter;
        let reopened_identity = Arc::new(EnclaveIdentity::from_root_secret([3u8; 32]));
        let reopened = SecureStorage::new(backend.clone(), reopened_identity.clone()).unwrap();
        assert_eq!(reopened.retrieve("ns", "key").unwrap(), Some(b"v1".to_vec()));
        assert!(reopened_identity.next_counter() > written);
    }

    #[test]
    fn test_json_helpers() {
        let (_, storage) = memory_storage();
        storage.store_json("ns", "k", &vec![1u32, 2, 3]).unwrap();
        let value: Option<Vec<u32>> = storage.retrieve_json("ns", "k").unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));

        storage.store("ns", "text", b"not json").unwrap();
        let err = storage.retrieve_json::<Vec<u32>>("ns", "text").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn test_concurrent_writers_to_one_namespace() {
        let (_, storage) = memory_storage();
        let storage = Arc::new(storage);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let storage = storage.clone();
                thread::spawn(move || {
                    for j in 0..10 {
                        storage
                            .store("shared", &format!("k{}-{}", i, j), b"v")
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.list_keys("shared").unwrap().len(), 80);
    }
}
