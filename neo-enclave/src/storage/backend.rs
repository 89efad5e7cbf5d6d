//! Raw byte backends underneath [`super::SecureStorage`].
//!
//! Backends only ever see sealed envelopes; they are the untrusted medium.

use crate::error::{StorageError, StorageResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        namespace: String,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        namespace: String,
        key: String,
    },
}

impl BatchOp {
    pub fn namespace(&self) -> &str {
        match self {
            Self::Put { namespace, .. } | Self::Delete { namespace, .. } => namespace,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }
}

/// Byte-oriented namespaced store.
pub trait StorageBackend: Send + Sync {
    /// Insert or overwrite a value.
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Fetch a value, `None` when absent.
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Delete a value, returning whether it existed.
    fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// All keys in a namespace, sorted.
    fn keys(&self, namespace: &str) -> StorageResult<Vec<String>>;

    /// Apply every operation or none of them. Readers never observe a
    /// partially applied batch once this returns.
    fn apply_batch(&self, ops: &[BatchOp]) -> StorageResult<()>;
}

/// Volatile in-process backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        self.namespaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Ok(self
            .namespaces
            .write()
            .get_mut(namespace)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false))
    }

    fn keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .namespaces
            .read()
            .get(namespace)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn apply_batch(&self, ops: &[BatchOp]) -> StorageResult<()> {
        let mut namespaces = self.namespaces.write();
        for op in ops {
            match op {
                BatchOp::Put {
                    namespace,
                    key,
                    value,
                } => {
                    namespaces
                        .entry(namespace.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                BatchOp::Delete { namespace, key } => {
                    if let Some(entries) = namespaces.get_mut(namespace) {
                        entries.remove(key);
                    }
                }
            }
        }
        Ok(())
    }
}

const SEALED_EXTENSION: &str = "sealed";

/// Committed batch waiting to be applied. Its presence on disk is the commit
/// point of a batch.
pub const JOURNAL_FILE_NAME: &str = "batch.journal";
const JOURNAL_TMP_NAME: &str = "batch.journal.tmp";

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    namespace: String,
    key: String,
    /// Base64 sealed bytes; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl JournalEntry {
    fn from_op(op: &BatchOp) -> Self {
        match op {
            BatchOp::Put {
                namespace,
                key,
                value,
            } => Self {
                namespace: namespace.clone(),
                key: key.clone(),
                value: Some(BASE64.encode(value)),
            },
            BatchOp::Delete { namespace, key } => Self {
                namespace: namespace.clone(),
                key: key.clone(),
                value: None,
            },
        }
    }

    fn into_op(self) -> StorageResult<BatchOp> {
        Ok(match self.value {
            Some(encoded) => BatchOp::Put {
                value: BASE64.decode(encoded.as_bytes()).map_err(|e| {
                    StorageError::corrupt(&self.namespace, &self.key, format!("journal entry: {e}"))
                })?,
                namespace: self.namespace,
                key: self.key,
            },
            None => BatchOp::Delete {
                namespace: self.namespace,
                key: self.key,
            },
        })
    }
}

/// Directory-per-namespace backend.
///
/// Namespace and key names are hex-encoded so arbitrary strings never escape
/// the root directory. Batches go through a write-ahead journal in the root:
/// once the journal is renamed into place the batch is committed, and a
/// journal left behind by a crash is replayed by [`FileBackend::open`].
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    batch_lock: Mutex<()>,
}

impl FileBackend {
    /// Create the backend, creating `root` if needed and finishing any
    /// committed batch that was interrupted.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let backend = Self {
            root,
            batch_lock: Mutex::new(()),
        };
        backend.recover()?;
        Ok(backend)
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE_NAME)
    }

    fn recover(&self) -> StorageResult<()> {
        match fs::remove_file(self.root.join(JOURNAL_TMP_NAME)) {
            Ok(()) => warn!(root = %self.root.display(), "discarded uncommitted batch"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let bytes = match fs::read(self.journal_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let entries: Vec<JournalEntry> = serde_json::from_slice(&bytes).map_err(|e| {
            StorageError::corrupt("journal", JOURNAL_FILE_NAME, format!("unreadable: {e}"))
        })?;
        let ops = entries
            .into_iter()
            .map(JournalEntry::into_op)
            .collect::<StorageResult<Vec<_>>>()?;
        self.replay(&ops)?;
        info!(ops = ops.len(), "replayed committed batch");
        Ok(())
    }

    /// Apply journaled operations and drop the journal. Safe to repeat.
    fn replay(&self, ops: &[BatchOp]) -> StorageResult<()> {
        for op in ops {
            match op {
                BatchOp::Put {
                    namespace,
                    key,
                    value,
                } => self.put(namespace, key, value)?,
                BatchOp::Delete { namespace, key } => {
                    self.delete(namespace, key)?;
                }
            }
        }
        fs::remove_file(self.journal_path())?;
        Ok(())
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("ns-{}", hex::encode(namespace)))
    }

    /// Path of the sealed file for `key`.
    pub fn value_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.{}", hex::encode(key), SEALED_EXTENSION))
    }
}

impl StorageBackend for FileBackend {
    fn put(&self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;

        let path = self.value_path(namespace, key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.value_path(namespace, key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        match fs::remove_file(self.value_path(namespace, key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        let dir = self.namespace_dir(namespace);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SEALED_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match hex::decode(stem).map(String::from_utf8) {
                Ok(Ok(key)) => keys.push(key),
                _ => warn!(namespace, file = %path.display(), "skipping unrecognized storage file"),
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn apply_batch(&self, ops: &[BatchOp]) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let _guard = self.batch_lock.lock();

        let entries: Vec<JournalEntry> = ops.iter().map(JournalEntry::from_op).collect();
        let encoded = serde_json::to_vec(&entries)
            .map_err(|e| StorageError::unavailable(format!("journal encoding failed: {e}")))?;
        let tmp = self.root.join(JOURNAL_TMP_NAME);
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, self.journal_path())?;

        self.replay(ops)
    }
}

/// Backend that always fails, for exercising retry paths.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct UnavailableBackend;

#[cfg(test)]
impl StorageBackend for UnavailableBackend {
    fn put(&self, _: &str, _: &str, _: &[u8]) -> StorageResult<()> {
        Err(crate::error::StorageError::unavailable("medium offline"))
    }

    fn get(&self, _: &str, _: &str) -> StorageResult<Option<Vec<u8>>> {
        Err(crate::error::StorageError::unavailable("medium offline"))
    }

    fn delete(&self, _: &str, _: &str) -> StorageResult<bool> {
        Err(crate::error::StorageError::unavailable("medium offline"))
    }

    fn keys(&self, _: &str) -> StorageResult<Vec<String>> {
        Err(crate::error::StorageError::unavailable("medium offline"))
    }

    fn apply_batch(&self, _: &[BatchOp]) -> StorageResult<()> {
        Err(crate::error::StorageError::unavailable("medium offline"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(backend: &dyn StorageBackend) {
        assert_eq!(backend.get("ns", "a").unwrap(), None);
        backend.put("ns", "b", b"2").unwrap();
        backend.put("ns", "a", b"1").unwrap();
        backend.put("other", "a", b"x").unwrap();

        assert_eq!(backend.get("ns", "a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.keys("ns").unwrap(), vec!["a", "b"]);

        backend.put("ns", "a", b"3").unwrap();
        assert_eq!(backend.get("ns", "a").unwrap(), Some(b"3".to_vec()));

        assert!(backend.delete("ns", "a").unwrap());
        assert!(!backend.delete("ns", "a").unwrap());
        assert_eq!(backend.keys("ns").unwrap(), vec!["b"]);
        assert_eq!(backend.get("other", "a").unwrap(), Some(b"x".to_vec()));
        assert!(backend.keys("empty").unwrap().is_empty());
    }

    fn exercise_batch(backend: &dyn StorageBackend) {
        backend.put("ns", "old", b"gone soon").unwrap();
        backend
            .apply_batch(&[
                BatchOp::Put {
                    namespace: "ns".into(),
                    key: "a".into(),
                    value: b"1".to_vec(),
                },
                BatchOp::Put {
                    namespace: "other".into(),
                    key: "b".into(),
                    value: b"2".to_vec(),
                },
                BatchOp::Delete {
                    namespace: "ns".into(),
                    key: "old".into(),
                },
                BatchOp::Delete {
                    namespace: "missing".into(),
                    key: "x".into(),
                },
            ])
            .unwrap();

        assert_eq!(backend.keys("ns").unwrap(), vec!["a"]);
        assert_eq!(backend.get("other", "b").unwrap(), Some(b"2".to_vec()));
        backend.apply_batch(&[]).unwrap();
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
        exercise_batch(&MemoryBackend::new());
    }

    #[test]
    fn test_file_backend() {
        let temp = tempdir().unwrap();
        exercise(&FileBackend::open(temp.path()).unwrap());

        let temp = tempdir().unwrap();
        let backend = FileBackend::open(temp.path()).unwrap();
        exercise_batch(&backend);
        assert!(!temp.path().join(JOURNAL_FILE_NAME).exists());
    }

    #[test]
    fn test_file_backend_replays_committed_journal() {
        let temp = tempdir().unwrap();
        let ops = vec![
            BatchOp::Put {
                namespace: "gas".into(),
                key: "user:alice".into(),
                value: b"balance".to_vec(),
            },
            BatchOp::Put {
                namespace: "gas".into(),
                key: "function:f".into(),
                value: b"usage".to_vec(),
            },
        ];
        // A crash after the commit point leaves only the journal behind.
        let entries: Vec<JournalEntry> = ops.iter().map(JournalEntry::from_op).collect();
        std::fs::write(
            temp.path().join(JOURNAL_FILE_NAME),
            serde_json::to_vec(&entries).unwrap(),
        )
        .unwrap();

        let backend = FileBackend::open(temp.path()).unwrap();
        assert_eq!(backend.keys("gas").unwrap(), vec!["function:f", "user:alice"]);
        assert_eq!(backend.get("gas", "user:alice").unwrap(), Some(b"balance".to_vec()));
        assert!(!temp.path().join(JOURNAL_FILE_NAME).exists());
    }

    #[test]
    fn test_file_backend_discards_uncommitted_journal() {
        let temp = tempdir().unwrap();
        let entries = vec![JournalEntry::from_op(&BatchOp::Put {
            namespace: "gas".into(),
            key: "user:alice".into(),
            value: b"balance".to_vec(),
        })];
        std::fs::write(
            temp.path().join(JOURNAL_TMP_NAME),
            serde_json::to_vec(&entries).unwrap(),
        )
        .unwrap();

        let backend = FileBackend::open(temp.path()).unwrap();
        assert!(backend.keys("gas").unwrap().is_empty());
        assert!(!temp.path().join(JOURNAL_TMP_NAME).exists());
    }

    #[test]
    fn test_file_backend_rejects_garbled_journal() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join(JOURNAL_FILE_NAME), b"{not json").unwrap();
        assert!(matches!(
            FileBackend::open(temp.path()),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_file_backend_keys_cannot_escape_root() {
        let temp = tempdir().unwrap();
        let backend = FileBackend::open(temp.path()).unwrap();
        backend.put("../ns", "../../etc/passwd", b"v").unwrap();

        let path = backend.value_path("../ns", "../../etc/passwd");
        assert!(path.starts_with(temp.path()));
        assert_eq!(backend.keys("../ns").unwrap(), vec!["../../etc/passwd"]);
    }

    #[test]
    fn test_file_backend_ignores_foreign_files() {
        let temp = tempdir().unwrap();
        let backend = FileBackend::open(temp.path()).unwrap();
        backend.put("ns", "k", b"v").unwrap();
        let dir = backend.value_path("ns", "k").parent().unwrap().to_path_buf();
        std::fs::write(dir.join("notes.txt"), b"ignore me").unwrap();
        std::fs::write(dir.join("zz.sealed"), b"bad hex name").unwrap();

        assert_eq!(backend.keys("ns").unwrap(), vec!["k"]);
    }
}
