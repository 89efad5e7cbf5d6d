//! Atomic multi-key writes over [`SecureStorage`].

use super::{to_json, BatchOp, SecureStorage};
use crate::error::StorageResult;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;
use zeroize::Zeroizing;

enum Staged {
    Put {
        namespace: String,
        key: String,
        value: Zeroizing<Vec<u8>>,
    },
    Delete {
        namespace: String,
        key: String,
    },
}

impl Staged {
    fn namespace(&self) -> &str {
        match self {
            Self::Put { namespace, .. } | Self::Delete { namespace, .. } => namespace,
        }
    }
}

/// Writes staged in memory and applied to the backend as one batch.
///
/// Operations apply in staging order, so a later write to the same slot wins.
/// Dropping the transaction without committing discards everything staged.
pub struct StorageTransaction<'a> {
    storage: &'a SecureStorage,
    staged: Vec<Staged>,
}

impl<'a> StorageTransaction<'a> {
    pub(super) fn new(storage: &'a SecureStorage) -> Self {
        Self {
            storage,
            staged: Vec::new(),
        }
    }

    /// Stage a write of `value`.
    pub fn put(&mut self, namespace: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        SecureStorage::validate(namespace, key)?;
        self.staged.push(Staged::Put {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: Zeroizing::new(value.to_vec()),
        });
        Ok(())
    }

    /// Stage a write of `value` serialized as JSON.
    pub fn put_json<T: Serialize>(&mut self, namespace: &str, key: &str, value: &T) -> StorageResult<()> {
        let bytes = Zeroizing::new(to_json(value)?);
        self.put(namespace, key, &bytes)
    }

    /// Stage a delete.
    pub fn delete(&mut self, namespace: &str, key: &str) -> StorageResult<()> {
        SecureStorage::validate(namespace, key)?;
        self.staged.push(Staged::Delete {
            namespace: namespace.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Discard every staged operation.
    pub fn rollback(self) {
        debug!(ops = self.staged.len(), "storage transaction rolled back");
    }

    /// Seal every staged value and apply the batch.
    ///
    /// Namespace locks are taken in sorted order, so concurrent commits over
    /// overlapping namespaces cannot deadlock.
    pub fn commit(self) -> StorageResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let storage = self.storage;

        let namespaces: BTreeSet<&str> = self.staged.iter().map(Staged::namespace).collect();
        let locks: Vec<_> = namespaces
            .iter()
            .map(|namespace| storage.namespace_lock(namespace))
            .collect();
        let _guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();

        let mut ops = Vec::with_capacity(self.staged.len());
        let mut marks = Vec::with_capacity(self.staged.len());
        for staged in &self.staged {
            match staged {
                Staged::Put {
                    namespace,
                    key,
                    value,
                } => {
                    let (sealed, counter) = storage.seal(namespace, key, value)?;
                    marks.push((namespace.as_str(), key.as_str(), counter));
                    ops.push(BatchOp::Put {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        value: sealed,
                    });
                }
                Staged::Delete { namespace, key } => {
                    marks.push((namespace.as_str(), key.as_str(), storage.identity.next_counter()));
                    ops.push(BatchOp::Delete {
                        namespace: namespace.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        storage.backend.apply_batch(&ops)?;
        for (namespace, key, counter) in marks {
            storage.mark(namespace, key, counter);
        }
        debug!(ops = ops.len(), namespaces = namespaces.len(), "storage transaction committed");
        Ok(())
    }
}

impl std::fmt::Debug for StorageTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTransaction")
            .field("ops", &self.staged.len())
            .finish_non_exhaustive()
    }
}
