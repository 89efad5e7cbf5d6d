//! Per-user secret management.
//!
//! Each user's secrets live in one sealed record (namespace `secrets`, key =
//! user id). Values are only ever handed to the script engine; the boundary
//! exposes names, never values.

use crate::error::{SecretError, SecretResult};
use crate::storage::{SecureStorage, SECRETS_NAMESPACE};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};
use zeroize::Zeroizing;

/// Decrypted secrets of one user. Values are wiped when the set is dropped.
#[derive(Default, Clone)]
pub struct SecretSet {
    values: BTreeMap<String, Zeroizing<String>>,
}

impl SecretSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), Zeroizing::new(value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|value| value.as_str())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON object view bound as the script's `SECRETS` global.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(name, value)| (name.clone(), Value::String(value.as_str().to_owned())))
                .collect::<Map<String, Value>>(),
        )
    }

    /// Redactor for every non-empty value in the set.
    pub fn redactor(&self) -> Redactor {
        let mut patterns: Vec<Zeroizing<String>> = Vec::new();
        for value in self.values.values().filter(|v| !v.is_empty()) {
            patterns.push(value.clone());
            // The form a value takes inside `JSON.stringify` output.
            if let Ok(quoted) = serde_json::to_string(value.as_str()) {
                let escaped = &quoted[1..quoted.len() - 1];
                if escaped != value.as_str() {
                    patterns.push(Zeroizing::new(escaped.to_string()));
                }
            }
        }
        patterns.sort_by(|a, b| b.len().cmp(&a.len()));
        patterns.dedup();
        Redactor { patterns }
    }

    fn encode(&self) -> SecretResult<Zeroizing<Vec<u8>>> {
        let plain: BTreeMap<&str, &str> = self
            .values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        serde_json::to_vec(&plain)
            .map(Zeroizing::new)
            .map_err(|e| SecretError::InvalidRequest(format!("cannot encode secrets: {}", e)))
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        let plain: BTreeMap<String, String> = serde_json::from_slice(bytes).ok()?;
        let mut set = Self::new();
        for (name, value) in plain {
            set.insert(name, value);
        }
        Some(set)
    }
}

impl std::fmt::Debug for SecretSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretSet")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Placeholder written where a secret value was removed.
pub const REDACTED: &str = "[redacted]";

/// Scrubs secret values out of script output before it leaves the enclave.
pub struct Redactor {
    patterns: Vec<Zeroizing<String>>,
}

impl Redactor {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Replace every occurrence of a secret value in `text`. Returns `None`
    /// when nothing matched.
    pub fn redact_str(&self, text: &str) -> Option<String> {
        let mut out: Option<String> = None;
        for pattern in &self.patterns {
            let current = out.as_deref().unwrap_or(text);
            if current.contains(pattern.as_str()) {
                out = Some(current.replace(pattern.as_str(), REDACTED));
            }
        }
        out
    }

    /// Redact string values, object keys and numbers that spell a secret.
    /// Returns the number of replaced items.
    pub fn redact_json(&self, value: &mut Value) -> usize {
        if self.is_empty() {
            return 0;
        }
        match value {
            Value::String(text) => match self.redact_str(text) {
                Some(clean) => {
                    *text = clean;
                    1
                }
                None => 0,
            },
            Value::Number(number) => {
                let spelled = number.to_string();
                if self.patterns.iter().any(|p| p.as_str() == spelled) {
                    *value = Value::String(REDACTED.to_string());
                    1
                } else {
                    0
                }
            }
            Value::Array(items) => items.iter_mut().map(|item| self.redact_json(item)).sum(),
            Value::Object(map) => {
                let mut count = 0;
                let entries = std::mem::take(map);
                for (key, mut item) in entries {
                    count += self.redact_json(&mut item);
                    let key = match self.redact_str(&key) {
                        Some(clean) => {
                            count += 1;
                            clean
                        }
                        None => key,
                    };
                    map.insert(key, item);
                }
                count
            }
            Value::Null | Value::Bool(_) => 0,
        }
    }
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

/// Reads and writes per-user secret records.
#[derive(Debug)]
pub struct SecretManager {
    storage: Arc<SecureStorage>,
    lock: Mutex<()>,
}

impl SecretManager {
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    fn check_user(user_id: &str) -> SecretResult<()> {
        if user_id.is_empty() {
            return Err(SecretError::InvalidRequest("user id must not be empty".into()));
        }
        Ok(())
    }

    fn load(&self, user_id: &str) -> SecretResult<SecretSet> {
        let Some(bytes) = self.storage.retrieve(SECRETS_NAMESPACE, user_id)? else {
            return Ok(SecretSet::new());
        };
        let bytes = Zeroizing::new(bytes);
        SecretSet::decode(&bytes).ok_or_else(|| {
            error!(namespace = SECRETS_NAMESPACE, "secret record does not decode");
            SecretError::UnreadableRecord {
                user_id: user_id.to_string(),
            }
        })
    }

    fn save(&self, user_id: &str, set: &SecretSet) -> SecretResult<()> {
        if set.is_empty() {
            self.storage.remove(SECRETS_NAMESPACE, user_id)?;
            return Ok(());
        }
        let bytes = set.encode()?;
        self.storage.store(SECRETS_NAMESPACE, user_id, &bytes)?;
        Ok(())
    }

    /// All secrets of `user_id`; empty when the user has none.
    pub fn get_secrets(&self, user_id: &str) -> SecretResult<SecretSet> {
        Self::check_user(user_id)?;
        let _guard = self.lock.lock();
        self.load(user_id)
    }

    pub fn get_secret(&self, user_id: &str, name: &str) -> SecretResult<Option<Zeroizing<String>>> {
        Ok(self
            .get_secrets(user_id)?
            .get(name)
            .map(|value| Zeroizing::new(value.to_string())))
    }

    /// Insert or replace one secret.
    pub fn store_secret(&self, user_id: &str, name: &str, value: &str) -> SecretResult<()> {
        Self::check_user(user_id)?;
        if name.is_empty() {
            return Err(SecretError::InvalidRequest("secret name must not be empty".into()));
        }
        let _guard = self.lock.lock();
        let mut set = self.load(user_id)?;
        set.insert(name, value);
        self.save(user_id, &set)?;
        debug!(secret = name, "stored secret");
        Ok(())
    }

    /// Delete one secret, returning whether it existed.
    pub fn delete_secret(&self, user_id: &str, name: &str) -> SecretResult<bool> {
        Self::check_user(user_id)?;
        let _guard = self.lock.lock();
        let mut set = self.load(user_id)?;
        if !set.remove(name) {
            return Ok(false);
        }
        self.save(user_id, &set)?;
        Ok(true)
    }

    pub fn list_secret_names(&self, user_id: &str) -> SecretResult<Vec<String>> {
        Ok(self.get_secrets(user_id)?.names())
    }
}
