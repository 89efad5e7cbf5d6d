//! Event trigger manager.
//!
//! Owns the in-memory trigger index, persists every mutation to the
//! `triggers` namespace before applying it, matches incoming events and runs
//! the matching scripts through the execution engine.
//!
//! ```text
//! register ──► validate ──► Matcher::parse ──► store_json ──► index.insert
//!
//! event ──► index.ids_of_kind ──► enabled && matcher.matches
//!                                        │
//!                  input + event + trigger + timestamp, owner secrets
//!                                        ▼
//!                               ScriptEngine::execute
//! ```

mod condition;
mod index;
mod types;

pub use condition::{BlockchainEvent, BlockchainMatcher, Matcher, StorageMatcher};
pub use types::{Trigger, TriggerDefinition, TriggerKind, TriggerSummary};

use crate::error::{TriggerError, TriggerResult};
use crate::execution::{ExecutionContext, ScriptEngine};
use crate::metrics::EnclaveMetrics;
use crate::secrets::SecretManager;
use crate::storage::{SecureStorage, TRIGGERS_NAMESPACE};
use index::TriggerIndex;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

const KEY_PREFIX: &str = "trigger:";

fn storage_key(id: &str) -> String {
    format!("{KEY_PREFIX}{id}")
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Registers triggers and dispatches events to them.
pub struct TriggerManager {
    storage: Arc<SecureStorage>,
    engine: Arc<ScriptEngine>,
    secrets: Arc<SecretManager>,
    index: Mutex<TriggerIndex>,
    metrics: Option<Arc<EnclaveMetrics>>,
}

impl TriggerManager {
    /// Create a manager whose index is rebuilt from storage.
    ///
    /// Records that no longer decode or whose condition no longer parses are
    /// logged and left out of the index.
    pub fn new(
        storage: Arc<SecureStorage>,
        engine: Arc<ScriptEngine>,
        secrets: Arc<SecretManager>,
    ) -> TriggerResult<Self> {
        let manager = Self {
            storage,
            engine,
            secrets,
            index: Mutex::new(TriggerIndex::default()),
            metrics: None,
        };
        manager.load()?;
        Ok(manager)
    }

    /// Count processed triggers per kind.
    pub fn with_metrics(mut self, metrics: Arc<EnclaveMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(&self, kind: TriggerKind, processed: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_triggers(kind, processed);
        }
    }

    fn load(&self) -> TriggerResult<()> {
        let mut index = TriggerIndex::default();
        for key in self.storage.list_keys(TRIGGERS_NAMESPACE)? {
            if !key.starts_with(KEY_PREFIX) {
                continue;
            }
            let trigger: Trigger = match self.storage.retrieve_json(TRIGGERS_NAMESPACE, &key) {
                Ok(Some(trigger)) => trigger,
                Ok(None) => continue,
                Err(err) if err.is_retryable() => return Err(err.into()),
                Err(err) => {
                    error!(key = %key, error = %err, "skipping unreadable trigger record");
                    continue;
                }
            };
            match Matcher::parse(trigger.kind, &trigger.condition) {
                Ok(matcher) => index.insert(trigger, matcher),
                Err(reason) => {
                    error!(trigger_id = %trigger.id, %reason, "skipping trigger with invalid condition");
                }
            }
        }
        info!(count = index.len(), "trigger index loaded");
        *self.index.lock() = index;
        Ok(())
    }

    fn validate(trigger: &Trigger) -> TriggerResult<Matcher> {
        let required = [
            ("id", &trigger.id),
            ("function id", &trigger.function_id),
            ("owner user id", &trigger.owner_user_id),
            ("code", &trigger.code),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(TriggerError::InvalidTrigger(format!("{name} is required")));
            }
        }
        if !matches!(trigger.input, Value::Object(_) | Value::Null) {
            return Err(TriggerError::InvalidTrigger("input must be an object or null".into()));
        }
        if trigger.gas_limit == 0 {
            return Err(TriggerError::InvalidTrigger("gas limit must be positive".into()));
        }
        if trigger.kind == TriggerKind::Schedule && trigger.interval_seconds == 0 {
            return Err(TriggerError::InvalidTrigger(
                "schedule trigger needs a positive interval".into(),
            ));
        }
        Matcher::parse(trigger.kind, &trigger.condition).map_err(|reason| {
            TriggerError::InvalidCondition {
                id: trigger.id.clone(),
                reason,
            }
        })
    }

    fn persist(&self, trigger: &Trigger) -> TriggerResult<()> {
        Ok(self
            .storage
            .store_json(TRIGGERS_NAMESPACE, &storage_key(&trigger.id), trigger)?)
    }

    /// Register a new trigger. Nothing is indexed unless the record was
    /// persisted.
    pub fn register(&self, mut trigger: Trigger) -> TriggerResult<String> {
        let matcher = Self::validate(&trigger)?;
        if trigger.kind != TriggerKind::Schedule {
            trigger.next_execution_time = 0;
            trigger.interval_seconds = 0;
        }

        let mut index = self.index.lock();
        if index.contains(&trigger.id) {
            return Err(TriggerError::DuplicateId(trigger.id));
        }
        self.persist(&trigger)?;
        let id = trigger.id.clone();
        info!(trigger_id = %id, kind = %trigger.kind, "trigger registered");
        index.insert(trigger, matcher);
        Ok(id)
    }

    /// Remove a trigger from storage and then from the index.
    pub fn unregister(&self, id: &str) -> TriggerResult<()> {
        let mut index = self.index.lock();
        if !index.contains(id) {
            return Err(TriggerError::NotFound(id.to_string()));
        }
        self.storage.remove(TRIGGERS_NAMESPACE, &storage_key(id))?;
        index.remove(id);
        info!(trigger_id = id, "trigger unregistered");
        Ok(())
    }

    pub fn enable(&self, id: &str) -> TriggerResult<()> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> TriggerResult<()> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> TriggerResult<()> {
        let mut index = self.index.lock();
        let entry = index
            .get(id)
            .ok_or_else(|| TriggerError::NotFound(id.to_string()))?;
        if entry.trigger.enabled == enabled {
            return Ok(());
        }
        let mut trigger = entry.trigger.clone();
        trigger.enabled = enabled;
        self.persist(&trigger)?;
        index.update(trigger);
        debug!(trigger_id = id, enabled, "trigger state changed");
        Ok(())
    }

    pub fn get_trigger(&self, id: &str) -> TriggerResult<TriggerSummary> {
        self.index
            .lock()
            .get(id)
            .map(|entry| TriggerSummary::from(&entry.trigger))
            .ok_or_else(|| TriggerError::NotFound(id.to_string()))
    }

    /// Summaries of every trigger, in id order.
    pub fn list_triggers(&self) -> Vec<TriggerSummary> {
        self.index
            .lock()
            .iter()
            .map(|entry| TriggerSummary::from(&entry.trigger))
            .collect()
    }

    /// Run every due schedule trigger and move its next run to
    /// `current_time + interval_seconds`, whether or not the script succeeded.
    pub fn process_scheduled(&self, current_time: u64) -> usize {
        let mut index = self.index.lock();
        let mut processed = 0;
        for id in index.ids_of_kind(TriggerKind::Schedule) {
            let Some(entry) = index.get(&id) else { continue };
            let trigger = &entry.trigger;
            if !trigger.enabled || trigger.next_execution_time > current_time {
                continue;
            }
            if self.execute(trigger, Value::Object(Map::new()), current_time) {
                processed += 1;
            }

            let mut advanced = trigger.clone();
            advanced.next_execution_time = current_time.saturating_add(trigger.interval_seconds);
            match self.persist(&advanced) {
                Ok(()) => {
                    index.update(advanced);
                }
                Err(err) => {
                    error!(trigger_id = %id, error = %err, "failed to persist schedule advance");
                }
            }
        }
        debug!(processed, current_time, "scheduled triggers processed");
        self.record(TriggerKind::Schedule, processed);
        processed
    }

    /// Run every enabled blockchain trigger whose matcher accepts the event.
    pub fn process_blockchain_event(&self, event_json: &str) -> TriggerResult<usize> {
        let event = BlockchainEvent::parse(event_json).map_err(|err| {
            warn!(error = %err, "rejecting blockchain event");
            err
        })?;

        let index = self.index.lock();
        let now = now_secs();
        let mut processed = 0;
        for id in index.ids_of_kind(TriggerKind::Blockchain) {
            let Some(entry) = index.get(&id) else { continue };
            let Matcher::Blockchain(matcher) = &entry.matcher else { continue };
            if entry.trigger.enabled
                && matcher.matches(&event)
                && self.execute(&entry.trigger, event.raw.clone(), now)
            {
                processed += 1;
            }
        }
        debug!(processed, "blockchain event processed");
        self.record(TriggerKind::Blockchain, processed);
        Ok(processed)
    }

    /// Run every enabled storage trigger whose filter accepts the mutation.
    pub fn process_storage_event(&self, key: &str, operation: &str) -> usize {
        let index = self.index.lock();
        let now = now_secs();
        let event = json!({ "key": key, "operation": operation });
        let mut processed = 0;
        for id in index.ids_of_kind(TriggerKind::Storage) {
            let Some(entry) = index.get(&id) else { continue };
            let Matcher::Storage(matcher) = &entry.matcher else { continue };
            if entry.trigger.enabled
                && matcher.matches(key, operation)
                && self.execute(&entry.trigger, event.clone(), now)
            {
                processed += 1;
            }
        }
        debug!(processed, operation, "storage event processed");
        self.record(TriggerKind::Storage, processed);
        processed
    }

    /// Run every enabled external trigger whose condition equals `event_type`.
    /// An empty payload is treated as null.
    pub fn process_external_event(&self, event_type: &str, payload: &str) -> TriggerResult<usize> {
        let payload: Value = if payload.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(payload).map_err(|e| {
                warn!(event_type, error = %e, "rejecting external event");
                TriggerError::MalformedEvent(e.to_string())
            })?
        };

        let index = self.index.lock();
        let now = now_secs();
        let mut processed = 0;
        for id in index.ids_of_kind(TriggerKind::External) {
            let Some(entry) = index.get(&id) else { continue };
            let Matcher::External(expected) = &entry.matcher else { continue };
            if entry.trigger.enabled
                && expected == event_type
                && self.execute(&entry.trigger, payload.clone(), now)
            {
                processed += 1;
            }
        }
        debug!(processed, event_type, "external event processed");
        self.record(TriggerKind::External, processed);
        Ok(processed)
    }

    /// Build the merged input and run the trigger's script. Failures are
    /// logged with the trigger id and reported as `false`.
    fn execute(&self, trigger: &Trigger, event: Value, timestamp: u64) -> bool {
        let mut input = match &trigger.input {
            Value::Object(base) => base.clone(),
            _ => Map::new(),
        };
        input.insert("event".to_string(), event);
        input.insert(
            "trigger".to_string(),
            json!({
                "id": trigger.id,
                "kind": trigger.kind,
                "condition": trigger.condition,
            }),
        );
        input.insert("timestamp".to_string(), json!(timestamp));

        let secrets = match self.secrets.get_secrets(&trigger.owner_user_id) {
            Ok(secrets) => secrets,
            Err(err) => {
                error!(trigger_id = %trigger.id, error = %err, "cannot load owner secrets");
                return false;
            }
        };

        let mut context = ExecutionContext::new(
            trigger.function_id.clone(),
            trigger.owner_user_id.clone(),
            trigger.code.clone(),
            Value::Object(input),
            trigger.gas_limit,
        )
        .with_secrets(secrets);

        match self.engine.execute(&mut context) {
            Ok(output) => {
                debug!(trigger_id = %trigger.id, gas_used = output.gas_used, "trigger executed");
                true
            }
            Err(err) => {
                warn!(
                    trigger_id = %trigger.id,
                    gas_used = context.gas_used,
                    code = err.code(),
                    error = %err,
                    "trigger execution failed"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for TriggerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerManager")
            .field("triggers", &self.index.lock().len())
            .finish_non_exhaustive()
    }
}
