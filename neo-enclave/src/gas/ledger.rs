//! Durable gas balances and usage totals.
//!
//! Users hold a gas balance that every execution debits; functions
//! accumulate the gas their executions consumed. Both records of one
//! execution are written in a single storage transaction.
//!
//! ```text
//! start_accounting ──► (balance check when enforced) ──► AccountingSession
//!                                                             │
//!                             script runs under session.gas_limit(requested)
//!                                                             ▼
//! stop_accounting(session, gas_used) ──► debit user ┐
//!                                        add usage  ┴─► one transaction
//! ```

use crate::error::{GasLedgerError, GasLedgerResult};
use crate::storage::{SecureStorage, GAS_NAMESPACE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn account_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

fn usage_key(function_id: &str) -> String {
    format!("function:{function_id}")
}

/// Gas balance and lifetime consumption of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasAccount {
    pub user_id: String,
    pub balance: u64,
    pub total_used: u64,
    pub executions: u64,
    /// Unix seconds of the last change, 0 when never written.
    pub updated_at: u64,
}

impl GasAccount {
    fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            balance: 0,
            total_used: 0,
            executions: 0,
            updated_at: 0,
        }
    }
}

/// Gas consumed by all executions of one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionUsage {
    pub function_id: String,
    pub total_used: u64,
    pub executions: u64,
    pub updated_at: u64,
}

impl FunctionUsage {
    fn empty(function_id: &str) -> Self {
        Self {
            function_id: function_id.to_string(),
            total_used: 0,
            executions: 0,
            updated_at: 0,
        }
    }
}

/// One execution between [`GasLedger::start_accounting`] and
/// [`GasLedger::stop_accounting`].
#[derive(Debug)]
#[must_use = "usage is only recorded by GasLedger::stop_accounting"]
pub struct AccountingSession {
    function_id: String,
    user_id: String,
    started: Instant,
    /// Balance available to the execution when balances are enforced.
    available: Option<u64>,
}

impl AccountingSession {
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The gas limit to run under: `requested`, capped by the available
    /// balance when balances are enforced.
    pub fn gas_limit(&self, requested: u64) -> u64 {
        self.available.map_or(requested, |available| requested.min(available))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Storage-backed gas ledger.
pub struct GasLedger {
    storage: Arc<SecureStorage>,
    enforce_balance: bool,
    /// Serializes read-modify-write cycles on ledger records.
    write_lock: Mutex<()>,
}

impl GasLedger {
    /// With `enforce_balance`, executions need a positive balance and are
    /// capped at it.
    pub fn new(storage: Arc<SecureStorage>, enforce_balance: bool) -> Self {
        Self {
            storage,
            enforce_balance,
            write_lock: Mutex::new(()),
        }
    }

    pub fn enforces_balance(&self) -> bool {
        self.enforce_balance
    }

    fn require(name: &str, value: &str) -> GasLedgerResult<()> {
        if value.trim().is_empty() {
            return Err(GasLedgerError::InvalidRequest(format!("{name} is required")));
        }
        Ok(())
    }

    /// The user's account; an unknown user has an empty account.
    pub fn get_account(&self, user_id: &str) -> GasLedgerResult<GasAccount> {
        Self::require("user id", user_id)?;
        Ok(self
            .storage
            .retrieve_json(GAS_NAMESPACE, &account_key(user_id))?
            .unwrap_or_else(|| GasAccount::empty(user_id)))
    }

    pub fn get_gas_balance(&self, user_id: &str) -> GasLedgerResult<u64> {
        Ok(self.get_account(user_id)?.balance)
    }

    /// Add `amount` to the balance. A debit larger than the balance leaves
    /// it at zero.
    pub fn update_gas_balance(&self, user_id: &str, amount: i64) -> GasLedgerResult<GasAccount> {
        Self::require("user id", user_id)?;
        let _guard = self.write_lock.lock();
        let mut account = self.get_account(user_id)?;
        account.balance = if amount < 0 {
            account.balance.saturating_sub(amount.unsigned_abs())
        } else {
            account.balance.saturating_add(amount as u64)
        };
        account.updated_at = now_secs();
        self.storage
            .store_json(GAS_NAMESPACE, &account_key(user_id), &account)?;
        info!(user_id, amount, balance = account.balance, "gas balance updated");
        Ok(account)
    }

    /// Usage totals of a function; an unknown function has none.
    pub fn get_gas_usage(&self, function_id: &str) -> GasLedgerResult<FunctionUsage> {
        Self::require("function id", function_id)?;
        Ok(self
            .storage
            .retrieve_json(GAS_NAMESPACE, &usage_key(function_id))?
            .unwrap_or_else(|| FunctionUsage::empty(function_id)))
    }

    /// Open a session for one execution. With enforcement, a user without
    /// balance is refused before anything runs.
    pub fn start_accounting(&self, function_id: &str, user_id: &str) -> GasLedgerResult<AccountingSession> {
        Self::require("function id", function_id)?;
        Self::require("user id", user_id)?;
        let available = if self.enforce_balance {
            let balance = self.get_gas_balance(user_id)?;
            if balance == 0 {
                return Err(GasLedgerError::InsufficientBalance { balance });
            }
            Some(balance)
        } else {
            None
        };
        debug!(function_id, user_id, "gas accounting started");
        Ok(AccountingSession {
            function_id: function_id.to_string(),
            user_id: user_id.to_string(),
            started: Instant::now(),
            available,
        })
    }

    /// Close a session: debit the user (never below zero) and add the gas to
    /// the function's totals, atomically.
    pub fn stop_accounting(&self, session: AccountingSession, gas_used: u64) -> GasLedgerResult<GasAccount> {
        let _guard = self.write_lock.lock();
        let now = now_secs();

        let mut account = self.get_account(&session.user_id)?;
        account.balance = account.balance.saturating_sub(gas_used);
        account.total_used = account.total_used.saturating_add(gas_used);
        account.executions += 1;
        account.updated_at = now;

        let mut usage = self.get_gas_usage(&session.function_id)?;
        usage.total_used = usage.total_used.saturating_add(gas_used);
        usage.executions += 1;
        usage.updated_at = now;

        let mut tx = self.storage.transaction();
        tx.put_json(GAS_NAMESPACE, &account_key(&session.user_id), &account)?;
        tx.put_json(GAS_NAMESPACE, &usage_key(&session.function_id), &usage)?;
        tx.commit()?;

        debug!(
            function_id = %session.function_id,
            user_id = %session.user_id,
            gas_used,
            balance = account.balance,
            elapsed_ms = session.elapsed().as_millis() as u64,
            "gas accounting stopped"
        );
        Ok(account)
    }
}

impl std::fmt::Debug for GasLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GasLedger")
            .field("enforce_balance", &self.enforce_balance)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::EnclaveIdentity;
    use crate::error::StorageError;
    use crate::storage::{MemoryBackend, StorageBackend, UnavailableBackend};

    fn ledger(enforce_balance: bool) -> (Arc<MemoryBackend>, GasLedger) {
        let backend = Arc::new(MemoryBackend::new());
        let storage = Arc::new(
            SecureStorage::new(backend.clone(), Arc::new(EnclaveIdentity::ephemeral())).unwrap(),
        );
        (backend, GasLedger::new(storage, enforce_balance))
    }

    #[test]
    fn test_unknown_records_are_empty() {
        let (_, ledger) = ledger(false);
        assert_eq!(ledger.get_gas_balance("nobody").unwrap(), 0);
        assert_eq!(ledger.get_gas_usage("nothing").unwrap(), FunctionUsage::empty("nothing"));
        assert!(matches!(
            ledger.get_account(" "),
            Err(GasLedgerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_balance_updates_clamp_at_zero() {
        let (_, ledger) = ledger(false);
        assert_eq!(ledger.update_gas_balance("alice", 500).unwrap().balance, 500);
        assert_eq!(ledger.update_gas_balance("alice", -200).unwrap().balance, 300);
        assert_eq!(ledger.update_gas_balance("alice", -1_000).unwrap().balance, 0);
        assert_eq!(ledger.update_gas_balance("alice", i64::MIN).unwrap().balance, 0);
        assert_eq!(ledger.get_gas_balance("alice").unwrap(), 0);
    }

    #[test]
    fn test_session_debits_user_and_credits_function() {
        let (_, ledger) = ledger(false);
        ledger.update_gas_balance("alice", 1_000).unwrap();

        let session = ledger.start_accounting("fn-1", "alice").unwrap();
        assert_eq!(session.gas_limit(5_000), 5_000);
        let account = ledger.stop_accounting(session, 400).unwrap();
        assert_eq!(account.balance, 600);

        let session = ledger.start_accounting("fn-1", "alice").unwrap();
        ledger.stop_accounting(session, 900).unwrap();

        let account = ledger.get_account("alice").unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.total_used, 1_300);
        assert_eq!(account.executions, 2);

        let usage = ledger.get_gas_usage("fn-1").unwrap();
        assert_eq!(usage.total_used, 1_300);
        assert_eq!(usage.executions, 2);
    }

    #[test]
    fn test_enforced_balance_caps_and_refuses() {
        let (_, ledger) = ledger(true);
        assert_eq!(
            ledger.start_accounting("fn", "broke").unwrap_err(),
            GasLedgerError::InsufficientBalance { balance: 0 }
        );

        ledger.update_gas_balance("funded", 250).unwrap();
        let session = ledger.start_accounting("fn", "funded").unwrap();
        assert_eq!(session.gas_limit(10_000), 250);
        assert_eq!(session.gas_limit(100), 100);
        ledger.stop_accounting(session, 250).unwrap();

        assert!(ledger.start_accounting("fn", "funded").is_err());
    }

    #[test]
    fn test_records_are_sealed() {
        let (backend, ledger) = ledger(false);
        ledger.update_gas_balance("alice", 123_456).unwrap();
        let raw = backend.get(GAS_NAMESPACE, "user:alice").unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("123456"));
    }

    #[test]
    fn test_rolled_back_balance_is_detected() {
        let (backend, ledger) = ledger(false);
        ledger.update_gas_balance("alice", 10).unwrap();
        let spent = backend.get(GAS_NAMESPACE, "user:alice").unwrap().unwrap();
        ledger.update_gas_balance("alice", 1_000_000).unwrap();
        let session = ledger.start_accounting("fn", "alice").unwrap();
        ledger.stop_accounting(session, 5).unwrap();

        backend.put(GAS_NAMESPACE, "user:alice", &spent).unwrap();
        assert!(matches!(
            ledger.get_gas_balance("alice"),
            Err(GasLedgerError::Storage(StorageError::Corrupt { .. }))
        ));
    }

    #[test]
    fn test_storage_failure_surfaces() {
        let storage = Arc::new(
            SecureStorage::new(
                Arc::new(UnavailableBackend),
                Arc::new(EnclaveIdentity::ephemeral()),
            )
            .unwrap(),
        );
        let ledger = GasLedger::new(storage, true);
        assert!(matches!(
            ledger.start_accounting("fn", "alice"),
            Err(GasLedgerError::Storage(StorageError::Unavailable { .. }))
        ));
    }
}
