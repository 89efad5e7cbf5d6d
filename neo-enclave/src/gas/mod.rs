//! Gas accounting for script execution.
//!
//! A [`GasMeter`] is owned by exactly one execution. Charges are atomic: a
//! charge that would cross the limit leaves the meter untouched. The
//! [`GasLedger`] carries consumption past the execution: user balances and
//! per-function totals.

mod ledger;

pub use ledger::{AccountingSession, FunctionUsage, GasAccount, GasLedger};

use crate::error::GasExhausted;

/// Cost schedule for interpreted work.
pub struct GasCost;

impl GasCost {
    pub const STATEMENT: u64 = 1;
    pub const COMPARISON: u64 = 3;
    pub const MATH: u64 = 5;
    pub const PROPERTY_ACCESS: u64 = 10;
    pub const LOOP_ITERATION: u64 = 10;
    pub const ARRAY_ACCESS: u64 = 20;
    pub const FUNCTION_CALL: u64 = 100;

    const ARRAY_CREATION_BASE: u64 = 30;
    const OBJECT_CREATION_BASE: u64 = 50;
    const STRING_OPERATION_BASE: u64 = 5;
    const EXECUTION_BASE: u64 = 1000;

    /// Creating an array of `len` elements.
    pub fn array_creation(len: usize) -> u64 {
        Self::ARRAY_CREATION_BASE.saturating_add(len as u64)
    }

    /// Creating an object with `fields` properties.
    pub fn object_creation(fields: usize) -> u64 {
        Self::OBJECT_CREATION_BASE.saturating_add(fields as u64)
    }

    /// A string operation producing or scanning `len` bytes.
    pub fn string_operation(len: usize) -> u64 {
        Self::STRING_OPERATION_BASE.saturating_add(len as u64 / 100)
    }

    /// Fixed charge for starting a script of `code_len` bytes.
    pub fn execution_base(code_len: usize) -> u64 {
        Self::EXECUTION_BASE.saturating_add(code_len as u64 / 100)
    }
}

/// Tracks consumption against a fixed limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasMeter {
    used: u64,
    limit: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { used: 0, limit }
    }

    /// Clear consumption, keeping the limit.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Consume `amount`, failing without side effects if it would exceed the limit.
    pub fn charge(&mut self, amount: u64) -> Result<(), GasExhausted> {
        let next = self.used.saturating_add(amount);
        if next > self.limit {
            return Err(GasExhausted {
                requested: amount,
                used: self.used,
                limit: self.limit,
            });
        }
        self.used = next;
        Ok(())
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}
