//! Jurisdiction rule sets and the built-in defaults.

use crate::error::ComplianceError;
use serde::{Deserialize, Serialize};

/// Jurisdiction used when no specific rule set exists.
pub const GLOBAL_JURISDICTION: &str = "global";

const DEFAULT_PROHIBITED_APIS: [&str; 6] = [
    "eval",
    "Function",
    "setTimeout",
    "setInterval",
    "XMLHttpRequest",
    "fetch",
];

/// Checks applied to code and identity documents for one jurisdiction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JurisdictionRules {
    pub jurisdiction: String,
    /// Bumped on every replacement through `set_rules`.
    pub version: u64,
    pub prohibited_apis: Vec<String>,
    pub prohibited_data: Vec<String>,
    pub allow_network_access: bool,
    pub max_gas: u64,
    pub required_identity_fields: Vec<String>,
}

impl Default for JurisdictionRules {
    fn default() -> Self {
        Self {
            jurisdiction: GLOBAL_JURISDICTION.to_string(),
            version: 1,
            prohibited_apis: Vec::new(),
            prohibited_data: Vec::new(),
            allow_network_access: false,
            max_gas: u64::MAX,
            required_identity_fields: Vec::new(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl JurisdictionRules {
    /// Built-in rule set for `jurisdiction`, if one ships with the enclave.
    pub fn builtin(jurisdiction: &str) -> Option<Self> {
        let (prohibited_data, max_gas, identity_fields): (&[&str], u64, &[&str]) = match jurisdiction {
            "global" => (
                &["password", "credit_card", "ssn", "passport"][..],
                1_000_000,
                &["name", "email"][..],
            ),
            "US" => (
                &["password", "credit_card", "ssn", "passport", "driver_license"][..],
                500_000,
                &["name", "email", "address", "phone"][..],
            ),
            "EU" => (
                &["password", "credit_card", "national_id", "passport", "health_data"][..],
                500_000,
                &["name", "email", "address", "phone", "consent"][..],
            ),
            _ => return None,
        };
        Some(Self {
            jurisdiction: jurisdiction.to_string(),
            version: 1,
            prohibited_apis: strings(&DEFAULT_PROHIBITED_APIS),
            prohibited_data: strings(prohibited_data),
            allow_network_access: false,
            max_gas,
            required_identity_fields: strings(identity_fields),
        })
    }

    /// The `global` defaults.
    pub fn global() -> Self {
        Self::builtin(GLOBAL_JURISDICTION).unwrap_or_default()
    }

    pub(crate) fn validate(&self) -> Result<(), ComplianceError> {
        if self.jurisdiction.trim().is_empty() {
            return Err(ComplianceError::InvalidRules("jurisdiction must not be empty".into()));
        }
        let terms = self
            .prohibited_apis
            .iter()
            .chain(&self.prohibited_data)
            .chain(&self.required_identity_fields);
        for term in terms {
            if term.trim().is_empty() {
                return Err(ComplianceError::InvalidRules("rule entries must not be empty".into()));
            }
        }
        Ok(())
    }
}
