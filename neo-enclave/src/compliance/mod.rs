//! Compliance checks for scripts and identity documents.
//!
//! Code checks are static: word-boundary searches for prohibited APIs and
//! data categories, a network-access scan, and a coarse gas estimate. Every
//! failing check contributes a violation; nothing short-circuits. Results are
//! persisted per subject and jurisdiction, each call superseding the last.

mod rules;

pub use rules::{JurisdictionRules, GLOBAL_JURISDICTION};

use crate::error::{ComplianceError, ComplianceResult};
use crate::storage::{SecureStorage, COMPLIANCE_NAMESPACE};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Gas estimated per byte of source.
pub const GAS_PER_CODE_BYTE: u64 = 10;
/// Gas estimated per loop keyword.
pub const GAS_PER_LOOP: u64 = 1000;

const NETWORK_PATTERNS: [&str; 8] = [
    r"\bXMLHttpRequest\b",
    r"\bfetch\b",
    r"\bWebSocket\b",
    r"\bnavigator\.sendBeacon\b",
    r"\bwindow\.open\b",
    r"\blocation\.href\b",
    r"\blocation\.replace\b",
    r"\blocation\.assign\b",
];

fn network_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        NETWORK_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn loop_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\b(for|while|do)\b").ok())
        .as_ref()
}

fn word_pattern(term: &str) -> ComplianceResult<Regex> {
    Regex::new(&format!(r"\b{}\b", regex::escape(term)))
        .map_err(|e| ComplianceError::InvalidRules(format!("unusable rule entry {term:?}: {e}")))
}

/// A single failed check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Violation {
    ProhibitedApi { api: String },
    ProhibitedData { data: String },
    NetworkAccess,
    ResourceUsage { estimated_gas: u64, max_gas: u64 },
    MissingField { field: String },
}

impl Violation {
    pub fn message(&self) -> String {
        match self {
            Self::ProhibitedApi { api } => format!("Code contains prohibited API: {api}"),
            Self::ProhibitedData { data } => format!("Code contains prohibited data: {data}"),
            Self::NetworkAccess => "Code contains network access".to_string(),
            Self::ResourceUsage { .. } => "Estimated gas usage exceeds maximum allowed".to_string(),
            Self::MissingField { field } => format!("Required field is missing: {field}"),
        }
    }
}

/// Outcome of a code or identity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// Set for code checks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    pub user_id: String,
    pub jurisdiction: String,
    pub is_compliant: bool,
    pub violations: Vec<Violation>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Rough gas estimate used by the resource check.
pub fn estimate_gas(code: &str) -> u64 {
    let loops = loop_pattern().map_or(0, |p| p.find_iter(code).count()) as u64;
    (code.len() as u64)
        .saturating_mul(GAS_PER_CODE_BYTE)
        .saturating_add(loops.saturating_mul(GAS_PER_LOOP))
}

/// Run every code check against `rules`, collecting all violations.
pub fn check_code(code: &str, rules: &JurisdictionRules) -> ComplianceResult<Vec<Violation>> {
    let mut violations = Vec::new();

    for api in &rules.prohibited_apis {
        if word_pattern(api)?.is_match(code) {
            violations.push(Violation::ProhibitedApi { api: api.clone() });
        }
    }
    for data in &rules.prohibited_data {
        if word_pattern(data)?.is_match(code) {
            violations.push(Violation::ProhibitedData { data: data.clone() });
        }
    }
    if !rules.allow_network_access && network_patterns().iter().any(|p| p.is_match(code)) {
        violations.push(Violation::NetworkAccess);
    }
    let estimated_gas = estimate_gas(code);
    if estimated_gas > rules.max_gas {
        violations.push(Violation::ResourceUsage {
            estimated_gas,
            max_gas: rules.max_gas,
        });
    }
    Ok(violations)
}

fn status_key(function_id: &str, jurisdiction: &str) -> String {
    format!("status:{function_id}:{jurisdiction}")
}

fn identity_key(user_id: &str, jurisdiction: &str) -> String {
    format!("identity:{user_id}:{jurisdiction}")
}

fn rules_key(jurisdiction: &str) -> String {
    format!("rules:{jurisdiction}")
}

/// Rule management and verification over sealed storage.
pub struct ComplianceService {
    storage: Arc<SecureStorage>,
    lock: Mutex<()>,
}

impl ComplianceService {
    pub fn new(storage: Arc<SecureStorage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    fn load_rules(&self, jurisdiction: &str) -> ComplianceResult<Option<JurisdictionRules>> {
        let stored = self
            .storage
            .retrieve_json(COMPLIANCE_NAMESPACE, &rules_key(jurisdiction))?;
        Ok(stored.or_else(|| JurisdictionRules::builtin(jurisdiction)))
    }

    /// Rules for `jurisdiction`, falling back to `global`.
    pub fn get_rules(&self, jurisdiction: &str) -> ComplianceResult<JurisdictionRules> {
        if let Some(rules) = self.load_rules(jurisdiction)? {
            return Ok(rules);
        }
        Ok(self
            .load_rules(GLOBAL_JURISDICTION)?
            .unwrap_or_else(JurisdictionRules::global))
    }

    /// Replace the rules for `jurisdiction`. The stored version is one past
    /// the version being replaced.
    pub fn set_rules(&self, jurisdiction: &str, mut rules: JurisdictionRules) -> ComplianceResult<JurisdictionRules> {
        rules.jurisdiction = jurisdiction.to_string();
        rules.validate()?;

        let _guard = self.lock.lock();
        let current = self.load_rules(jurisdiction)?.map_or(0, |r| r.version);
        rules.version = current + 1;
        self.storage
            .store_json(COMPLIANCE_NAMESPACE, &rules_key(jurisdiction), &rules)?;
        info!(jurisdiction, version = rules.version, "compliance rules replaced");
        Ok(rules)
    }

    /// Check `code` against `rules` and record the result under the rules'
    /// jurisdiction.
    pub fn verify_code(
        &self,
        code: &str,
        user_id: &str,
        function_id: &str,
        rules: &JurisdictionRules,
    ) -> ComplianceResult<ComplianceReport> {
        let violations = check_code(code, rules)?;
        let report = ComplianceReport {
            function_id: Some(function_id.to_string()),
            user_id: user_id.to_string(),
            jurisdiction: rules.jurisdiction.clone(),
            is_compliant: violations.is_empty(),
            violations,
            timestamp: now_millis(),
        };

        let _guard = self.lock.lock();
        self.storage.store_json(
            COMPLIANCE_NAMESPACE,
            &status_key(function_id, &rules.jurisdiction),
            &report,
        )?;
        debug!(
            function_id,
            jurisdiction = %rules.jurisdiction,
            violations = report.violations.len(),
            "code compliance checked"
        );
        Ok(report)
    }

    /// Check that `identity_data` carries every field the jurisdiction
    /// requires. Missing and null fields both count as absent.
    pub fn verify_identity(
        &self,
        user_id: &str,
        identity_data: &Value,
        jurisdiction: &str,
    ) -> ComplianceResult<ComplianceReport> {
        let Value::Object(fields) = identity_data else {
            return Err(ComplianceError::InvalidIdentityData(
                "identity data must be a JSON object".into(),
            ));
        };
        let rules = self.get_rules(jurisdiction)?;
        let violations: Vec<Violation> = rules
            .required_identity_fields
            .iter()
            .filter(|field| fields.get(field.as_str()).map_or(true, Value::is_null))
            .map(|field| Violation::MissingField {
                field: field.clone(),
            })
            .collect();

        let report = ComplianceReport {
            function_id: None,
            user_id: user_id.to_string(),
            jurisdiction: jurisdiction.to_string(),
            is_compliant: violations.is_empty(),
            violations,
            timestamp: now_millis(),
        };

        let _guard = self.lock.lock();
        self.storage.store_json(
            COMPLIANCE_NAMESPACE,
            &identity_key(user_id, jurisdiction),
            &report,
        )?;
        debug!(jurisdiction, verified = report.is_compliant, "identity checked");
        Ok(report)
    }

    /// Latest code check for a function in a jurisdiction.
    pub fn get_compliance_status(
        &self,
        function_id: &str,
        jurisdiction: &str,
    ) -> ComplianceResult<Option<ComplianceReport>> {
        Ok(self
            .storage
            .retrieve_json(COMPLIANCE_NAMESPACE, &status_key(function_id, jurisdiction))?)
    }

    /// Latest identity check for a user in a jurisdiction.
    pub fn get_identity_status(
        &self,
        user_id: &str,
        jurisdiction: &str,
    ) -> ComplianceResult<Option<ComplianceReport>> {
        Ok(self
            .storage
            .retrieve_json(COMPLIANCE_NAMESPACE, &identity_key(user_id, jurisdiction))?)
    }
}

impl std::fmt::Debug for ComplianceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::EnclaveIdentity;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    fn service() -> ComplianceService {
        let storage = SecureStorage::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(EnclaveIdentity::ephemeral()),
        )
        .unwrap();
        ComplianceService::new(Arc::new(storage))
    }

    #[test]
    fn test_clean_code_is_compliant() {
        let service = service();
        let rules = JurisdictionRules::global();
        let report = service
            .verify_code("function main(i) { return i.a + 1; }", "u", "f", &rules)
            .unwrap();
        assert!(report.is_compliant);
        assert!(report.violations.is_empty());
        assert_eq!(report.jurisdiction, "global");
    }

    #[test]
    fn test_violations_accumulate() {
        let rules = JurisdictionRules {
            max_gas: 100,
            ..JurisdictionRules::global()
        };
        let code = "function main() { let password = 1; for (;;) {} return fetch(eval('x')); }";
        let violations = check_code(code, &rules).unwrap();

        assert!(violations.contains(&Violation::ProhibitedApi { api: "eval".into() }));
        assert!(violations.contains(&Violation::ProhibitedApi { api: "fetch".into() }));
        assert!(violations.contains(&Violation::ProhibitedData {
            data: "password".into()
        }));
        assert!(violations.contains(&Violation::NetworkAccess));
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::ResourceUsage { max_gas: 100, .. })));
    }

    #[test]
    fn test_word_boundaries() {
        let rules = JurisdictionRules::global();
        let violations = check_code("let evaluate = 1; let passwords = 2;", &rules).unwrap();
        assert!(violations.is_empty());
    }

    #[test]
    fn test_network_allowed() {
        let rules = JurisdictionRules {
            allow_network_access: true,
            prohibited_apis: Vec::new(),
            ..JurisdictionRules::global()
        };
        assert!(check_code("new WebSocket('x')", &rules).unwrap().is_empty());
    }

    #[test]
    fn test_gas_estimate() {
        assert_eq!(estimate_gas("abc"), 30);
        assert_eq!(estimate_gas("while for do"), 12 * 10 + 3 * 1000);
        assert_eq!(estimate_gas("forward"), 70);
    }

    #[test]
    fn test_rules_fallback_and_versioning() {
        let service = service();
        assert_eq!(service.get_rules("US").unwrap().jurisdiction, "US");
        assert_eq!(service.get_rules("JP").unwrap().jurisdiction, "global");

        let custom = JurisdictionRules {
            prohibited_apis: vec!["Date".into()],
            ..JurisdictionRules::default()
        };
        let stored = service.set_rules("US", custom.clone()).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.jurisdiction, "US");
        assert_eq!(service.get_rules("US").unwrap(), stored);

        let again = service.set_rules("US", custom).unwrap();
        assert_eq!(again.version, 3);

        let fresh = service
            .set_rules("JP", JurisdictionRules::default())
            .unwrap();
        assert_eq!(fresh.version, 1);
        assert_eq!(service.get_rules("JP").unwrap().jurisdiction, "JP");
    }

    #[test]
    fn test_set_rules_rejects_invalid() {
        let service = service();
        let rules = JurisdictionRules {
            prohibited_apis: vec![String::new()],
            ..JurisdictionRules::default()
        };
        assert!(matches!(
            service.set_rules("US", rules),
            Err(ComplianceError::InvalidRules(_))
        ));
        assert_eq!(service.get_rules("US").unwrap().version, 1);
    }

    #[test]
    fn test_identity_verification() {
        let service = service();
        let report = service
            .verify_identity(
                "alice",
                &json!({"name": "Alice", "email": null, "address": "x"}),
                "US",
            )
            .unwrap();
        assert!(!report.is_compliant);
        assert_eq!(
            report.violations,
            vec![
                Violation::MissingField { field: "email".into() },
                Violation::MissingField { field: "phone".into() },
            ]
        );

        let ok = service
            .verify_identity("bob", &json!({"name": "Bob", "email": "b@x"}), "global")
            .unwrap();
        assert!(ok.is_compliant);

        assert!(matches!(
            service.verify_identity("carol", &json!(["name"]), "US"),
            Err(ComplianceError::InvalidIdentityData(_))
        ));
    }

    #[test]
    fn test_status_is_superseded() {
        let service = service();
        let rules = JurisdictionRules::global();
        service.verify_code("eval('1')", "u", "f1", &rules).unwrap();
        assert!(!service
            .get_compliance_status("f1", "global")
            .unwrap()
            .unwrap()
            .is_compliant);

        service.verify_code("1 + 1", "u", "f1", &rules).unwrap();
        let status = service.get_compliance_status("f1", "global").unwrap().unwrap();
        assert!(status.is_compliant);
        assert!(service.get_compliance_status("f1", "EU").unwrap().is_none());

        service
            .verify_identity("alice", &json!({"name": "A", "email": "e"}), "global")
            .unwrap();
        assert!(service
            .get_identity_status("alice", "global")
            .unwrap()
            .unwrap()
            .is_compliant);
    }

    #[test]
    fn test_violation_serialization_is_tagged() {
        let json = serde_json::to_value(Violation::ProhibitedApi { api: "eval".into() }).unwrap();
        assert_eq!(json, json!({"type": "prohibited_api", "api": "eval"}));
        assert_eq!(
            serde_json::to_value(Violation::NetworkAccess).unwrap(),
            json!({"type": "network_access"})
        );
    }
}
