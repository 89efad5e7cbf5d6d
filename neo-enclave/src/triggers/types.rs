use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event source a trigger reacts to. Fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule,
    Blockchain,
    Storage,
    External,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 4] = [
        TriggerKind::Schedule,
        TriggerKind::Blockchain,
        TriggerKind::Storage,
        TriggerKind::External,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Schedule => "schedule",
            TriggerKind::Blockchain => "blockchain",
            TriggerKind::Storage => "storage",
            TriggerKind::External => "external",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enabled_by_default() -> bool {
    true
}

/// A registered reaction rule, as persisted under `trigger:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub kind: TriggerKind,
    /// Matcher source; its meaning depends on `kind`.
    #[serde(default)]
    pub condition: String,
    pub function_id: String,
    pub owner_user_id: String,
    pub code: String,
    /// Base payload, an object or null.
    #[serde(default)]
    pub input: Value,
    pub gas_limit: u64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Unix seconds. Schedule triggers only.
    #[serde(default)]
    pub next_execution_time: u64,
    #[serde(default)]
    pub interval_seconds: u64,
}

/// What the host may see about a trigger: no code and no input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSummary {
    pub id: String,
    pub kind: TriggerKind,
    pub condition: String,
    pub function_id: String,
    pub owner_user_id: String,
    pub gas_limit: u64,
    pub enabled: bool,
    pub next_execution_time: u64,
    pub interval_seconds: u64,
}

impl From<&Trigger> for TriggerSummary {
    fn from(trigger: &Trigger) -> Self {
        Self {
            id: trigger.id.clone(),
            kind: trigger.kind,
            condition: trigger.condition.clone(),
            function_id: trigger.function_id.clone(),
            owner_user_id: trigger.owner_user_id.clone(),
            gas_limit: trigger.gas_limit,
            enabled: trigger.enabled,
            next_execution_time: trigger.next_execution_time,
            interval_seconds: trigger.interval_seconds,
        }
    }
}

/// Registration request as sent by the host. A missing id is assigned by
/// the enclave and a missing gas limit takes the configured default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: TriggerKind,
    #[serde(default)]
    pub condition: String,
    pub function_id: String,
    pub owner_user_id: String,
    pub code: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub next_execution_time: u64,
    #[serde(default)]
    pub interval_seconds: u64,
}

impl TriggerDefinition {
    pub fn into_trigger(self, default_gas_limit: u64) -> Trigger {
        Trigger {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind: self.kind,
            condition: self.condition,
            function_id: self.function_id,
            owner_user_id: self.owner_user_id,
            code: self.code,
            input: self.input,
            gas_limit: self.gas_limit.unwrap_or(default_gas_limit),
            enabled: self.enabled,
            next_execution_time: self.next_execution_time,
            interval_seconds: self.interval_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_value(TriggerKind::Blockchain).unwrap(), json!("blockchain"));
        let kind: TriggerKind = serde_json::from_value(json!("schedule")).unwrap();
        assert_eq!(kind, TriggerKind::Schedule);
        assert_eq!(TriggerKind::External.to_string(), "external");
    }

    #[test]
    fn test_definition_defaults() {
        let def: TriggerDefinition = serde_json::from_value(json!({
            "kind": "external",
            "condition": "price",
            "function_id": "f",
            "owner_user_id": "u",
            "code": "function main() {}"
        }))
        .unwrap();
        assert!(def.enabled);
        let trigger = def.into_trigger(42);
        assert_eq!(trigger.gas_limit, 42);
        assert_eq!(trigger.id.len(), 36);
        assert_eq!(trigger.input, Value::Null);
    }

    #[test]
    fn test_summary_omits_code_and_input() {
        let trigger = TriggerDefinition {
            id: Some("t".into()),
            kind: TriggerKind::Storage,
            condition: String::new(),
            function_id: "f".into(),
            owner_user_id: "u".into(),
            code: "function main() { return SECRETS; }".into(),
            input: json!({"k": 1}),
            gas_limit: Some(10),
            enabled: false,
            next_execution_time: 0,
            interval_seconds: 0,
        }
        .into_trigger(1);
        let summary = serde_json::to_value(TriggerSummary::from(&trigger)).unwrap();
        assert!(summary.get("code").is_none());
        assert!(summary.get("input").is_none());
        assert_eq!(summary["enabled"], json!(false));
    }
}
