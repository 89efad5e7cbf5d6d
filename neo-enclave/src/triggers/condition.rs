//! Trigger conditions, parsed once at registration into a tagged matcher.
//!
//! | Kind       | Condition                                                  |
//! |------------|------------------------------------------------------------|
//! | Schedule   | free text, not interpreted                                 |
//! | Blockchain | empty, or object with `event_type`, `contract_address`, `event_name` |
//! | Storage    | empty, or object with `key`, `key_prefix`, `operation`     |
//! | External   | the exact event type                                       |

use super::types::TriggerKind;
use crate::error::{TriggerError, TriggerResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockchainMatcher {
    pub event_type: Option<String>,
    pub contract_address: Option<String>,
    pub event_name: Option<String>,
}

impl BlockchainMatcher {
    /// Every field present here must equal the event's.
    pub fn matches(&self, event: &BlockchainEvent) -> bool {
        field_matches(&self.event_type, &event.event_type)
            && field_matches(&self.contract_address, &event.contract_address)
            && field_matches(&self.event_name, &event.event_name)
    }
}

fn field_matches(expected: &Option<String>, actual: &Option<String>) -> bool {
    match expected {
        None => true,
        Some(expected) => actual.as_deref() == Some(expected.as_str()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageMatcher {
    pub key: Option<String>,
    pub key_prefix: Option<String>,
    pub operation: Option<String>,
}

impl StorageMatcher {
    pub fn matches(&self, key: &str, operation: &str) -> bool {
        self.key.as_deref().map_or(true, |k| k == key)
            && self.key_prefix.as_deref().map_or(true, |p| key.starts_with(p))
            && self.operation.as_deref().map_or(true, |op| op == operation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    Schedule,
    Blockchain(BlockchainMatcher),
    Storage(StorageMatcher),
    External(String),
}

fn parse_object<T: DeserializeOwned + Default>(condition: &str) -> Result<T, String> {
    if condition.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(condition).map_err(|e| e.to_string())
}

impl Matcher {
    pub fn parse(kind: TriggerKind, condition: &str) -> Result<Self, String> {
        Ok(match kind {
            TriggerKind::Schedule => Matcher::Schedule,
            TriggerKind::Blockchain => Matcher::Blockchain(parse_object(condition)?),
            TriggerKind::Storage => Matcher::Storage(parse_object(condition)?),
            TriggerKind::External => {
                if condition.is_empty() {
                    return Err("external trigger needs an event type".into());
                }
                Matcher::External(condition.to_string())
            }
        })
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Matcher::Schedule => TriggerKind::Schedule,
            Matcher::Blockchain(_) => TriggerKind::Blockchain,
            Matcher::Storage(_) => TriggerKind::Storage,
            Matcher::External(_) => TriggerKind::External,
        }
    }
}

/// A blockchain notification forwarded by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockchainEvent {
    pub event_type: Option<String>,
    pub contract_address: Option<String>,
    pub event_name: Option<String>,
    /// Full event object, merged into the script input as `event`.
    pub raw: Value,
}

fn aliased_field(object: &Map<String, Value>, names: [&str; 2]) -> TriggerResult<Option<String>> {
    for name in names {
        match object.get(name) {
            None | Some(Value::Null) => continue,
            Some(Value::String(value)) => return Ok(Some(value.clone())),
            Some(_) => {
                return Err(TriggerError::MalformedEvent(format!(
                    "field {name} must be a string"
                )))
            }
        }
    }
    Ok(None)
}

impl BlockchainEvent {
    /// Parse an event. Each field is read from its long or short name
    /// (`event_type`/`type`, `contract_address`/`contract`, `event_name`/`name`).
    pub fn parse(event_json: &str) -> TriggerResult<Self> {
        let raw: Value = serde_json::from_str(event_json)
            .map_err(|e| TriggerError::MalformedEvent(e.to_string()))?;
        let Value::Object(object) = &raw else {
            return Err(TriggerError::MalformedEvent("event must be a JSON object".into()));
        };
        Ok(Self {
            event_type: aliased_field(object, ["event_type", "type"])?,
            contract_address: aliased_field(object, ["contract_address", "contract"])?,
            event_name: aliased_field(object, ["event_name", "name"])?,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_by_kind() {
        assert_eq!(Matcher::parse(TriggerKind::Schedule, "every minute"), Ok(Matcher::Schedule));
        assert_eq!(
            Matcher::parse(TriggerKind::External, "price_update"),
            Ok(Matcher::External("price_update".into()))
        );
        assert!(Matcher::parse(TriggerKind::External, "").is_err());

        let Matcher::Blockchain(m) =
            Matcher::parse(TriggerKind::Blockchain, r#"{"event_name":"Transfer"}"#).unwrap()
        else {
            panic!("expected blockchain matcher");
        };
        assert_eq!(m.event_name.as_deref(), Some("Transfer"));
        assert!(m.event_type.is_none());

        assert_eq!(
            Matcher::parse(TriggerKind::Storage, "").unwrap(),
            Matcher::Storage(StorageMatcher::default())
        );
    }

    #[test]
    fn test_malformed_conditions() {
        assert!(Matcher::parse(TriggerKind::Blockchain, "{not json").is_err());
        assert!(Matcher::parse(TriggerKind::Blockchain, r#"{"evnt_type":"x"}"#).is_err());
        assert!(Matcher::parse(TriggerKind::Blockchain, r#"["x"]"#).is_err());
        assert!(Matcher::parse(TriggerKind::Storage, r#"{"key": 5}"#).is_err());
    }

    #[test]
    fn test_blockchain_matching() {
        let event = BlockchainEvent::parse(
            r#"{"type":"notification","contract":"0xabc","name":"Transfer","amount":5}"#,
        )
        .unwrap();
        assert_eq!(event.raw["amount"], 5);

        let any = BlockchainMatcher::default();
        assert!(any.matches(&event));

        let named = BlockchainMatcher {
            event_name: Some("Transfer".into()),
            contract_address: Some("0xabc".into()),
            ..Default::default()
        };
        assert!(named.matches(&event));

        let other = BlockchainMatcher {
            contract_address: Some("0xdef".into()),
            ..Default::default()
        };
        assert!(!other.matches(&event));

        let sparse = BlockchainEvent::parse(r#"{"event_name":"Transfer"}"#).unwrap();
        assert!(!named.matches(&sparse));
    }

    #[test]
    fn test_malformed_events() {
        assert!(matches!(
            BlockchainEvent::parse("not json"),
            Err(TriggerError::MalformedEvent(_))
        ));
        assert!(matches!(
            BlockchainEvent::parse("[1, 2]"),
            Err(TriggerError::MalformedEvent(_))
        ));
        assert!(matches!(
            BlockchainEvent::parse(r#"{"type": 7}"#),
            Err(TriggerError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_storage_matching() {
        let matcher = StorageMatcher {
            key_prefix: Some("orders/".into()),
            operation: Some("put".into()),
            key: None,
        };
        assert!(matcher.matches("orders/1", "put"));
        assert!(!matcher.matches("orders/1", "delete"));
        assert!(!matcher.matches("users/1", "put"));
        assert!(StorageMatcher::default().matches("anything", "delete"));
    }
}
