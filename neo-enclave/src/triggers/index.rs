use super::condition::Matcher;
use super::types::{Trigger, TriggerKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub(crate) struct IndexedTrigger {
    pub trigger: Trigger,
    pub matcher: Matcher,
}

/// Owning map of triggers plus a by-kind view derived from it. Both change
/// together through `insert` and `remove` only.
#[derive(Debug, Default)]
pub(crate) struct TriggerIndex {
    triggers: BTreeMap<String, IndexedTrigger>,
    by_kind: HashMap<TriggerKind, BTreeSet<String>>,
}

impl TriggerIndex {
    pub fn contains(&self, id: &str) -> bool {
        self.triggers.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&IndexedTrigger> {
        self.triggers.get(id)
    }

    /// Insert or replace. The kind of an existing entry never changes.
    pub fn insert(&mut self, trigger: Trigger, matcher: Matcher) {
        debug_assert_eq!(matcher.kind(), trigger.kind);
        let id = trigger.id.clone();
        if let Some(previous) = self.triggers.get(&id) {
            if let Some(ids) = self.by_kind.get_mut(&previous.trigger.kind) {
                ids.remove(&id);
            }
        }
        self.by_kind.entry(trigger.kind).or_default().insert(id.clone());
        self.triggers.insert(id, IndexedTrigger { trigger, matcher });
    }

    /// Replace the stored record of an indexed trigger, keeping its matcher.
    pub fn update(&mut self, trigger: Trigger) -> bool {
        match self.triggers.get_mut(&trigger.id) {
            Some(entry) if entry.trigger.kind == trigger.kind => {
                entry.trigger = trigger;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Trigger> {
        let entry = self.triggers.remove(id)?;
        if let Some(ids) = self.by_kind.get_mut(&entry.trigger.kind) {
            ids.remove(id);
        }
        Some(entry.trigger)
    }

    /// Ids of one kind, in id order.
    pub fn ids_of_kind(&self, kind: TriggerKind) -> Vec<String> {
        self.by_kind
            .get(&kind)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedTrigger> {
        self.triggers.values()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Recompute the by-kind view from the owning map.
    #[cfg(test)]
    pub fn rebuild_kind_view(&mut self) {
        self.by_kind.clear();
        for (id, entry) in &self.triggers {
            self.by_kind
                .entry(entry.trigger.kind)
                .or_default()
                .insert(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn trigger(id: &str, kind: TriggerKind) -> Trigger {
        Trigger {
            id: id.to_string(),
            kind,
            condition: if kind == TriggerKind::External { "evt" } else { "" }.to_string(),
            function_id: "f".to_string(),
            owner_user_id: "u".to_string(),
            code: "function main() {}".to_string(),
            input: Value::Null,
            gas_limit: 10,
            enabled: true,
            next_execution_time: 0,
            interval_seconds: 0,
        }
    }

    fn add(index: &mut TriggerIndex, id: &str, kind: TriggerKind) {
        let t = trigger(id, kind);
        let matcher = Matcher::parse(kind, &t.condition).unwrap();
        index.insert(t, matcher);
    }

    #[test]
    fn test_kind_view_tracks_owning_map() {
        let mut index = TriggerIndex::default();
        add(&mut index, "b", TriggerKind::External);
        add(&mut index, "a", TriggerKind::External);
        add(&mut index, "c", TriggerKind::Schedule);

        assert_eq!(index.ids_of_kind(TriggerKind::External), vec!["a", "b"]);
        assert_eq!(index.ids_of_kind(TriggerKind::Schedule), vec!["c"]);
        assert!(index.ids_of_kind(TriggerKind::Storage).is_empty());

        assert!(index.remove("a").is_some());
        assert!(index.remove("a").is_none());
        assert_eq!(index.ids_of_kind(TriggerKind::External), vec!["b"]);
        assert_eq!(index.len(), 2);
        assert!(!index.contains("a"));
    }

    #[test]
    fn test_update_keeps_kind() {
        let mut index = TriggerIndex::default();
        add(&mut index, "a", TriggerKind::External);

        let mut changed = trigger("a", TriggerKind::External);
        changed.enabled = false;
        assert!(index.update(changed));
        assert!(!index.get("a").unwrap().trigger.enabled);

        assert!(!index.update(trigger("a", TriggerKind::Schedule)));
        assert!(!index.update(trigger("missing", TriggerKind::External)));
    }

    #[test]
    fn test_rebuild_matches_incremental_view() {
        let mut index = TriggerIndex::default();
        for (i, kind) in TriggerKind::ALL.iter().enumerate() {
            add(&mut index, &format!("t{}", i), *kind);
        }
        index.remove("t1");
        let before: Vec<_> = TriggerKind::ALL.iter().map(|k| index.ids_of_kind(*k)).collect();
        index.rebuild_kind_view();
        let after: Vec<_> = TriggerKind::ALL.iter().map(|k| index.ids_of_kind(*k)).collect();
        assert_eq!(before, after);
    }
}
