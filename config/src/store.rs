//! The two key stores behind the manager.
//!
//! - `MergedStore`: key → currently winning value, read by every getter
//! - `HistoryStore`: source → key → contributions, used to fall back when a
//!   winning value is deleted
//!
//! Both are sharded concurrent maps, so readers only contend with writers
//! touching the same shard and a key switches from one `Value` to the next in
//! a single insert.

use std::collections::BTreeMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::value::{ConfigValue, Value};

#[derive(Default)]
pub(crate) struct MergedStore {
    entries: DashMap<String, Value>,
}

impl MergedStore {
    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Exclusive access to one key for the duration of a precedence decision.
    pub(crate) fn entry(&self, key: &str) -> Entry<'_, String, Value> {
        self.entries.entry(key.to_string())
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Keys whose winning value belongs to `source_name` / `reference`.
    pub(crate) fn keys_from(&self, source_name: &str, reference: Option<&str>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().same_origin(source_name, reference))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Raw values of every key starting with `prefix`, sorted by key.
    pub(crate) fn scan_prefix(&self, prefix: &str) -> BTreeMap<String, ConfigValue> {
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().raw().clone()))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, ConfigValue> {
        self.scan_prefix("")
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Contributions per source and key.
///
/// A source normally holds one value per key, but values from different
/// groups of the same source (two files defining the same key) are kept side
/// by side so removing one group can expose the other.
#[derive(Default)]
pub(crate) struct HistoryStore {
    sources: DashMap<String, DashMap<String, Vec<Value>>>,
}

impl HistoryStore {
    /// Record a contribution, replacing any earlier one from the same group.
    pub(crate) fn record(&self, key: &str, value: Value) {
        let source = self
            .sources
            .entry(value.source().name().to_string())
            .or_default();
        let mut contributions = source.entry(key.to_string()).or_default();
        contributions.retain(|existing| existing.reference() != value.reference());
        contributions.push(value);
    }

    /// Drop everything `source_name` contributed for `key`.
    pub(crate) fn remove_key(&self, source_name: &str, key: &str) -> bool {
        self.sources
            .get(source_name)
            .is_some_and(|source| source.remove(key).is_some())
    }

    /// Drop the `reference` group from `key`, or the whole key when no group
    /// is given.
    pub(crate) fn remove_keyed(&self, source_name: &str, key: &str, reference: Option<&str>) -> bool {
        let Some(reference) = reference else {
            return self.remove_key(source_name, key);
        };
        let Some(source) = self.sources.get(source_name) else {
            return false;
        };

        let removed = match source.get_mut(key) {
            Some(mut contributions) => {
                let before = contributions.len();
                contributions.retain(|v| v.reference() != Some(reference));
                before != contributions.len()
            }
            None => false,
        };
        source.remove_if(key, |_, contributions| contributions.is_empty());
        removed
    }

    /// Drop every contribution of the `reference` group, returning the keys
    /// that were touched.
    pub(crate) fn remove_ref(&self, source_name: &str, reference: &str) -> Vec<String> {
        let Some(source) = self.sources.get(source_name) else {
            return Vec::new();
        };

        let mut touched = Vec::new();
        for mut entry in source.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|v| v.reference() != Some(reference));
            if entry.value().len() != before {
                touched.push(entry.key().clone());
            }
        }
        source.retain(|_, contributions| !contributions.is_empty());
        touched
    }

    /// Most recent surviving contribution of `source_name` for `key`.
    pub(crate) fn latest(&self, source_name: &str, key: &str) -> Option<Value> {
        let source = self.sources.get(source_name)?;
        let contributions = source.get(key)?;
        contributions.last().cloned()
    }

    pub(crate) fn keys_of(&self, source_name: &str) -> Vec<String> {
        self.sources
            .get(source_name)
            .map(|source| source.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }
}
