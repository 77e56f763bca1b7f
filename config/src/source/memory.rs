//! In-process source for programmatic overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use errors::SourceError;
use parking_lot::RwLock;

use super::{EventCallback, SourceContext, SourceFactory, Sourcer, source_factory};
use crate::event::Event;
use crate::properties::{FlatMap, flatten_under};
use crate::value::{ConfigValue, SourceInfo, Value};

pub struct MemorySource {
    info: SourceInfo,
    callback: EventCallback,
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    values: FlatMap,
    /// Values a removed key reverts to instead of disappearing.
    base: FlatMap,
    /// Flattened keys written by each structured `set`, keyed by its root.
    structures: BTreeMap<String, BTreeSet<String>>,
}

impl MemorySource {
    pub fn new(context: &SourceContext<'_>) -> Self {
        Self::with_values(context, FlatMap::new())
    }

    /// Start with `initial` already present; they are part of the load
    /// snapshot.
    pub fn with_values(context: &SourceContext<'_>, initial: FlatMap) -> Self {
        Self::build(context, MemoryState {
            values: initial,
            ..MemoryState::default()
        })
    }

    /// Writable layer over a fixed `base`. Deleting a key that exists in
    /// `base` restores the base value.
    pub fn overlay(context: &SourceContext<'_>, base: FlatMap) -> Self {
        Self::build(context, MemoryState {
            values: base.clone(),
            base,
            structures: BTreeMap::new(),
        })
    }

    fn build(context: &SourceContext<'_>, state: MemoryState) -> Self {
        Self {
            info: context.info(),
            callback: context.callback(),
            state: RwLock::new(state),
        }
    }

    pub fn factory() -> SourceFactory {
        Self::factory_with(FlatMap::new())
    }

    pub fn factory_with(initial: FlatMap) -> SourceFactory {
        source_factory(move |context| Ok(Arc::new(Self::with_values(context, initial.clone())) as Arc<dyn Sourcer>))
    }

    fn value(&self, raw: ConfigValue) -> Value {
        Value::new(raw, self.info.clone())
    }

    /// Drop `key`, or revert it to its base value.
    fn remove_key(&self, state: &mut MemoryState, key: &str) {
        for keys in state.structures.values_mut() {
            keys.remove(key);
        }
        match state.base.get(key).cloned() {
            Some(original) => {
                if state.values.get(key) != Some(&original) {
                    state.values.insert(key.to_string(), original.clone());
                    (self.callback)(Event::update(key, self.value(original)));
                }
            }
            None => {
                if state.values.remove(key).is_some() {
                    (self.callback)(Event::delete(key, self.info.clone(), None));
                }
            }
        }
    }
}

/// True when `key` is `parent` itself or one of its flattened children.
fn is_under(key: &str, parent: &str) -> bool {
    key.strip_prefix(parent)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.') || rest.starts_with('['))
}

impl Sourcer for MemorySource {
    fn name(&self) -> &str {
        self.info.name()
    }

    fn priority(&self) -> i32 {
        self.info.priority()
    }

    fn get_all(&self) -> BTreeMap<String, Value> {
        self.state
            .read()
            .values
            .iter()
            .map(|(k, v)| (k.clone(), self.value(v.clone())))
            .collect()
    }

    /// Structured values are flattened under `key` and replace a scalar at
    /// `key` itself. Children left over from an earlier structured `set` on
    /// this source that the new value no longer has are removed; keys this
    /// source got any other way are kept.
    fn set(&self, key: &str, value: ConfigValue) -> Result<(), SourceError> {
        let incoming = flatten_under(key, &value);
        let mut state = self.state.write();

        let structured = matches!(value, ConfigValue::Map(_) | ConfigValue::List(_));
        let mut stale: BTreeSet<String> = state
            .structures
            .iter()
            .filter(|(root, _)| is_under(root, key) || is_under(key, root))
            .flat_map(|(_, keys)| keys.iter())
            .filter(|k| is_under(k, key) && !incoming.contains_key(*k))
            .cloned()
            .collect();
        if structured && state.values.contains_key(key) {
            stale.insert(key.to_string());
        }
        for stale_key in &stale {
            self.remove_key(&mut state, stale_key);
        }

        state.structures.retain(|root, _| !is_under(root, key));
        if structured {
            state
                .structures
                .insert(key.to_string(), incoming.keys().cloned().collect());
        }

        for (flat_key, raw) in incoming {
            let event = match state.values.insert(flat_key.clone(), raw.clone()) {
                Some(previous) if previous == raw => continue,
                Some(_) => Event::update(flat_key, self.value(raw)),
                None => Event::create(flat_key, self.value(raw)),
            };
            (self.callback)(event);
        }
        Ok(())
    }

    /// Removes `key`, plus the children a structured `set` of `key` (or of a
    /// key below it) wrote.
    fn delete(&self, key: &str) -> Result<(), SourceError> {
        let mut state = self.state.write();

        let mut targets = BTreeSet::from([key.to_string()]);
        for (root, keys) in &state.structures {
            if is_under(root, key) {
                targets.extend(keys.iter().cloned());
            }
        }
        state.structures.retain(|root, _| !is_under(root, key));

        for target in &targets {
            self.remove_key(&mut state, target);
        }
        Ok(())
    }

    fn disconnect(&self) {}
}
