//! # Config Manager
//!
//! Owns the source registry, both key stores and the listener registry, and
//! applies every source event through one precedence engine.
//!
//! ## Update
//! A Create/Update is recorded in the contributing source's history and then
//! applied to the merged store when the key is absent, when the event comes
//! from the source that currently owns the key, or when it comes from a
//! strictly higher priority source. Otherwise it is discarded.
//!
//! ## Delete
//! The contribution is removed from the source's history first (one key, or
//! every key of a `Ref` group). For every affected key still owned by the
//! deleting source's priority or lower, the surviving contributions are
//! scanned from the highest priority source down and the first hit becomes
//! the new winner; with no hit the key disappears.
//!
//! ## Locking
//! Each key is decided under its merged-store entry lock. The registry lock
//! and history locks are only ever taken inside it, never the other way
//! around, and the listener notification is queued before the entry lock is
//! released so notifications for one key keep acceptance order.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use errors::{ConfigError, ConfigResult};
use metrics::counter;
use parking_lot::RwLock;
use security::CipherRegistry;
use tracing::{debug, info};

use crate::event::{Event, EventType};
use crate::listener::{Dispatcher, ListenerRegistry};
use crate::settings::ManagerSettings;
use crate::source::{EventCallback, SourceContext, SourceFactory, Sourcer};
use crate::store::{HistoryStore, MergedStore};
use crate::value::{ConfigValue, SourceInfo, Value};

struct SourceEntry {
    name: String,
    priority: i32,
    factory: SourceFactory,
    live: Option<Arc<dyn Sourcer>>,
}

/// Registration state of a source, as reported by [`ConfigManager::sources`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub name: String,
    pub priority: i32,
    pub loaded: bool,
}

pub(crate) struct Inner {
    pub(crate) settings: ManagerSettings,
    pub(crate) ciphers: Arc<CipherRegistry>,
    pub(crate) merged: MergedStore,
    history: HistoryStore,
    sources: RwLock<Vec<SourceEntry>>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    dispatcher: Dispatcher,
    shut_down: AtomicBool,
}

/// Handle to a configuration manager. Cloning is cheap and every clone sees
/// the same key space.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Merges configuration from independently updating sources into one
/// queryable key space, keeping the highest priority contribution of every
/// key and falling back to the next one when it is deleted.
///
/// ## Usage
/// ```rust,no_run
/// use config::{ConfigManager, MemorySource, EnvSource};
///
/// let manager = ConfigManager::new();
/// manager.add_source("env", 0, EnvSource::factory(None))?;
/// manager.add_source("memory", 10, MemorySource::factory())?;
/// manager.load_all()?;
///
/// let host = manager.get_string("db.host", "localhost");
/// # Ok::<(), errors::ConfigError>(())
/// ```
#[derive(Clone)]
pub struct ConfigManager {
    pub(crate) inner: Arc<Inner>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::with_parts(ManagerSettings::default(), Arc::new(CipherRegistry::with_defaults()))
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        Self::with_parts(settings, Arc::new(CipherRegistry::with_defaults()))
    }

    /// Build with an existing cipher registry, shared with other components.
    pub fn with_parts(settings: ManagerSettings, ciphers: Arc<CipherRegistry>) -> Self {
        let listeners = Arc::new(ListenerRegistry::new());
        let dispatcher = Dispatcher::start(settings.notify_workers, Arc::clone(&listeners));
        Self {
            inner: Arc::new(Inner {
                settings,
                ciphers,
                merged: MergedStore::default(),
                history: HistoryStore::default(),
                sources: RwLock::new(Vec::new()),
                listeners,
                dispatcher,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    pub fn ciphers(&self) -> &Arc<CipherRegistry> {
        &self.inner.ciphers
    }

    /// Register a source. Names and priorities must both be unique.
    pub fn add_source(
        &self,
        name: impl Into<String>,
        priority: i32,
        factory: SourceFactory,
    ) -> ConfigResult<()> {
        let name = name.into();
        let mut sources = self.inner.sources.write();

        if sources.iter().any(|s| s.name == name) {
            return Err(ConfigError::DuplicateSourceName { name });
        }
        if let Some(existing) = sources.iter().find(|s| s.priority == priority) {
            return Err(ConfigError::DuplicatePriority {
                priority,
                existing: existing.name.clone(),
            });
        }

        let position = sources.partition_point(|s| s.priority < priority);
        info!("Registered config source {} with priority {}", name, priority);
        sources.insert(
            position,
            SourceEntry {
                name,
                priority,
                factory,
                live: None,
            },
        );
        Ok(())
    }

    /// Load every registered, not yet loaded source with a priority up to
    /// `threshold` (all of them when `threshold` is negative), lowest
    /// priority first.
    ///
    /// A failing factory aborts the pass; sources loaded before it stay
    /// loaded.
    pub fn load(&self, threshold: i32) -> ConfigResult<()> {
        while let Some((name, priority, factory)) = self.next_unloaded(threshold) {
            let context = SourceContext {
                name: &name,
                priority,
                callback: self.event_callback(),
                manager: self,
            };
            let source = factory(&context).map_err(|e| ConfigError::SourceInit {
                source_name: name.clone(),
                reason: e.to_string(),
            })?;

            let snapshot = source.get_all();
            let seeded = snapshot.len();
            for (key, value) in snapshot {
                self.inner.apply(Event::create(key, value));
            }

            let mut sources = self.inner.sources.write();
            if let Some(entry) = sources.iter_mut().find(|s| s.name == name) {
                entry.live = Some(source);
            }
            info!("Loaded config source {} ({} keys)", name, seeded);
        }
        Ok(())
    }

    pub fn load_all(&self) -> ConfigResult<()> {
        self.load(-1)
    }

    fn next_unloaded(&self, threshold: i32) -> Option<(String, i32, SourceFactory)> {
        self.inner
            .sources
            .read()
            .iter()
            .find(|s| s.live.is_none() && (threshold < 0 || s.priority <= threshold))
            .map(|s| (s.name.clone(), s.priority, Arc::clone(&s.factory)))
    }

    /// Callback handed to sources. It holds the manager weakly so a source
    /// outliving the manager just stops reporting.
    pub(crate) fn event_callback(&self) -> EventCallback {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.apply(event);
            }
        })
    }

    /// Feed an event through the precedence engine, as a source would.
    pub fn apply(&self, event: Event) {
        self.inner.apply(event);
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner
            .sources
            .read()
            .iter()
            .any(|s| s.name == name && s.live.is_some())
    }

    /// Registered sources in ascending priority.
    pub fn sources(&self) -> Vec<SourceStatus> {
        self.inner
            .sources
            .read()
            .iter()
            .map(|s| SourceStatus {
                name: s.name.clone(),
                priority: s.priority,
                loaded: s.live.is_some(),
            })
            .collect()
    }

    /// The live instance of a loaded source.
    pub fn source(&self, name: &str) -> Option<Arc<dyn Sourcer>> {
        self.inner
            .sources
            .read()
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.live.clone())
    }

    pub(crate) fn active_sources(&self) -> Vec<Arc<dyn Sourcer>> {
        self.inner
            .sources
            .read()
            .iter()
            .filter_map(|s| s.live.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.merged.keys()
    }

    /// Raw winning value of every key.
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, ConfigValue> {
        self.inner.merged.snapshot()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.merged.contains(key)
    }

    /// Name and priority of the source currently winning `key`.
    pub fn source_of(&self, key: &str) -> Option<SourceInfo> {
        self.inner.merged.get(key).map(|v| v.source().clone())
    }

    /// The winning value with its origin, without any read-side processing.
    pub fn raw_value(&self, key: &str) -> Option<Value> {
        self.inner.merged.get(key)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Disconnect every live source and stop listener delivery once queued
    /// notifications are drained. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for source in self.active_sources() {
            source.disconnect();
        }
        self.inner.dispatcher.shutdown();
        info!("Config manager shut down");
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("sources", &self.sources())
            .field("keys", &self.inner.merged.len())
            .finish()
    }
}

impl Inner {
    pub(crate) fn apply(&self, event: Event) {
        match event.kind {
            EventType::Create | EventType::Update => self.apply_update(event),
            EventType::Delete => self.apply_delete(&event),
        }
    }

    fn apply_update(&self, event: Event) {
        let Event { kind, key, value } = event;
        if key.is_empty() {
            discard("empty_key", kind, &key, &value);
            return;
        }

        let entry = self.merged.entry(&key);
        self.history.record(&key, value.clone());

        match entry {
            Entry::Vacant(vacant) => {
                vacant.insert(value.clone());
                self.accepted(Event::create(key, value));
            }
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let own_key = current.source().name() == value.source().name();
                if !own_key && value.priority() <= current.priority() {
                    discard("lower_priority", kind, &key, &value);
                    return;
                }
                if *current == value {
                    debug!("Config key {} unchanged", key);
                    return;
                }
                occupied.insert(value.clone());
                self.accepted(Event::update(key, value));
            }
        }
    }

    fn apply_delete(&self, event: &Event) {
        let source_name = event.source_name();

        if event.is_group_delete() {
            let Some(reference) = event.reference() else {
                return;
            };
            let touched = self.history.remove_ref(source_name, reference);
            debug!(
                "Removed group {} of source {} ({} keys)",
                reference,
                source_name,
                touched.len()
            );
            for key in self.merged.keys_from(source_name, Some(reference)) {
                self.fall_back(&key, &event.value, false);
            }
        } else if event.key.is_empty() {
            discard("empty_key", event.kind, &event.key, &event.value);
        } else {
            self.fall_back(&event.key, &event.value, true);
        }
    }

    /// Re-decide `key` after a contribution of `deleting`'s source went
    /// away.
    fn fall_back(&self, key: &str, deleting: &Value, remove_history: bool) {
        let entry = self.merged.entry(key);
        if remove_history {
            self.history
                .remove_keyed(deleting.source().name(), key, deleting.reference());
        }

        let Entry::Occupied(mut occupied) = entry else {
            discard("unknown_key", EventType::Delete, key, deleting);
            return;
        };
        if occupied.get().priority() > deleting.priority() {
            discard("stale_delete", EventType::Delete, key, deleting);
            return;
        }

        match self.highest_surviving(key) {
            Some(next) if next == *occupied.get() => {
                debug!("Config key {} keeps its value after delete", key);
            }
            Some(next) => {
                occupied.insert(next.clone());
                self.accepted(Event::update(key, next));
            }
            None => {
                let (key, removed) = occupied.remove_entry();
                self.accepted(Event {
                    kind: EventType::Delete,
                    key,
                    value: removed,
                });
            }
        }
    }

    /// Latest surviving contribution of the highest priority source that
    /// still has one.
    fn highest_surviving(&self, key: &str) -> Option<Value> {
        self.sources
            .read()
            .iter()
            .rev()
            .find_map(|s| self.history.latest(&s.name, key))
    }

    fn accepted(&self, event: Event) {
        debug!(
            "Applied {} of {} from {}",
            event.kind,
            event.key,
            event.value.source()
        );
        counter!("config_events_applied_total", "kind" => event.kind.to_string()).increment(1);
        if !self.listeners.is_empty() {
            self.dispatcher.dispatch(event);
        }
    }
}

fn discard(reason: &'static str, kind: EventType, key: &str, value: &Value) {
    debug!(
        "Discarded {} of {} from {}: {}",
        kind,
        key,
        value.source(),
        reason
    );
    counter!("config_events_discarded_total", "reason" => reason).increment(1);
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        for entry in self.sources.get_mut().iter() {
            if let Some(source) = &entry.live {
                source.disconnect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, source_factory};
    use errors::SourceError;
    use std::sync::mpsc;
    use std::time::Duration;

    fn info(name: &str, priority: i32) -> SourceInfo {
        SourceInfo::new(name, priority)
    }

    fn put(manager: &ConfigManager, key: &str, raw: &str, source: &SourceInfo) {
        manager.apply(Event::update(key, Value::new(raw, source.clone())));
    }

    fn remove(manager: &ConfigManager, key: &str, source: &SourceInfo) {
        manager.apply(Event::delete(key, source.clone(), None));
    }

    fn raw(manager: &ConfigManager, key: &str) -> Option<String> {
        manager.raw_value(key).map(|v| v.raw().to_string_lossy())
    }

    /// Manager with two registered (not loaded) sources so fallback scans
    /// see them.
    fn two_sources() -> (ConfigManager, SourceInfo, SourceInfo) {
        let manager = ConfigManager::new();
        manager.add_source("low", 1, MemorySource::factory()).unwrap();
        manager.add_source("high", 2, MemorySource::factory()).unwrap();
        (manager, info("low", 1), info("high", 2))
    }

    #[test]
    fn test_duplicate_registration() {
        let manager = ConfigManager::new();
        manager.add_source("a", 1, MemorySource::factory()).unwrap();

        let err = manager.add_source("a", 2, MemorySource::factory()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateSourceName { .. }));

        let err = manager.add_source("b", 1, MemorySource::factory()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicatePriority { priority: 1, .. }));
    }

    #[test]
    fn test_sources_sorted_by_priority() {
        let manager = ConfigManager::new();
        manager.add_source("c", 10, MemorySource::factory()).unwrap();
        manager.add_source("a", -5, MemorySource::factory()).unwrap();
        manager.add_source("b", 3, MemorySource::factory()).unwrap();

        let names: Vec<String> = manager.sources().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_precedence_regardless_of_order() {
        let (manager, low, high) = two_sources();
        put(&manager, "k", "high", &high);
        put(&manager, "k", "low", &low);
        assert_eq!(raw(&manager, "k").as_deref(), Some("high"));

        let (manager, low, high) = two_sources();
        put(&manager, "k", "low", &low);
        put(&manager, "k", "high", &high);
        assert_eq!(raw(&manager, "k").as_deref(), Some("high"));
    }

    #[test]
    fn test_self_overwrite() {
        let (manager, _low, high) = two_sources();
        put(&manager, "k", "1", &high);
        put(&manager, "k", "2", &high);
        assert_eq!(raw(&manager, "k").as_deref(), Some("2"));
    }

    #[test]
    fn test_fallback_on_delete() {
        let (manager, low, high) = two_sources();
        put(&manager, "k", "a", &low);
        put(&manager, "k", "b", &high);

        remove(&manager, "k", &high);
        assert_eq!(raw(&manager, "k").as_deref(), Some("a"));
        assert_eq!(manager.source_of("k"), Some(low.clone()));

        remove(&manager, "k", &low);
        assert_eq!(raw(&manager, "k"), None);
    }

    #[test]
    fn test_fallback_when_low_arrived_last() {
        let (manager, low, high) = two_sources();
        put(&manager, "k", "b", &high);
        put(&manager, "k", "a", &low);

        remove(&manager, "k", &high);
        assert_eq!(raw(&manager, "k").as_deref(), Some("a"));
    }

    #[test]
    fn test_stale_delete_is_ignored() {
        let (manager, low, high) = two_sources();
        put(&manager, "k", "a", &low);
        put(&manager, "k", "b", &high);

        remove(&manager, "k", &low);
        assert_eq!(raw(&manager, "k").as_deref(), Some("b"));

        // low's contribution is gone from its history
        remove(&manager, "k", &high);
        assert_eq!(raw(&manager, "k"), None);
    }

    #[test]
    fn test_ref_group_delete() {
        let manager = ConfigManager::new();
        manager.add_source("env", 0, MemorySource::factory()).unwrap();
        manager.add_source("file", 2, MemorySource::factory()).unwrap();
        let env = info("env", 0);
        let file = info("file", 2);

        put(&manager, "shared", "from-env", &env);
        for (key, raw) in [("shared", "x"), ("only.x", "1")] {
            manager.apply(Event::create(key, Value::new(raw, file.clone()).with_ref("x.yaml")));
        }
        manager.apply(Event::create(
            "only.y",
            Value::new("2", file.clone()).with_ref("y.yaml"),
        ));

        manager.apply(Event::delete_ref(file, "x.yaml"));

        assert_eq!(raw(&manager, "shared").as_deref(), Some("from-env"));
        assert_eq!(raw(&manager, "only.x"), None);
        assert_eq!(raw(&manager, "only.y").as_deref(), Some("2"));
    }

    #[test]
    fn test_delete_of_unknown_key_is_noop() {
        let (manager, low, _high) = two_sources();
        remove(&manager, "missing", &low);
        assert!(manager.keys().is_empty());
    }

    #[test]
    fn test_load_seeds_in_priority_order_and_is_idempotent() {
        let manager = ConfigManager::new();
        let mut low = crate::properties::FlatMap::new();
        low.insert("k".to_string(), ConfigValue::from("low"));
        let mut high = crate::properties::FlatMap::new();
        high.insert("k".to_string(), ConfigValue::from("high"));

        manager.add_source("high", 5, MemorySource::factory_with(high)).unwrap();
        manager.add_source("low", 1, MemorySource::factory_with(low)).unwrap();

        manager.load(1).unwrap();
        assert!(manager.is_loaded("low"));
        assert!(!manager.is_loaded("high"));
        assert_eq!(raw(&manager, "k").as_deref(), Some("low"));

        manager.load_all().unwrap();
        manager.load_all().unwrap();
        assert!(manager.is_loaded("high"));
        assert_eq!(raw(&manager, "k").as_deref(), Some("high"));
    }

    #[test]
    fn test_later_source_reads_earlier_during_load() {
        let manager = ConfigManager::new();
        let mut seed = crate::properties::FlatMap::new();
        seed.insert("region".to_string(), ConfigValue::from("eu"));

        manager
            .add_source(
                "endpoints",
                5,
                source_factory(|context| {
                    let region = context.manager().get_string("region", "unset");
                    let mut values = crate::properties::FlatMap::new();
                    values.insert(
                        "endpoint".to_string(),
                        ConfigValue::from(format!("https://{region}.example.com")),
                    );
                    Ok(Arc::new(MemorySource::with_values(context, values)) as Arc<dyn Sourcer>)
                }),
            )
            .unwrap();
        manager.add_source("seed", 1, MemorySource::factory_with(seed)).unwrap();

        manager.load_all().unwrap();
        assert_eq!(raw(&manager, "endpoint").as_deref(), Some("https://eu.example.com"));
        assert_eq!(manager.source_of("endpoint").unwrap().name(), "endpoints");
    }

    #[test]
    fn test_failing_factory_aborts_load() {
        let manager = ConfigManager::new();
        manager.add_source("ok", 1, MemorySource::factory()).unwrap();
        manager
            .add_source(
                "broken",
                2,
                source_factory(|_| {
                    Err(SourceError::Io {
                        path: "remote".to_string(),
                        reason: "connection refused".to_string(),
                    })
                }),
            )
            .unwrap();
        manager.add_source("after", 3, MemorySource::factory()).unwrap();

        let err = manager.load_all().unwrap_err();
        assert!(matches!(err, ConfigError::SourceInit { ref source_name, .. } if source_name == "broken"));
        assert!(manager.is_loaded("ok"));
        assert!(!manager.is_loaded("after"));
    }

    #[test]
    fn test_listener_sees_effective_changes_only() {
        let (manager, low, high) = two_sources();
        let (tx, rx) = mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        manager.listeners().watch(
            "k",
            Arc::new(move |e: &Event| {
                let _ = tx.lock().send((e.kind, e.value.raw().to_string_lossy()));
            }),
        );

        put(&manager, "k", "b", &high);
        put(&manager, "k", "a", &low); // discarded
        put(&manager, "k", "b", &high); // unchanged
        remove(&manager, "k", &high); // falls back to "a"

        let got: Vec<(EventType, String)> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(
            got,
            vec![
                (EventType::Create, "b".to_string()),
                (EventType::Update, "a".to_string())
            ]
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let manager = ConfigManager::new();
        manager.add_source("memory", 10, MemorySource::factory()).unwrap();
        manager.load_all().unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(manager.is_loaded("memory"));
    }
}
