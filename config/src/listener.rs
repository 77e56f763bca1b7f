//! # Listeners
//!
//! Exact-key and regex-pattern subscriptions, plus the worker pool that
//! delivers notifications off the write path.
//!
//! The writer only pushes events onto a channel. Each event is routed to the
//! worker owning the hash of its key, so one key's notifications are always
//! delivered by the same thread and in the order they were accepted.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use errors::ConfigError;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

use crate::event::Event;

/// A subscriber callback.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct PatternListener {
    id: String,
    regex: Regex,
    callback: Listener,
}

/// Registry of exact and pattern subscriptions.
#[derive(Default)]
pub struct ListenerRegistry {
    exact: DashMap<String, Vec<Listener>>,
    patterns: RwLock<Vec<PatternListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `key`. A callback that is the same `Arc` as
    /// one already subscribed to `key` is not added again.
    pub fn watch(&self, key: &str, callback: Listener) {
        let mut callbacks = self.exact.entry(key.to_string()).or_default();
        if !callbacks.iter().any(|existing| Arc::ptr_eq(existing, &callback)) {
            callbacks.push(callback);
        }
    }

    /// Subscribe to every key matching `pattern`. The pattern is compiled
    /// here, so a bad expression is rejected up front.
    pub fn watch_pattern(&self, pattern: &str, callback: Listener) -> Result<(), ConfigError> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.patterns.write().push(PatternListener {
            id: pattern.to_string(),
            regex,
            callback,
        });
        Ok(())
    }

    /// Drop every subscription registered under `key`, exact or pattern.
    /// Returns how many callbacks were removed.
    pub fn unwatch(&self, key: &str) -> usize {
        let exact = self.exact.remove(key).map_or(0, |(_, callbacks)| callbacks.len());

        let mut patterns = self.patterns.write();
        let before = patterns.len();
        patterns.retain(|p| p.id != key);
        exact + (before - patterns.len())
    }

    /// Callbacks interested in `key`: exact subscribers first, then matching
    /// patterns in registration order.
    pub fn matching(&self, key: &str) -> Vec<Listener> {
        let mut callbacks = self
            .exact
            .get(key)
            .map(|callbacks| callbacks.clone())
            .unwrap_or_default();

        callbacks.extend(
            self.patterns
                .read()
                .iter()
                .filter(|p| p.regex.is_match(key))
                .map(|p| Arc::clone(&p.callback)),
        );
        callbacks
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.read().is_empty()
    }

    /// Invoke every matching callback. A panicking callback is logged and
    /// skipped.
    pub fn notify(&self, event: &Event) {
        for callback in self.matching(&event.key) {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(
                    "Config listener panicked while handling {} of key {}",
                    event.kind, event.key
                );
                counter!("config_listener_failures_total").increment(1);
            }
        }
    }
}

/// Fixed pool of notification threads.
///
/// Each worker owns a tokio unbounded mpsc queue, the channel the workspace
/// already uses for event fan-out. Sending never blocks and needs no
/// runtime, so a writer can enqueue from any thread. Workers are
/// plain std threads draining their queue with `blocking_recv`, which keeps
/// listeners independent of whether the embedding program runs tokio at all.
/// `blocking_recv` panics inside an async context; that cannot happen here
/// because the workers never enter one.
pub(crate) struct Dispatcher {
    senders: RwLock<Vec<UnboundedSender<Event>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn start(worker_count: usize, registry: Arc<ListenerRegistry>) -> Self {
        let worker_count = worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = unbounded_channel();
            let registry = Arc::clone(&registry);
            let spawned = thread::Builder::new()
                .name(format!("config-notify-{}", index))
                .spawn(move || run_worker(rx, &registry));
            match spawned {
                Ok(handle) => {
                    senders.push(tx);
                    workers.push(handle);
                }
                Err(e) => warn!("Failed to spawn config notify worker {}: {}", index, e),
            }
        }

        Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
        }
    }

    /// Queue `event` for delivery. Never blocks on subscribers.
    pub(crate) fn dispatch(&self, event: Event) {
        let senders = self.senders.read();
        if senders.is_empty() {
            debug!("Dispatcher stopped, dropping notification for {}", event.key);
            return;
        }
        let shard = shard_for(&event.key, senders.len());
        if senders[shard].send(event).is_err() {
            debug!("Notify worker {} is gone", shard);
        }
    }

    /// Close the queues and wait for pending notifications to drain.
    pub(crate) fn shutdown(&self) {
        self.senders.write().clear();

        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            // A listener may drop the last manager handle from inside a worker.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("Config notify worker exited abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.senders.get_mut().clear();
    }
}

fn run_worker(mut rx: UnboundedReceiver<Event>, registry: &ListenerRegistry) {
    while let Some(event) = rx.blocking_recv() {
        registry.notify(&event);
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
