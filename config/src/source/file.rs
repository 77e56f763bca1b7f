//! # File Source
//!
//! Loads YAML, JSON, TOML and `.properties` files into the flat key space.
//! Every value is tagged with its file path as `Ref`, so removing a file
//! removes exactly the keys it contributed.
//!
//! Files listed later win over earlier ones for the same key.
//!
//! ## Watching
//! With watching enabled, the parent directory of every file is observed with
//! `notify`. A changed file is re-read and diffed against what was loaded
//! before:
//! - new or changed keys are reported as Create/Update
//! - vanished keys are reported as Delete, after any value an earlier file
//!   still provides for that key has been re-reported
//!
//! A removed file is reported as a single `Ref` delete. A file that fails to
//! parse keeps its previous contents.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use errors::SourceError;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{EventCallback, SourceContext, SourceFactory, Sourcer, source_factory};
use crate::event::Event;
use crate::properties::{FlatMap, load_file};
use crate::value::{ConfigValue, SourceInfo, Value};

struct TrackedFile {
    path: PathBuf,
    canonical: PathBuf,
    reference: String,
    values: FlatMap,
}

struct FileState {
    info: SourceInfo,
    callback: EventCallback,
    files: Vec<TrackedFile>,
    closed: bool,
}

pub struct FileSource {
    state: Arc<Mutex<FileState>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    info: SourceInfo,
}

impl FileSource {
    /// Load `paths` in order. Every file must exist and parse.
    pub fn new(context: &SourceContext<'_>, paths: &[PathBuf], watch: bool) -> Result<Self, SourceError> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(track(path)?);
            info!("Loaded config file: {}", path.display());
        }

        let source = Self {
            state: Arc::new(Mutex::new(FileState {
                info: context.info(),
                callback: context.callback(),
                files,
                closed: false,
            })),
            watcher: Mutex::new(None),
            info: context.info(),
        };

        if watch {
            source.start_watching()?;
        }
        Ok(source)
    }

    pub fn factory(paths: Vec<PathBuf>, watch: bool) -> SourceFactory {
        source_factory(move |context| Ok(Arc::new(Self::new(context, &paths, watch)?) as Arc<dyn Sourcer>))
    }

    /// Add a file after load. It wins over every file already present.
    pub fn add_file(&self, path: &Path) -> Result<(), SourceError> {
        let tracked = track(path)?;
        let parent = watch_dir(&tracked.canonical);

        let mut state = self.state.lock();
        if state.files.iter().any(|f| f.canonical == tracked.canonical) {
            debug!("Config file already tracked: {}", path.display());
            return Ok(());
        }
        let index = state.files.len();
        let values = tracked.values.clone();
        state.files.push(TrackedFile {
            values: FlatMap::new(),
            ..tracked
        });
        state.apply_contents(index, values);
        drop(state);

        if let (Some(watcher), Some(parent)) = (self.watcher.lock().as_mut(), parent) {
            watcher
                .watch(&parent, RecursiveMode::NonRecursive)
                .map_err(|e| SourceError::Watch {
                    path: parent.display().to_string(),
                    reason: e.to_string(),
                })?;
        }
        info!("Added config file: {}", path.display());
        Ok(())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.state.lock().files.iter().map(|f| f.path.clone()).collect()
    }

    fn start_watching(&self) -> Result<(), SourceError> {
        let state = Arc::clone(&self.state);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        state.lock().handle_paths(&event.paths);
                    } else {
                        debug!("Ignoring event: {:?}", event.kind);
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            notify::Config::default(),
        )
        .map_err(|e| SourceError::Watch {
            path: String::new(),
            reason: e.to_string(),
        })?;

        let mut dirs: Vec<PathBuf> = self
            .state
            .lock()
            .files
            .iter()
            .filter_map(|f| watch_dir(&f.canonical))
            .collect();
        dirs.sort();
        dirs.dedup();

        for dir in dirs {
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    error!("Failed to watch config directory {}: {}", dir.display(), e);
                    SourceError::Watch {
                        path: dir.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
            info!("Watching config directory: {}", dir.display());
        }

        *self.watcher.lock() = Some(watcher);
        Ok(())
    }
}

fn track(path: &Path) -> Result<TrackedFile, SourceError> {
    let values = load_file(path)?;
    let canonical = fs::canonicalize(path).map_err(|e| SourceError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(TrackedFile {
        path: path.to_path_buf(),
        canonical,
        reference: path.display().to_string(),
        values,
    })
}

fn watch_dir(canonical: &Path) -> Option<PathBuf> {
    canonical.parent().map(Path::to_path_buf)
}

impl FileState {
    fn handle_paths(&mut self, paths: &[PathBuf]) {
        if self.closed {
            return;
        }
        for path in paths {
            let Some(index) = self.files.iter().position(|f| &f.canonical == path) else {
                continue;
            };
            if path.exists() {
                match load_file(path) {
                    Ok(values) => {
                        info!("Config file updated: {}", path.display());
                        self.apply_contents(index, values);
                    }
                    Err(e) => error!("Failed to reload config file {}: {}", path.display(), e),
                }
            } else if !self.files[index].values.is_empty() {
                warn!("Config file removed: {}", path.display());
                self.apply_removal(index);
            }
        }
    }

    /// True when a file after `index` provides `key`.
    fn shadowed(&self, index: usize, key: &str) -> bool {
        self.files[index + 1..].iter().any(|f| f.values.contains_key(key))
    }

    /// The value an earlier file provides for `key`, if any.
    fn fallback(&self, index: usize, key: &str) -> Option<Value> {
        self.files[..index].iter().rev().find_map(|f| {
            f.values
                .get(key)
                .map(|raw| self.value(raw.clone(), &f.reference))
        })
    }

    fn value(&self, raw: ConfigValue, reference: &str) -> Value {
        Value::new(raw, self.info.clone()).with_ref(reference)
    }

    fn emit(&self, event: Event) {
        (self.callback)(event);
    }

    fn apply_contents(&mut self, index: usize, values: FlatMap) {
        let previous = std::mem::replace(&mut self.files[index].values, values);
        let reference = self.files[index].reference.clone();

        for (key, raw) in &self.files[index].values {
            if previous.get(key) == Some(raw) || self.shadowed(index, key) {
                continue;
            }
            let value = self.value(raw.clone(), &reference);
            if previous.contains_key(key) || self.fallback(index, key).is_some() {
                self.emit(Event::update(key.clone(), value));
            } else {
                self.emit(Event::create(key.clone(), value));
            }
        }

        for key in previous.keys() {
            if self.files[index].values.contains_key(key) || self.shadowed(index, key) {
                continue;
            }
            if let Some(fallback) = self.fallback(index, key) {
                self.emit(Event::update(key.clone(), fallback));
            }
            self.emit(Event::delete(
                key.clone(),
                self.info.clone(),
                Some(reference.clone()),
            ));
        }
    }

    fn apply_removal(&mut self, index: usize) {
        let previous = std::mem::take(&mut self.files[index].values);
        let reference = self.files[index].reference.clone();

        for key in previous.keys() {
            if self.shadowed(index, key) {
                continue;
            }
            if let Some(fallback) = self.fallback(index, key) {
                self.emit(Event::update(key.clone(), fallback));
            }
        }
        self.emit(Event::delete_ref(self.info.clone(), reference));
    }
}

impl Sourcer for FileSource {
    fn name(&self) -> &str {
        self.info.name()
    }

    fn priority(&self) -> i32 {
        self.info.priority()
    }

    fn get_all(&self) -> BTreeMap<String, Value> {
        let state = self.state.lock();
        let mut all = BTreeMap::new();
        for file in &state.files {
            for (key, raw) in &file.values {
                all.insert(key.clone(), state.value(raw.clone(), &file.reference));
            }
        }
        all
    }

    fn set(&self, _key: &str, _value: ConfigValue) -> Result<(), SourceError> {
        Err(SourceError::ReadOnly {
            source_name: self.info.name().to_string(),
        })
    }

    fn delete(&self, _key: &str) -> Result<(), SourceError> {
        Err(SourceError::ReadOnly {
            source_name: self.info.name().to_string(),
        })
    }

    fn disconnect(&self) {
        self.state.lock().closed = true;
        if self.watcher.lock().take().is_some() {
            debug!("Stopped watching config files for {}", self.info.name());
        }
    }
}
