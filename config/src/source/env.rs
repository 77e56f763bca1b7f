//! # Environment Source
//!
//! Exposes the process environment as configuration, following 12-factor app
//! principles.
//!
//! Every variable appears twice:
//! - under its own name (`DB_HOST`)
//! - under a dotted lower-case alias (`db.host`), so it can shadow or be
//!   shadowed by file keys of the same shape
//!
//! With a prefix (`APP_`), only matching variables are read and the prefix is
//! stripped first: `APP_DB_HOST` → `DB_HOST` and `db.host`.
//!
//! `set` writes to an in-process overlay; the process environment itself is
//! never mutated. Deleting a captured key restores the captured value.

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use errors::SourceError;
use tracing::debug;

use super::{MemorySource, SourceContext, SourceFactory, Sourcer, source_factory};
use crate::properties::FlatMap;
use crate::value::{ConfigValue, Value};

pub struct EnvSource {
    values: MemorySource,
    prefix: Option<String>,
}

impl EnvSource {
    /// Snapshot the current process environment.
    pub fn new(context: &SourceContext<'_>, prefix: Option<String>) -> Self {
        Self::from_vars(context, prefix, env::vars())
    }

    /// Build from an explicit variable list instead of the process
    /// environment.
    pub fn from_vars(
        context: &SourceContext<'_>,
        prefix: Option<String>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let values = collect_vars(prefix.as_deref(), vars);
        debug!(
            "Environment source {} captured {} keys",
            context.name(),
            values.len()
        );
        Self {
            values: MemorySource::overlay(context, values),
            prefix,
        }
    }

    pub fn factory(prefix: Option<String>) -> SourceFactory {
        source_factory(move |context| Ok(Arc::new(Self::new(context, prefix.clone())) as Arc<dyn Sourcer>))
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

/// `DB_HOST` → `db.host`. Returns `None` when the alias would equal the name.
pub fn alias_for(name: &str) -> Option<String> {
    let alias: String = name
        .split('_')
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(".");
    (!alias.is_empty() && alias != name).then_some(alias)
}

fn collect_vars(prefix: Option<&str>, vars: impl IntoIterator<Item = (String, String)>) -> FlatMap {
    let mut raw = FlatMap::new();
    let mut aliases = FlatMap::new();

    for (name, value) in vars {
        let name = match prefix {
            Some(prefix) => match name.strip_prefix(prefix) {
                Some(stripped) if !stripped.is_empty() => stripped.to_string(),
                _ => continue,
            },
            None => name,
        };
        if let Some(alias) = alias_for(&name) {
            aliases.insert(alias, ConfigValue::String(value.clone()));
        }
        raw.insert(name, ConfigValue::String(value));
    }

    // A real variable wins over another variable's alias.
    for (alias, value) in aliases {
        raw.entry(alias).or_insert(value);
    }
    raw
}

impl Sourcer for EnvSource {
    fn name(&self) -> &str {
        self.values.name()
    }

    fn priority(&self) -> i32 {
        self.values.priority()
    }

    fn get_all(&self) -> BTreeMap<String, Value> {
        self.values.get_all()
    }

    fn set(&self, key: &str, value: ConfigValue) -> Result<(), SourceError> {
        self.values.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), SourceError> {
        self.values.delete(key)
    }

    fn disconnect(&self) {}
}
