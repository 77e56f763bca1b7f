//! # Sources
//!
//! A source is a pluggable provider of flat key/value pairs with a static
//! priority. The manager instantiates each registered source through its
//! factory, seeds the key space from `get_all()`, and from then on the source
//! pushes every change through the `EventCallback` it was handed.
//!
//! Built-in sources:
//! - [`EnvSource`]: process environment (priority 0)
//! - [`FileSource`]: YAML/JSON/TOML/properties files, optionally watched (priority 2)
//! - [`MemorySource`]: programmatic overrides (priority 10)

use std::collections::BTreeMap;
use std::sync::Arc;

use errors::SourceError;

use crate::event::Event;
use crate::manager::ConfigManager;
use crate::value::{ConfigValue, SourceInfo, Value};

mod env;
mod file;
mod memory;

pub use env::EnvSource;
pub use file::FileSource;
pub use memory::MemorySource;

pub const ENV_SOURCE_NAME: &str = "env";
pub const ENV_SOURCE_PRIORITY: i32 = 0;
pub const FILE_SOURCE_NAME: &str = "file";
pub const FILE_SOURCE_PRIORITY: i32 = 2;
pub const MEMORY_SOURCE_NAME: &str = "memory";
pub const MEMORY_SOURCE_PRIORITY: i32 = 10;

/// Channel through which a live source reports changes to the manager.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Builds a live source at load time.
pub type SourceFactory =
    Arc<dyn Fn(&SourceContext<'_>) -> Result<Arc<dyn Sourcer>, SourceError> + Send + Sync>;

/// Wrap a closure as a [`SourceFactory`].
pub fn source_factory<F>(factory: F) -> SourceFactory
where
    F: Fn(&SourceContext<'_>) -> Result<Arc<dyn Sourcer>, SourceError> + Send + Sync + 'static,
{
    Arc::new(factory)
}

/// Contract implemented by every source plugin.
pub trait Sourcer: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    /// Full snapshot, read once when the source is loaded.
    fn get_all(&self) -> BTreeMap<String, Value>;

    /// Write a value back. The source reports the resulting change through
    /// its callback.
    fn set(&self, key: &str, value: ConfigValue) -> Result<(), SourceError>;

    /// Remove a key. Read-only sources ignore it.
    fn delete(&self, _key: &str) -> Result<(), SourceError> {
        Ok(())
    }

    /// Release any watch or connection. Safe to call more than once.
    fn disconnect(&self);
}

/// Everything a factory needs to build its source.
pub struct SourceContext<'a> {
    pub(crate) name: &'a str,
    pub(crate) priority: i32,
    pub(crate) callback: EventCallback,
    pub(crate) manager: &'a ConfigManager,
}

impl<'a> SourceContext<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo::new(self.name, self.priority)
    }

    pub fn callback(&self) -> EventCallback {
        Arc::clone(&self.callback)
    }

    /// The manager loading this source. Sources loaded earlier are already
    /// visible, so a factory can read its own settings from them.
    pub fn manager(&self) -> &'a ConfigManager {
        self.manager
    }
}
