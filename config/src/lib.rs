//! # Dynamic Configuration
//!
//! Runtime configuration merged from several prioritized sources.
//!
//! This crate provides:
//! - A precedence engine: the highest-priority source wins, a deleted value
//!   falls back to the next source still holding the key
//! - Source plugins for environment variables, files (with hot reload) and
//!   in-memory overrides
//! - Exact-key and regex listeners, delivered off the write path in
//!   per-key order
//! - Typed getters with key chains, `${key}` substitution and transparent
//!   decryption of `encrypted_<cipher>_...` values
//! - Prefix reads and serde binding of whole subtrees
//! - Flatten/unflatten between nested documents and dotted keys
//!
//! # Usage
//!
//! ```rust,no_run
//! use config::{BootstrapOptions, ManagerSettings, SetOptions, bootstrap};
//!
//! let manager = bootstrap::init(BootstrapOptions::new(ManagerSettings::from_env()?))?;
//! manager.watch("db.host", |event| println!("db.host changed: {}", event.kind));
//! manager.set("db.host", "replica", &SetOptions::default())?;
//! let port = manager.get_int("db.port", 5432);
//! # Ok::<(), errors::ConfigError>(())
//! ```

pub mod api;
pub mod bootstrap;
pub mod event;
pub mod listener;
pub mod manager;
pub mod options;
pub mod properties;
pub mod settings;
pub mod source;
mod store;
pub mod value;

pub use api::{ENCRYPTED_PREFIX, reference_target, split_encrypted};
pub use bootstrap::{BootstrapOptions, SecurityHook};
pub use errors::{ConfigError, ConfigResult, SourceError};
pub use event::{Event, EventType};
pub use listener::{Listener, ListenerRegistry};
pub use manager::{ConfigManager, SourceStatus};
pub use options::{GetOptions, SetOptions, UnmarshalFormat};
pub use properties::{FlatMap, Format, flatten, unflatten};
pub use settings::ManagerSettings;
pub use source::{EnvSource, EventCallback, FileSource, MemorySource, SourceContext, SourceFactory, Sourcer, source_factory};
pub use value::{ConfigValue, FromConfigValue, SourceInfo, Value};
