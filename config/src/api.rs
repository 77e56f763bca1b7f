//! # Read/Write API
//!
//! Every getter goes through one resolution path:
//!
//! 1. key chain: alternates are tried last to first, then the primary key
//! 2. manual decrypt with the cipher named in the options
//! 3. `${other.key}` substitution, resolved through this same path
//! 4. automatic decrypt of `encrypted_<cipher>_<tag>:<payload>` strings
//!
//! Typed getters never fail: absence and cast failure both yield the caller's
//! default. Writes are delegated to the sources, which report the resulting
//! change back through their callbacks.

use std::collections::BTreeMap;
use std::fmt;
use std::iter;
use std::sync::Arc;
use std::time::Duration;

use errors::{ConfigError, ConfigResult, SourceError};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::event::Event;
use crate::manager::ConfigManager;
use crate::options::{GetOptions, SetOptions, UnmarshalFormat};
use crate::properties::unflatten;
use crate::source::Sourcer;
use crate::value::{ConfigValue, FromConfigValue, Value};

/// Marks a value that is decrypted on read.
pub const ENCRYPTED_PREFIX: &str = "encrypted_";

/// Tag written between cipher name and payload by [`ConfigManager::set`].
const ENCRYPTED_TAG: &str = "value";

/// The key referenced by a value that is exactly one `${key}` placeholder.
pub fn reference_target(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.is_empty() && !inner.contains("${") && !inner.contains('}')).then_some(inner)
}

/// Split `encrypted_<cipher>_<tag>:<payload>` into cipher and payload.
pub fn split_encrypted(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix(ENCRYPTED_PREFIX)?;
    let (cipher, tail) = rest.split_once('_')?;
    let (_, payload) = tail.split_once(':')?;
    (!cipher.is_empty()).then_some((cipher, payload))
}

impl ConfigManager {
    /// Resolve `key` and run the value pipeline. With a `watch` option the
    /// listener is subscribed to `key` after the read.
    pub fn get(&self, key: &str, options: &GetOptions) -> Option<ConfigValue> {
        let resolved = self.resolve(key, options, 0);
        if let Some(listener) = &options.watch {
            self.inner.listeners.watch(key, Arc::clone(listener));
        }
        resolved
    }

    /// Typed read with explicit options.
    pub fn get_as<T: FromConfigValue>(&self, key: &str, default: T, options: &GetOptions) -> T {
        let delimiter = self.list_delimiter(options);
        self.get(key, options)
            .and_then(|value| T::from_config_value(&value, delimiter))
            .unwrap_or(default)
    }

    /// List read. A value at `key` itself is split on the delimiter;
    /// otherwise the flattened `key[0]`, `key[1]`, ... entries are collected,
    /// stopping at the first gap. Each element goes through the value
    /// pipeline. Any element that fails to convert yields `default`.
    pub fn get_list<T: FromConfigValue>(&self, key: &str, default: Vec<T>, options: &GetOptions) -> Vec<T> {
        let delimiter = self.list_delimiter(options);
        if let Some(value) = self.get(key, options) {
            return Vec::<T>::from_config_value(&value, delimiter).unwrap_or(default);
        }

        let element = options.for_element();
        let Some(base) = options
            .key_chain
            .iter()
            .rev()
            .map(String::as_str)
            .chain(iter::once(key))
            .find(|candidate| self.inner.merged.contains(&format!("{candidate}[0]")))
        else {
            return default;
        };

        let mut items = Vec::new();
        for index in 0.. {
            let Some(value) = self.resolve(&format!("{base}[{index}]"), &element, 0) else {
                break;
            };
            match T::from_config_value(&value, delimiter) {
                Some(item) => items.push(item),
                None => return default,
            }
        }
        items
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_as(key, default.to_string(), &GetOptions::default())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_as(key, default, &GetOptions::default())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_as(key, default, &GetOptions::default())
    }

    pub fn get_float64(&self, key: &str, default: f64) -> f64 {
        self.get_as(key, default, &GetOptions::default())
    }

    pub fn get_duration(&self, key: &str, default: Duration) -> Duration {
        self.get_as(key, default, &GetOptions::default())
    }

    /// List of strings; a string value is split on the list delimiter.
    pub fn get_strings(&self, key: &str, default: &[&str]) -> Vec<String> {
        let default = default.iter().map(|s| (*s).to_string()).collect();
        self.get_list(key, default, &GetOptions::default())
    }

    pub fn get_ints(&self, key: &str, default: &[i64]) -> Vec<i64> {
        self.get_list(key, default.to_vec(), &GetOptions::default())
    }

    /// Every live key under `prefix`, with `prefix.` stripped. Children of a
    /// list prefix keep their index (`[0].host`).
    ///
    /// When the value stored at `prefix` itself is a `${other}` reference,
    /// the subtree of `other` is returned instead.
    pub fn get_with_prefix(&self, prefix: &str, options: &GetOptions) -> BTreeMap<String, ConfigValue> {
        let prefix = self.effective_prefix(prefix);
        let mut out = BTreeMap::new();

        for (key, raw) in self.inner.merged.scan_prefix(&prefix) {
            let child = if prefix.is_empty() {
                key.as_str()
            } else {
                let rest = &key[prefix.len()..];
                if let Some(field) = rest.strip_prefix('.') {
                    field
                } else if rest.starts_with('[') {
                    rest
                } else {
                    continue;
                }
            };
            if child.is_empty() {
                continue;
            }
            out.insert(child.to_string(), self.post_process(raw, options, 0));
        }
        out
    }

    /// Rebuild the subtree under `prefix` and deserialize it into `T`.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// Binds a configuration subtree to a typed struct. The flat keys are
    /// unflattened, encoded as JSON (default) or YAML and decoded with serde.
    ///
    /// ## Usage
    /// ```rust,no_run
    /// use config::{ConfigManager, GetOptions};
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Database {
    ///     host: String,
    ///     replicas: Vec<String>,
    /// }
    ///
    /// let manager = ConfigManager::new();
    /// let db: Database = manager.get_with_unmarshal("db", &GetOptions::default())?;
    /// # Ok::<(), errors::ConfigError>(())
    /// ```
    pub fn get_with_unmarshal<T: DeserializeOwned>(&self, prefix: &str, options: &GetOptions) -> ConfigResult<T> {
        let tree = unflatten(&self.get_with_prefix(prefix, options));
        let unmarshal_error = |reason: String| ConfigError::Unmarshal {
            prefix: prefix.to_string(),
            reason,
        };

        match options.format {
            UnmarshalFormat::Json => {
                let bytes = serde_json::to_vec(&tree).map_err(|e| unmarshal_error(e.to_string()))?;
                serde_json::from_slice(&bytes).map_err(|e| unmarshal_error(e.to_string()))
            }
            UnmarshalFormat::Yaml => {
                let text = serde_yaml::to_string(&tree).map_err(|e| unmarshal_error(e.to_string()))?;
                serde_yaml::from_str(&text).map_err(|e| unmarshal_error(e.to_string()))
            }
        }
    }

    /// Like [`get_with_unmarshal`](Self::get_with_unmarshal) with a caller
    /// supplied decoder for the rebuilt tree.
    pub fn get_with_unmarshal_fn<T, E, F>(&self, prefix: &str, options: &GetOptions, decode: F) -> ConfigResult<T>
    where
        F: FnOnce(&ConfigValue) -> Result<T, E>,
        E: fmt::Display,
    {
        let tree = unflatten(&self.get_with_prefix(prefix, options));
        decode(&tree).map_err(|e| ConfigError::Unmarshal {
            prefix: prefix.to_string(),
            reason: e.to_string(),
        })
    }

    /// Write `value` through the selected sources (all loaded sources by
    /// default), encrypting it first when a cipher is given.
    ///
    /// The key space only changes once a source reports the write back.
    pub fn set(&self, key: &str, value: impl Into<ConfigValue>, options: &SetOptions) -> ConfigResult<()> {
        let mut value = value.into();
        if let Some(cipher) = &options.cipher {
            value = ConfigValue::String(self.encrypt(cipher, &value)?);
        }
        self.write_through(options, |source| source.set(key, value.clone()))
    }

    /// Remove `key` from the selected sources (all loaded sources by
    /// default).
    pub fn delete(&self, key: &str, options: &SetOptions) -> ConfigResult<()> {
        self.write_through(options, |source| source.delete(key))
    }

    pub fn watch(&self, key: &str, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.inner.listeners.watch(key, Arc::new(listener));
    }

    /// Subscribe to every key matching the regex `pattern`.
    pub fn watch_pattern(&self, pattern: &str, listener: impl Fn(&Event) + Send + Sync + 'static) -> ConfigResult<()> {
        self.inner.listeners.watch_pattern(pattern, Arc::new(listener))
    }

    /// Remove exact and pattern subscriptions registered under `key`.
    pub fn unwatch(&self, key: &str) -> usize {
        self.inner.listeners.unwatch(key)
    }

    fn list_delimiter<'a>(&'a self, options: &'a GetOptions) -> &'a str {
        options
            .delimiter
            .as_deref()
            .unwrap_or(&self.inner.settings.list_delimiter)
    }

    fn resolve(&self, key: &str, options: &GetOptions, depth: usize) -> Option<ConfigValue> {
        let raw = options
            .key_chain
            .iter()
            .rev()
            .map(String::as_str)
            .chain(iter::once(key))
            .find_map(|candidate| self.inner.merged.get(candidate))
            .map(Value::into_raw)?;
        Some(self.post_process(raw, options, depth))
    }

    fn post_process(&self, raw: ConfigValue, options: &GetOptions, depth: usize) -> ConfigValue {
        let ConfigValue::String(mut text) = raw else {
            return raw;
        };

        if let Some(cipher) = &options.cipher {
            match self.inner.ciphers.decrypt(cipher, &text) {
                Ok(plain) => text = plain,
                Err(e) => warn!("Failed to decrypt value with cipher {}: {}", cipher, e),
            }
        }

        let value = self.substitute(text, options, depth);

        let auto_decrypt = self.inner.settings.auto_decrypt && !options.disable_auto_decrypt;
        match value {
            ConfigValue::String(text) if auto_decrypt => {
                let decrypted = split_encrypted(&text).and_then(|(cipher, payload)| {
                    self.inner
                        .ciphers
                        .decrypt(cipher, payload)
                        .map_err(|e| warn!("Failed to decrypt value with cipher {}: {}", cipher, e))
                        .ok()
                });
                ConfigValue::String(decrypted.unwrap_or(text))
            }
            other => other,
        }
    }

    /// Expand `${key}` placeholders. A value that is a single placeholder
    /// takes the referenced value as is; otherwise each placeholder is
    /// replaced by the referenced value rendered as a string, or nothing when
    /// the key is missing. Replaced text is not scanned again.
    fn substitute(&self, text: String, options: &GetOptions, depth: usize) -> ConfigValue {
        if !text.contains("${") {
            return ConfigValue::String(text);
        }
        if depth >= self.inner.settings.max_substitution_depth {
            warn!("Reference nesting deeper than {} in {}, leaving it unexpanded", depth, text);
            return ConfigValue::String(text);
        }

        let nested = options.for_reference();
        if let Some(target) = reference_target(&text) {
            return self
                .resolve(target, &nested, depth + 1)
                .unwrap_or_else(|| ConfigValue::String(String::new()));
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text.as_str();
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let target = &after[..end];
            if target.is_empty() {
                out.push_str("${}");
            } else if let Some(resolved) = self.resolve(target, &nested, depth + 1) {
                out.push_str(&resolved.to_string_lossy());
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        ConfigValue::String(out)
    }

    fn effective_prefix(&self, prefix: &str) -> String {
        let mut current = prefix.to_string();
        for _ in 0..self.inner.settings.max_substitution_depth {
            let target = match self.inner.merged.get(&current).map(Value::into_raw) {
                Some(ConfigValue::String(text)) => reference_target(&text).map(str::to_string),
                _ => None,
            };
            match target {
                Some(target) => {
                    debug!("Prefix {} redirected to {}", current, target);
                    current = target;
                }
                None => break,
            }
        }
        current
    }

    fn encrypt(&self, cipher: &str, value: &ConfigValue) -> ConfigResult<String> {
        if cipher.is_empty() || cipher.contains(['_', ':']) {
            return Err(ConfigError::Encrypt {
                cipher: cipher.to_string(),
                reason: "cipher name must be non-empty without '_' or ':'".to_string(),
            });
        }
        let payload = self
            .inner
            .ciphers
            .encrypt(cipher, &value.to_string_lossy())
            .map_err(|e| {
                warn!("Failed to encrypt value with cipher {}: {}", cipher, e);
                ConfigError::Encrypt {
                    cipher: cipher.to_string(),
                    reason: e.to_string(),
                }
            })?;
        Ok(format!("{ENCRYPTED_PREFIX}{cipher}_{ENCRYPTED_TAG}:{payload}"))
    }

    fn write_through<F>(&self, options: &SetOptions, write: F) -> ConfigResult<()>
    where
        F: Fn(&dyn Sourcer) -> Result<(), SourceError>,
    {
        if !options.sources.is_empty() {
            for name in &options.sources {
                let source = self
                    .source(name)
                    .ok_or_else(|| ConfigError::UnknownSource { name: name.clone() })?;
                write(source.as_ref()).map_err(|e| ConfigError::SourceWrite {
                    source_name: name.clone(),
                    reason: e.to_string(),
                })?;
            }
            return Ok(());
        }

        let mut written = 0;
        for source in self.active_sources() {
            match write(source.as_ref()) {
                Ok(()) => written += 1,
                Err(SourceError::ReadOnly { source_name }) => {
                    debug!("Skipping read-only source {}", source_name);
                }
                Err(e) => {
                    return Err(ConfigError::SourceWrite {
                        source_name: source.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if written == 0 {
            return Err(ConfigError::NoActiveSources);
        }
        Ok(())
    }
}
