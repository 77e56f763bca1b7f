//! Per-call options for reads and writes.

use std::fmt;
use std::sync::Arc;

use crate::event::Event;
use crate::listener::Listener;

/// Intermediate format used by `get_with_unmarshal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnmarshalFormat {
    #[default]
    Json,
    Yaml,
}

/// Options for a single read.
///
/// ```rust,no_run
/// use config::GetOptions;
///
/// let options = GetOptions::new()
///     .key_chain(["db.primary.host", "DB_HOST"])
///     .delimiter(";");
/// ```
#[derive(Clone, Default)]
pub struct GetOptions {
    pub(crate) key_chain: Vec<String>,
    pub(crate) watch: Option<Listener>,
    pub(crate) cipher: Option<String>,
    pub(crate) disable_auto_decrypt: bool,
    pub(crate) delimiter: Option<String>,
    pub(crate) format: UnmarshalFormat,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alternate keys. They are tried last to first, then the primary key.
    pub fn key_chain<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_chain = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Subscribe to the primary key as part of the read.
    ///
    /// The listener is registered once: reusing these options for repeated
    /// reads does not add a second copy, since the registry skips a listener
    /// that is the same `Arc` as one already watching the key. Building new
    /// options with a new closure on every read does register again.
    pub fn watch(mut self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.watch = Some(Arc::new(listener));
        self
    }

    /// Decrypt the raw value with `cipher` before anything else.
    pub fn cipher(mut self, cipher: impl Into<String>) -> Self {
        self.cipher = Some(cipher.into());
        self
    }

    pub fn disable_auto_decrypt(mut self) -> Self {
        self.disable_auto_decrypt = true;
        self
    }

    /// Separator for list getters, overriding the manager default.
    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn format(mut self, format: UnmarshalFormat) -> Self {
        self.format = format;
        self
    }

    /// Options for resolving a `${...}` reference: same decryption policy,
    /// nothing else.
    pub(crate) fn for_reference(&self) -> Self {
        Self {
            disable_auto_decrypt: self.disable_auto_decrypt,
            ..Self::default()
        }
    }

    /// Options for reading one element of a flattened list: same
    /// decryption, no alternates and no subscription.
    pub(crate) fn for_element(&self) -> Self {
        Self {
            cipher: self.cipher.clone(),
            disable_auto_decrypt: self.disable_auto_decrypt,
            ..Self::default()
        }
    }
}

impl fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOptions")
            .field("key_chain", &self.key_chain)
            .field("watch", &self.watch.is_some())
            .field("cipher", &self.cipher)
            .field("disable_auto_decrypt", &self.disable_auto_decrypt)
            .field("delimiter", &self.delimiter)
            .field("format", &self.format)
            .finish()
    }
}

/// Options for `set` and `delete`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub(crate) cipher: Option<String>,
    pub(crate) sources: Vec<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypt the value with `cipher` before writing it.
    pub fn cipher(mut self, cipher: impl Into<String>) -> Self {
        self.cipher = Some(cipher.into());
        self
    }

    /// Write to `source` only. Can be repeated; without it every loaded
    /// source is written.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_options_keep_only_decrypt_policy() {
        let options = GetOptions::new()
            .key_chain(["a", "b"])
            .cipher("base64")
            .disable_auto_decrypt()
            .watch(|_| {});

        let nested = options.for_reference();
        assert!(nested.key_chain.is_empty());
        assert!(nested.cipher.is_none());
        assert!(nested.watch.is_none());
        assert!(nested.disable_auto_decrypt);
        assert!(format!("{:?}", options).contains("watch: true"));
    }

    #[test]
    fn test_set_options_sources() {
        let options = SetOptions::new().source("memory").source("env").cipher("aes256gcm");
        assert_eq!(options.sources, vec!["memory", "env"]);
        assert_eq!(options.cipher.as_deref(), Some("aes256gcm"));
    }
}
