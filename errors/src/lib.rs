//! # Configuration Errors
//!
//! Error handling for the dynamic configuration system.
//!
//! - Uses `thiserror` for structured error definitions
//! - Every variant carries named fields so messages stay self-describing
//! - Read paths never surface these; only registration, loading, writes and
//!   unmarshalling return them

use thiserror::Error;

/// Errors raised by the configuration manager.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Source already registered: {name}")]
    DuplicateSourceName { name: String },

    #[error("Priority {priority} already taken by source {existing}")]
    DuplicatePriority { priority: i32, existing: String },

    #[error("Failed to initialize source {source_name}: {reason}")]
    SourceInit { source_name: String, reason: String },

    #[error("Failed to write to source {source_name}: {reason}")]
    SourceWrite { source_name: String, reason: String },

    #[error("Unknown source: {name}")]
    UnknownSource { name: String },

    #[error("No active sources to write to")]
    NoActiveSources,

    #[error("Invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Encryption with cipher {cipher} failed: {reason}")]
    Encrypt { cipher: String, reason: String },

    #[error("Failed to unmarshal prefix '{prefix}': {reason}")]
    Unmarshal { prefix: String, reason: String },

    #[error("Invalid manager settings: {reason}")]
    Settings { reason: String },

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Errors raised by source plugins while reading, parsing or watching.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error on {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Unsupported config file format: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("Config file has no extension: {path}")]
    NoExtension { path: String },

    #[error("Failed to watch {path}: {reason}")]
    Watch { path: String, reason: String },

    #[error("Source {source_name} is read-only")]
    ReadOnly { source_name: String },
}

/// Errors raised by cipher implementations.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Cipher not registered: {name}")]
    UnknownCipher { name: String },

    #[error("Encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    #[error("Decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("Invalid encrypted data format")]
    InvalidFormat,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
