//! # Manager Settings
//!
//! Tunables of the configuration manager itself, loadable from defaults,
//! environment variables or a TOML/YAML file.
//!
//! # Environment Variables
//! - `CONFIG_NOTIFY_WORKERS`: listener dispatch threads (default: 4, range: 1-64)
//! - `CONFIG_LIST_DELIMITER`: separator for list getters (default: ",")
//! - `CONFIG_AUTO_DECRYPT`: decrypt `encrypted_*` values on read (default: true)
//! - `CONFIG_MAX_SUBSTITUTION_DEPTH`: nested `${...}` limit (default: 8, range: 1-64)
//! - `CONFIG_ENV_PREFIX`: only read environment variables with this prefix
//! - `CONFIG_FILES`: comma separated config files, later files win
//! - `CONFIG_WATCH_FILES`: reload files on change (default: true)

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use errors::{ConfigError, ConfigResult, SourceError};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::properties::Format;

/// Settings of a [`ConfigManager`](crate::ConfigManager).
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Controls listener dispatch, read-side value processing and which sources
/// the staged bootstrap registers.
///
/// ## Usage
/// ```rust,no_run
/// use config::ManagerSettings;
///
/// let settings = ManagerSettings::from_env()?;
/// println!("notify workers: {}", settings.notify_workers);
/// # Ok::<(), errors::ConfigError>(())
/// ```
///
/// ## Validation
/// - `notify_workers`: 1-64
/// - `list_delimiter`: at least 1 character
/// - `max_substitution_depth`: 1-64
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ManagerSettings {
    /// Threads delivering listener notifications
    #[serde(default = "default_notify_workers")]
    #[validate(range(min = 1, max = 64))]
    pub notify_workers: usize,

    /// Separator used by the list getters on string values
    #[serde(default = "default_list_delimiter")]
    #[validate(length(min = 1))]
    pub list_delimiter: String,

    /// Decrypt `encrypted_<cipher>_...:<payload>` values on read
    #[serde(default = "default_true")]
    pub auto_decrypt: bool,

    /// How deep `${...}` references may nest before expansion stops
    #[serde(default = "default_max_substitution_depth")]
    #[validate(range(min = 1, max = 64))]
    pub max_substitution_depth: usize,

    /// Environment variable prefix for the env source
    #[serde(default)]
    pub env_prefix: Option<String>,

    /// Files for the file source, in increasing precedence
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Watch `files` for changes
    #[serde(default = "default_true")]
    pub watch_files: bool,
}

fn default_notify_workers() -> usize {
    4
}

fn default_list_delimiter() -> String {
    ",".to_string()
}

fn default_max_substitution_depth() -> usize {
    8
}

fn default_true() -> bool {
    true
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            notify_workers: default_notify_workers(),
            list_delimiter: default_list_delimiter(),
            auto_decrypt: default_true(),
            max_substitution_depth: default_max_substitution_depth(),
            env_prefix: None,
            files: Vec::new(),
            watch_files: default_true(),
        }
    }
}

impl ManagerSettings {
    /// Defaults overridden by `CONFIG_*` environment variables, validated.
    pub fn from_env() -> ConfigResult<Self> {
        let mut settings = Self::default();

        if let Some(workers) = parse_env("CONFIG_NOTIFY_WORKERS")? {
            settings.notify_workers = workers;
        }
        if let Ok(delimiter) = env::var("CONFIG_LIST_DELIMITER") {
            settings.list_delimiter = delimiter;
        }
        if let Some(auto_decrypt) = parse_env("CONFIG_AUTO_DECRYPT")? {
            settings.auto_decrypt = auto_decrypt;
        }
        if let Some(depth) = parse_env("CONFIG_MAX_SUBSTITUTION_DEPTH")? {
            settings.max_substitution_depth = depth;
        }
        if let Ok(prefix) = env::var("CONFIG_ENV_PREFIX") {
            settings.env_prefix = (!prefix.is_empty()).then_some(prefix);
        }
        if let Ok(files) = env::var("CONFIG_FILES") {
            settings.files = files
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(watch) = parse_env("CONFIG_WATCH_FILES")? {
            settings.watch_files = watch;
        }

        settings.check()?;
        Ok(settings)
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file, validated.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let origin = path.display().to_string();
        let format = Format::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|e| SourceError::Io {
            path: origin.clone(),
            reason: e.to_string(),
        })?;

        let parse_error = |reason: String| SourceError::Parse {
            path: origin.clone(),
            reason,
        };
        let settings: Self = match format {
            Format::Toml => toml::from_str(&contents).map_err(|e| parse_error(e.to_string()))?,
            Format::Yaml => {
                serde_yaml::from_str(&contents).map_err(|e| parse_error(e.to_string()))?
            }
            Format::Json | Format::Properties => {
                return Err(SourceError::UnsupportedFormat {
                    extension: path
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or_default()
                        .to_string(),
                }
                .into());
            }
        };

        settings.check()?;
        Ok(settings)
    }

    /// Run the `validator` rules, reporting failures as a settings error.
    pub fn check(&self) -> ConfigResult<()> {
        self.validate().map_err(|e| ConfigError::Settings {
            reason: e.to_string(),
        })
    }
}

fn parse_env<T>(key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(s) => s.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Settings {
            reason: format!("{}: {}", key, e),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn clear_env() {
        unsafe {
            for key in [
                "CONFIG_NOTIFY_WORKERS",
                "CONFIG_LIST_DELIMITER",
                "CONFIG_AUTO_DECRYPT",
                "CONFIG_MAX_SUBSTITUTION_DEPTH",
                "CONFIG_ENV_PREFIX",
                "CONFIG_FILES",
                "CONFIG_WATCH_FILES",
            ] {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = ManagerSettings::default();
        assert!(settings.check().is_ok());
        assert_eq!(settings.notify_workers, 4);
        assert_eq!(settings.list_delimiter, ",");
        assert!(settings.auto_decrypt);
        assert!(settings.files.is_empty());
    }

    #[test]
    fn test_validation_bounds() {
        let settings = ManagerSettings {
            notify_workers: 0,
            ..ManagerSettings::default()
        };
        assert!(matches!(settings.check(), Err(ConfigError::Settings { .. })));

        let settings = ManagerSettings {
            list_delimiter: String::new(),
            ..ManagerSettings::default()
        };
        assert!(settings.check().is_err());

        let settings = ManagerSettings {
            max_substitution_depth: 65,
            ..ManagerSettings::default()
        };
        assert!(settings.check().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        unsafe {
            env::set_var("CONFIG_NOTIFY_WORKERS", "2");
            env::set_var("CONFIG_LIST_DELIMITER", ";");
            env::set_var("CONFIG_AUTO_DECRYPT", "false");
            env::set_var("CONFIG_ENV_PREFIX", "APP_");
            env::set_var("CONFIG_FILES", "base.yaml, local.yaml");
            env::set_var("CONFIG_WATCH_FILES", "false");
        }

        let settings = ManagerSettings::from_env();
        clear_env();

        let settings = settings.unwrap();
        assert_eq!(settings.notify_workers, 2);
        assert_eq!(settings.list_delimiter, ";");
        assert!(!settings.auto_decrypt);
        assert_eq!(settings.env_prefix.as_deref(), Some("APP_"));
        assert_eq!(
            settings.files,
            vec![PathBuf::from("base.yaml"), PathBuf::from("local.yaml")]
        );
        assert!(!settings.watch_files);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        unsafe {
            env::set_var("CONFIG_NOTIFY_WORKERS", "many");
        }
        let result = ManagerSettings::from_env();
        clear_env();
        assert!(matches!(result, Err(ConfigError::Settings { .. })));

        unsafe {
            env::set_var("CONFIG_NOTIFY_WORKERS", "500");
        }
        let result = ManagerSettings::from_env();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "notify_workers = 8\nfiles = [\"a.toml\"]").unwrap();

        let settings = ManagerSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.notify_workers, 8);
        assert_eq!(settings.files, vec![PathBuf::from("a.toml")]);
        assert_eq!(settings.max_substitution_depth, 8);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "auto_decrypt: false\nenv_prefix: SVC_").unwrap();

        let settings = ManagerSettings::from_file(file.path()).unwrap();
        assert!(!settings.auto_decrypt);
        assert_eq!(settings.env_prefix.as_deref(), Some("SVC_"));
    }

    #[test]
    fn test_from_file_unsupported() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("json");
        std::fs::write(&path, "{}").unwrap();

        let result = ManagerSettings::from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            result,
            Err(ConfigError::Source(SourceError::UnsupportedFormat { .. }))
        ));
    }

    #[test]
    fn test_from_file_no_extension() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().with_extension("");
        let result = ManagerSettings::from_file(&path);
        assert!(matches!(
            result,
            Err(ConfigError::Source(SourceError::NoExtension { .. }))
        ));
    }
}
