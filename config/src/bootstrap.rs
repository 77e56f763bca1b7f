//! # Staged Bootstrap
//!
//! Brings a manager up in the order the built-in sources depend on each
//! other:
//!
//! 1. environment source, loaded immediately
//! 2. optional security hook, which can read secrets from the environment
//!    and register ciphers before any encrypted file value is read
//! 3. file source (when files are configured), loaded
//! 4. memory source and any extra sources, then everything left is loaded

use std::fmt;
use std::sync::Arc;

use errors::ConfigResult;
use tracing::info;

use crate::manager::ConfigManager;
use crate::settings::ManagerSettings;
use crate::source::{
    ENV_SOURCE_NAME, ENV_SOURCE_PRIORITY, EnvSource, FILE_SOURCE_NAME, FILE_SOURCE_PRIORITY, FileSource,
    MEMORY_SOURCE_NAME, MEMORY_SOURCE_PRIORITY, MemorySource, SourceFactory,
};

/// Hook run once the environment source is loaded.
pub type SecurityHook = Arc<dyn Fn(&ConfigManager) -> ConfigResult<()> + Send + Sync>;

/// Inputs of [`init`].
#[derive(Clone, Default)]
pub struct BootstrapOptions {
    pub settings: ManagerSettings,
    pub security: Option<SecurityHook>,
    pub extra_sources: Vec<(String, i32, SourceFactory)>,
}

impl BootstrapOptions {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn security(mut self, hook: impl Fn(&ConfigManager) -> ConfigResult<()> + Send + Sync + 'static) -> Self {
        self.security = Some(Arc::new(hook));
        self
    }

    /// Register an additional source, loaded in the final stage.
    pub fn source(mut self, name: impl Into<String>, priority: i32, factory: SourceFactory) -> Self {
        self.extra_sources.push((name.into(), priority, factory));
        self
    }
}

impl fmt::Debug for BootstrapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapOptions")
            .field("settings", &self.settings)
            .field("security", &self.security.is_some())
            .field(
                "extra_sources",
                &self.extra_sources.iter().map(|(name, priority, _)| (name, priority)).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Validate the settings and build a fully loaded manager.
pub fn init(options: BootstrapOptions) -> ConfigResult<ConfigManager> {
    let BootstrapOptions {
        settings,
        security,
        extra_sources,
    } = options;
    settings.check()?;
    let manager = ConfigManager::with_settings(settings.clone());

    manager.add_source(
        ENV_SOURCE_NAME,
        ENV_SOURCE_PRIORITY,
        EnvSource::factory(settings.env_prefix.clone()),
    )?;
    manager.load(ENV_SOURCE_PRIORITY)?;

    if let Some(hook) = &security {
        hook(&manager)?;
    }

    if !settings.files.is_empty() {
        manager.add_source(
            FILE_SOURCE_NAME,
            FILE_SOURCE_PRIORITY,
            FileSource::factory(settings.files.clone(), settings.watch_files),
        )?;
        manager.load(FILE_SOURCE_PRIORITY)?;
    }

    manager.add_source(MEMORY_SOURCE_NAME, MEMORY_SOURCE_PRIORITY, MemorySource::factory())?;
    for (name, priority, factory) in extra_sources {
        manager.add_source(name, priority, factory)?;
    }
    manager.load_all()?;

    info!("Configuration manager ready with {} keys", manager.keys().len());
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SetOptions;
    use crate::properties::FlatMap;
    use crate::value::ConfigValue;
    use errors::ConfigError;
    use security::Base64Cipher;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn quiet_settings() -> ManagerSettings {
        ManagerSettings {
            env_prefix: Some("BOOTSTRAP_TEST_UNUSED_".to_string()),
            watch_files: false,
            ..ManagerSettings::default()
        }
    }

    #[test]
    fn test_stages_register_builtin_sources() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.yaml");
        fs::write(&path, "db:\n  host: file-host\n").unwrap();

        let mut settings = quiet_settings();
        settings.files = vec![path];
        let manager = init(BootstrapOptions::new(settings)).unwrap();

        let names: Vec<String> = manager.sources().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["env", "file", "memory"]);
        assert!(manager.sources().iter().all(|s| s.loaded));
        assert_eq!(manager.get_string("db.host", ""), "file-host");

        manager.set("db.host", "override", &SetOptions::default()).unwrap();
        assert_eq!(manager.get_string("db.host", ""), "override");
        assert_eq!(manager.source_of("db.host").unwrap().name(), "memory");
    }

    #[test]
    fn test_file_stage_skipped_without_files() {
        let manager = init(BootstrapOptions::new(quiet_settings())).unwrap();
        assert!(manager.source("file").is_none());
        assert!(manager.is_loaded("memory"));
    }

    #[test]
    fn test_security_hook_runs_before_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secrets.properties");
        fs::write(&path, "password=encrypted_custom_x:aHVudGVyMg==\n").unwrap();

        let mut settings = quiet_settings();
        settings.files = vec![path];

        let saw_file = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&saw_file);
        let options = BootstrapOptions::new(settings).security(move |manager| {
            observed.store(manager.is_loaded("file"), Ordering::SeqCst);
            manager.ciphers().register("custom", Base64Cipher);
            Ok(())
        });

        let manager = init(options).unwrap();
        assert!(!saw_file.load(Ordering::SeqCst));
        assert_eq!(manager.get_string("password", ""), "hunter2");
    }

    #[test]
    fn test_security_hook_failure_aborts() {
        let options = BootstrapOptions::new(quiet_settings()).security(|_| {
            Err(ConfigError::Settings {
                reason: "missing key".to_string(),
            })
        });
        assert!(matches!(init(options), Err(ConfigError::Settings { .. })));
    }

    #[test]
    fn test_extra_sources_loaded_last() {
        let mut defaults = FlatMap::new();
        defaults.insert("feature.enabled".to_string(), ConfigValue::from(true));

        let options = BootstrapOptions::new(quiet_settings()).source("overrides", 20, MemorySource::factory_with(defaults));
        let manager = init(options).unwrap();
        assert!(manager.get_bool("feature.enabled", false));
        assert_eq!(manager.sources().last().unwrap().name, "overrides");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut settings = quiet_settings();
        settings.notify_workers = 0;
        assert!(matches!(
            init(BootstrapOptions::new(settings)),
            Err(ConfigError::Settings { .. })
        ));
    }
}
