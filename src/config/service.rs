//! Configuration service system for dependency injection and test isolation.
//!
//! The [`ConfigService`] trait decouples configuration consumers from the
//! way configuration is loaded. Production code reads a TOML file merged
//! with `REPOPILOT_`-prefixed environment variables through the `config`
//! crate; tests inject a [`TestConfigService`] carrying a fully controlled
//! [`Config`] value.

use std::path::PathBuf;
use std::sync::RwLock;

use config::{Config as RawConfig, Environment, File};

use crate::config::{Config, validate_config};
use crate::error::RepoPilotError;
use crate::Result;

/// Service interface for configuration access.
///
/// All configuration consumers receive an `Arc<dyn ConfigService>` so the
/// concrete loading strategy stays swappable.
pub trait ConfigService: Send + Sync {
    /// Get the current configuration.
    ///
    /// Returns the current [`Config`] instance loaded from files,
    /// environment variables, and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading fails due to:
    /// - Invalid TOML format in configuration files
    /// - Invalid values rejected by validation
    /// - File system access issues
    fn get_config(&self) -> Result<Config>;

    /// Reload configuration from sources, discarding any cached value.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration reloading fails.
    fn reload(&self) -> Result<()>;

    /// Path of the backing configuration file, when one exists.
    fn config_file_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Production configuration service backed by a TOML file and environment.
///
/// Sources are merged in ascending priority: defaults, the configuration
/// file, then `REPOPILOT_`-prefixed environment variables with `__` as
/// the nesting separator (`REPOPILOT_DAEMON__MAX_CONCURRENT=4` overrides
/// `daemon.max_concurrent`).
pub struct ProductionConfigService {
    config_path: PathBuf,
    cached: RwLock<Option<Config>>,
}

impl ProductionConfigService {
    /// Create a service reading from the default configuration path
    /// (`<config dir>/repopilot/config.toml`).
    pub fn new() -> Result<Self> {
        let config_path = default_config_path()?;
        Ok(Self {
            config_path,
            cached: RwLock::new(None),
        })
    }

    /// Create a service reading from an explicit configuration file.
    pub fn with_config_path(path: PathBuf) -> Self {
        Self {
            config_path: path,
            cached: RwLock::new(None),
        }
    }

    fn load(&self) -> Result<Config> {
        let raw = RawConfig::builder()
            .add_source(File::from(self.config_path.clone()).required(false))
            .add_source(
                Environment::with_prefix("REPOPILOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = raw.try_deserialize()?;
        validate_config(&config)?;
        Ok(config)
    }
}

impl ConfigService for ProductionConfigService {
    fn get_config(&self) -> Result<Config> {
        {
            let cached = self.cached.read().unwrap();
            if let Some(config) = cached.as_ref() {
                return Ok(config.clone());
            }
        }
        let config = self.load()?;
        *self.cached.write().unwrap() = Some(config.clone());
        Ok(config)
    }

    fn reload(&self) -> Result<()> {
        let config = self.load()?;
        *self.cached.write().unwrap() = Some(config);
        Ok(())
    }

    fn config_file_path(&self) -> Option<PathBuf> {
        Some(self.config_path.clone())
    }
}

/// Test configuration service carrying a fixed in-memory configuration.
///
/// # Examples
///
/// ```rust
/// use repopilot::config::{ConfigService, TestConfigService};
///
/// let service = TestConfigService::with_defaults();
/// assert!(service.get_config().is_ok());
/// ```
pub struct TestConfigService {
    config: RwLock<Config>,
}

impl TestConfigService {
    /// Create a test service with the crate defaults.
    pub fn with_defaults() -> Self {
        Self {
            config: RwLock::new(Config::default()),
        }
    }

    /// Create a test service wrapping an explicit configuration value.
    pub fn with_config(config: Config) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Replace the held configuration.
    pub fn set_config(&self, config: Config) {
        *self.config.write().unwrap() = config;
    }
}

impl ConfigService for TestConfigService {
    fn get_config(&self) -> Result<Config> {
        Ok(self.config.read().unwrap().clone())
    }

    fn reload(&self) -> Result<()> {
        Ok(())
    }
}

/// Default configuration file path under the user configuration directory.
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| RepoPilotError::config("cannot determine user configuration directory"))?;
    Ok(dir.join("repopilot").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_test_service_returns_held_config() {
        let mut config = Config::default();
        config.daemon.max_concurrent = 7;
        let service = TestConfigService::with_config(config);
        assert_eq!(service.get_config().unwrap().daemon.max_concurrent, 7);
    }

    #[test]
    fn test_production_service_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[daemon]\nmax_concurrent = 3\n\n[scheduling]\nalgorithm = \"priority-based\"\n"
        )
        .unwrap();

        let service = ProductionConfigService::with_config_path(path);
        let config = service.get_config().unwrap();
        assert_eq!(config.daemon.max_concurrent, 3);
        assert_eq!(
            config.scheduling.algorithm,
            crate::config::SchedulingAlgorithm::PriorityBased
        );
    }

    #[test]
    fn test_production_service_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = ProductionConfigService::with_config_path(dir.path().join("absent.toml"));
        let config = service.get_config().unwrap();
        assert_eq!(config.daemon.max_concurrent, Config::default().daemon.max_concurrent);
    }

    #[test]
    fn test_production_service_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[rate_limit]\njitter_fraction = 3.0\n").unwrap();
        let service = ProductionConfigService::with_config_path(path);
        assert!(service.get_config().is_err());
    }
}
