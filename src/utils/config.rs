//! Configuration management for peerlink.
//!
//! TOML-based configuration layered from defaults, an optional file and
//! `PEERLINK_*` environment variables, validated before use.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "peerlink.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "PEERLINK";

/// Complete configuration for a peerlink node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerlinkConfig {
    /// Local identity settings
    pub identity: IdentityConfig,
    /// Session protocol tuning
    pub session: SessionConfig,
    /// Storage locations
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Alias announced in identity messages
    pub alias: String,
}

/// Session protocol tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bodies declared larger than this many bytes are spooled to disk
    pub body_spool_cutoff: u64,
    /// Starting capacity of the receive buffer
    pub initial_buffer_capacity: usize,
    /// Multiplier applied when the receive buffer must grow
    pub buffer_growth_factor: f64,
    /// MTU used by the in-memory loopback transport
    pub default_mtu: usize,
    /// Minimum progress delta between receive progress events (0 = every change)
    pub progress_step: f32,
    /// Directory for spooled bodies; `None` uses the system temp dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spool_dir: Option<PathBuf>,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for storing keys
    pub keys_dir: PathBuf,
    /// Directory for spooled message bodies
    pub spool_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for PeerlinkConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let alias = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "peerlink".to_string());
        Self { alias }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            body_spool_cutoff: crate::defaults::DEFAULT_BODY_SPOOL_CUTOFF,
            initial_buffer_capacity: 1024,
            buffer_growth_factor: 1.5,
            default_mtu: crate::defaults::DEFAULT_MTU,
            progress_step: 0.0,
            spool_dir: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerlink");

        Self {
            keys_dir: data_dir.join("keys"),
            spool_dir: data_dir.join("spool"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl SessionConfig {
    /// Validate session tuning values
    pub fn validate(&self) -> Result<()> {
        if self.body_spool_cutoff == 0 {
            return Err(invalid("session.body_spool_cutoff", "0"));
        }
        if self.initial_buffer_capacity == 0 {
            return Err(invalid("session.initial_buffer_capacity", "0"));
        }
        if !(self.buffer_growth_factor > 1.0) {
            return Err(invalid(
                "session.buffer_growth_factor",
                &self.buffer_growth_factor.to_string(),
            ));
        }
        if self.default_mtu == 0 {
            return Err(invalid("session.default_mtu", "0"));
        }
        if !(0.0..1.0).contains(&self.progress_step) {
            return Err(invalid(
                "session.progress_step",
                &self.progress_step.to_string(),
            ));
        }
        Ok(())
    }
}

impl PeerlinkConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = config.merge(Self::from_file(path)?);
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("peerlink")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            for location in &default_locations {
                if location.exists() {
                    config = config.merge(Self::from_file(location)?);
                    break;
                }
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge this configuration with another, preferring values from other
    pub fn merge(mut self, other: Self) -> Self {
        self.identity = other.identity;
        self.session = other.session;
        self.storage = other.storage;
        self.logging = other.logging;
        self
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(alias) = std::env::var(format!("{ENV_PREFIX}_IDENTITY_ALIAS")) {
            self.identity.alias = alias;
        }

        let cutoff_var = format!("{ENV_PREFIX}_SESSION_BODY_SPOOL_CUTOFF");
        if let Ok(cutoff) = std::env::var(&cutoff_var) {
            self.session.body_spool_cutoff = cutoff
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: cutoff_var.clone(),
                    value: cutoff,
                })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.set_data_dir(PathBuf::from(data_dir));
        }

        Ok(self)
    }

    /// Point every storage directory below a new data directory
    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.storage.keys_dir = data_dir.join("keys");
        self.storage.spool_dir = data_dir.join("spool");
        self.storage.data_dir = data_dir;
    }

    /// Session settings with the spool directory resolved from storage
    pub fn session_config(&self) -> SessionConfig {
        let mut session = self.session.clone();
        if session.spool_dir.is_none() {
            session.spool_dir = Some(self.storage.spool_dir.clone());
        }
        session
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.identity.alias.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "identity.alias".to_string(),
            }
            .into());
        }

        self.session.validate()?;

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            &self.storage.data_dir,
            &self.storage.keys_dir,
            &self.storage.spool_dir,
        ];

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::PeerlinkError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}
