//! Engine configuration
//!
//! A single TOML file controls logging and the defaults applied to new
//! hooks. Missing files are created with default values on first load, and
//! missing keys fall back to their defaults.
//!
//! # Example
//!
//! ```ignore
//! use hijack_core::config::EngineConfig;
//!
//! let config = EngineConfig::load().unwrap_or_default();
//! let manager = HookManager::with_config(sink, &config);
//! ```

mod loader;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::callstack::MAX_CALLSTACK_DEPTH;
use crate::hooks::{HookOptions, DEFAULT_CALLSTACK_DEPTH};

pub use loader::{config_path, CONFIG_ENV, CONFIG_FILE_NAME};

/// Configuration system errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write config file
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML content
    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Failed to serialize config to TOML
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// Neither the environment nor the executable location gave a path
    #[error("Config path not available - set {} or place the file next to the executable", CONFIG_ENV)]
    NoConfigPath,
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Engine configuration.
///
/// Loaded from `$HIJACK_CONFIG`, or `hijack.toml` next to the executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Config version for future migration support
    pub version: u32,

    /// Enable debug logging
    pub debug: bool,

    /// Log filter used when `HIJACK_LOG` is not set
    pub log_level: String,

    /// Bounded capacity of the channel sink
    pub sink_capacity: usize,

    /// Frames walked for tracked callstacks
    pub max_callstack_depth: usize,

    /// Copy stack arguments of functions with a registered layout
    pub capture_arguments: bool,

    /// Allocate hook blocks within rel32 reach of their targets
    pub near_allocation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            debug: false,
            log_level: "info".to_string(),
            sink_capacity: 64 * 1024,
            max_callstack_depth: DEFAULT_CALLSTACK_DEPTH,
            capture_arguments: true,
            near_allocation: true,
        }
    }
}

impl EngineConfig {
    /// Load config from the default path, creating it if missing.
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&config_path()?)
    }

    /// Save config to the default path.
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&config_path()?)
    }

    /// Reload config from the default path.
    pub fn reload(&mut self) -> ConfigResult<()> {
        let path = config_path()?;
        let content = std::fs::read_to_string(&path)?;
        *self = toml::from_str(&content)?;
        tracing::debug!("Reloaded engine config from {:?}", path);
        Ok(())
    }

    /// Load config from `path`, writing the defaults there if missing.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            tracing::debug!("Loaded engine config from {:?}", path);
            Ok(config)
        } else {
            let default = Self::default();
            default.save_to(path)?;
            tracing::info!("Created default engine config at {:?}", path);
            Ok(default)
        }
    }

    /// Save config to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        tracing::debug!("Saved engine config to {:?}", path);
        Ok(())
    }

    /// Filter directive for the log subscriber
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }
}

impl From<&EngineConfig> for HookOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_callstack_depth: config.max_callstack_depth.min(MAX_CALLSTACK_DEPTH),
            capture_arguments: config.capture_arguments,
            near_allocation: config.near_allocation,
        }
    }
}
