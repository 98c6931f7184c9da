//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/tally/config.toml)
//! 3. Environment variables (TALLY_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::storage::EngineOptions;

/// Environment variable prefix
const ENV_PREFIX: &str = "TALLY";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite db, site identity)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Debug log destination when TALLY_LOG is set (defaults to data_dir/debug.log)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Writes that may wait for the writer before submitters are held back
    #[serde(default = "default_write_queue_depth")]
    pub write_queue_depth: usize,

    /// Unread change notifications buffered per subscriber
    #[serde(default = "default_notify_capacity")]
    pub notify_capacity: usize,

    /// Idle read connections kept open
    #[serde(default = "default_read_pool_size")]
    pub read_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_file: None,
            write_queue_depth: default_write_queue_depth(),
            notify_capacity: default_notify_capacity(),
            read_pool_size: default_read_pool_size(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (TALLY_DATA_DIR, TALLY_LOG_FILE, ...)
    /// 2. Config file (~/.config/tally/config.toml or TALLY_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, honouring a `--config` path from the command line
    pub fn load_with_cli_override(cli_path: Option<&Path>) -> Result<Self> {
        match cli_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // TALLY_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // TALLY_LOG_FILE
        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        // TALLY_WRITE_QUEUE_DEPTH
        if let Some(depth) = env_usize("WRITE_QUEUE_DEPTH") {
            self.write_queue_depth = depth;
        }

        // TALLY_NOTIFY_CAPACITY
        if let Some(capacity) = env_usize("NOTIFY_CAPACITY") {
            self.notify_capacity = capacity;
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with TALLY_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tally")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("tally.db")
    }

    /// Get the path to this device's site ID file
    pub fn site_id_path(&self) -> PathBuf {
        self.data_dir.join("site_id")
    }

    /// Get the debug log path
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("debug.log"))
    }

    /// Storage engine tuning derived from this configuration
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            write_queue_depth: self.write_queue_depth.max(1),
            read_pool_size: self.read_pool_size,
        }
    }
}

fn env_usize(suffix: &str) -> Option<usize> {
    std::env::var(format!("{}_{}", ENV_PREFIX, suffix))
        .ok()
        .and_then(|val| val.trim().parse().ok())
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
}

fn default_write_queue_depth() -> usize {
    64
}

fn default_notify_capacity() -> usize {
    16
}

fn default_read_pool_size() -> usize {
    4
}
