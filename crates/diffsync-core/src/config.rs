//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/diffsync/config.toml)
//! 3. Environment variables (DIFFSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
const ENV_PREFIX: &str = "DIFFSYNC";

/// Address the server listens on unless configured otherwise
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9000";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (room documents)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address `diffsync serve` binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Server URL clients connect to (optional)
    #[serde(default)]
    pub server_url: Option<String>,

    /// Store and drop rooms once their last member leaves
    #[serde(default = "default_evict_empty_rooms")]
    pub evict_empty_rooms: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            server_url: None,
            evict_empty_rooms: default_evict_empty_rooms(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (DIFFSYNC_DATA_DIR, DIFFSYNC_BIND_ADDR, ...)
    /// 2. Config file (~/.config/diffsync/config.toml or DIFFSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
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
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_BIND_ADDR", ENV_PREFIX)) {
            if !val.is_empty() {
                self.bind_addr = val;
            }
        }

        // Empty string clears it
        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            self.server_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_EVICT_EMPTY_ROOMS", ENV_PREFIX)) {
            self.evict_empty_rooms = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Set a single key from its string form
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "bind_addr" => self.bind_addr = value.to_string(),
            "server_url" => {
                self.server_url = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "evict_empty_rooms" => {
                self.evict_empty_rooms = value
                    .parse()
                    .with_context(|| format!("Invalid boolean for {}: {}", key, value))?
            }
            _ => anyhow::bail!(
                "Unknown config key: {}. Valid keys: data_dir, bind_addr, server_url, evict_empty_rooms",
                key
            ),
        }
        Ok(())
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific path
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
    /// Can be overridden with DIFFSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("diffsync")
            .join("config.toml")
    }

    /// Directory the file adapter keeps room documents in
    pub fn rooms_dir(&self) -> PathBuf {
        self.data_dir.join("rooms")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("diffsync")
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_evict_empty_rooms() -> bool {
    true
}
