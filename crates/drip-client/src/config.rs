//! Client configuration persistence.
//!
//! Stores the default server address, auth token, and TLS preference in
//! `~/.drip/config.json` so tunnels can be started with just a port.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHome,

    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Persisted client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server control address, `host:port`.
    pub server: String,
    /// Shared auth token.
    pub token: String,
    /// Whether the control link uses TLS.
    #[serde(default = "default_tls")]
    pub tls: bool,
}

fn default_tls() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            token: String::new(),
            tls: true,
        }
    }
}

/// Loads and saves the config file.
pub struct ConfigManager;

impl ConfigManager {
    /// `~/.drip`
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        Ok(dirs::home_dir().ok_or(ConfigError::NoHome)?.join(".drip"))
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    pub fn load() -> Result<ClientConfig, ConfigError> {
        Self::load_from(Self::config_path()?)
    }

    pub fn save(config: &ClientConfig) -> Result<(), ConfigError> {
        Self::save_to(Self::config_path()?, config)
    }

    /// Delete the config file. Idempotent.
    pub fn reset() -> Result<(), ConfigError> {
        let path = Self::config_path()?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Whether a config file exists.
    pub fn exists() -> bool {
        Self::config_path().map(|p| p.exists()).unwrap_or(false)
    }

    fn load_from(path: PathBuf) -> Result<ClientConfig, ConfigError> {
        if !path.exists() {
            return Ok(ClientConfig::default());
        }
        let json = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn save_to(path: PathBuf, config: &ClientConfig) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(config).expect("config serializes");
        fs::write(&path, json).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}
