//! Per-tunnel bookkeeping records.
//!
//! Every running tunnel writes `~/.drip/tunnels/<subdomain>.json` on
//! registration and removes it on clean exit, so `drip list` style tooling
//! can show what is up without talking to the processes.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use drip_proto::TunnelType;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigManager};

/// One running tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub pid: u32,
    pub tunnel_type: TunnelType,
    /// Local port being exposed.
    pub port: u16,
    pub subdomain: String,
    pub server: String,
    pub url: String,
    /// Unix seconds.
    pub start_time: u64,
}

impl TunnelRecord {
    pub fn new(
        tunnel_type: TunnelType,
        port: u16,
        subdomain: impl Into<String>,
        server: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            tunnel_type,
            port,
            subdomain: subdomain.into(),
            server: server.into(),
            url: url.into(),
            start_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Reads and writes tunnel records in a directory.
pub struct TunnelStore {
    dir: PathBuf,
}

impl TunnelStore {
    /// The default store at `~/.drip/tunnels`.
    pub fn open() -> Result<Self, ConfigError> {
        Ok(Self::at(ConfigManager::config_dir()?.join("tunnels")))
    }

    /// A store rooted at an explicit directory.
    pub fn at(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn write(&self, record: &TunnelRecord) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.dir).map_err(|source| ConfigError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;
        let path = self.record_path(&record.subdomain);
        let json = serde_json::to_string_pretty(record).expect("record serializes");
        fs::write(&path, json).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Remove a record. Idempotent.
    pub fn remove(&self, subdomain: &str) -> Result<(), ConfigError> {
        let path = self.record_path(subdomain);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Every readable record, unreadable files skipped.
    pub fn list(&self) -> Vec<TunnelRecord> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "json")
            })
            .filter_map(|entry| {
                let json = fs::read_to_string(entry.path()).ok()?;
                serde_json::from_str(&json).ok()
            })
            .collect()
    }

    fn record_path(&self, subdomain: &str) -> PathBuf {
        self.dir.join(format!("{subdomain}.json"))
    }
}
