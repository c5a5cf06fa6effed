//! Daemon configuration

use sandpit_core::ManagerConfig;
use sandpit_core::config::default_socket_path;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to Unix socket
    pub socket_path: PathBuf,

    /// Session manager, sandbox caps and reaper settings
    pub manager: ManagerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            manager: ManagerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from a JSON file; missing fields keep their defaults
    ///
    /// `SANDPIT_SOCKET` still wins over the file's socket path.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        if std::env::var_os("SANDPIT_SOCKET").is_some() {
            config.socket_path = default_socket_path();
        }
        Ok(config)
    }
}
