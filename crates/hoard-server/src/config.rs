use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hoard_store::{default_arena_dir, StoreConfig, DEFAULT_ARENA_SIZE, DEFAULT_NOTIFICATION_CAPACITY};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Startup configuration for a store server.
///
/// Every field has a default, so a TOML file only needs the keys it
/// changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unix socket clients connect to.
    pub socket_path: PathBuf,
    /// Size of the shared arena in bytes.
    pub arena_size: u64,
    /// Directory the arena file is created in.
    pub arena_dir: PathBuf,
    /// Address the transfer listener binds. The listener only runs when
    /// both this and `manager_port` are set.
    pub manager_addr: Option<IpAddr>,
    pub manager_port: Option<u16>,
    /// Default wait for `get` on an unsealed object.
    pub get_timeout_ms: u64,
    /// Bound on connecting to, streaming to and hearing back from a peer.
    pub transfer_timeout_ms: u64,
    /// A subscriber that leaves notifications unread this long is closed.
    pub write_timeout_ms: u64,
    /// Notifications buffered per subscriber before it is dropped.
    pub notification_capacity: usize,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/hoard.sock"),
            arena_size: DEFAULT_ARENA_SIZE,
            arena_dir: default_arena_dir(),
            manager_addr: None,
            manager_port: None,
            get_timeout_ms: 10_000,
            transfer_timeout_ms: 30_000,
            write_timeout_ms: 5_000,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    /// Load a TOML configuration file.
    pub fn from_file(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> ServerResult<Self> {
        toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> ServerResult<String> {
        toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.arena_size == 0 {
            return Err(ServerError::Config("arena_size must be non-zero".into()));
        }
        if self.notification_capacity == 0 {
            return Err(ServerError::Config(
                "notification_capacity must be non-zero".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be non-zero".into()));
        }
        match (self.manager_addr, self.manager_port) {
            (None, Some(_)) => {
                return Err(ServerError::Config(
                    "manager_port is set but manager_addr is not".into(),
                ))
            }
            (Some(_), None) => {
                return Err(ServerError::Config(
                    "manager_addr is set but manager_port is not".into(),
                ))
            }
            _ => {}
        }
        Ok(())
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_millis(self.get_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Where the transfer listener binds, if it is enabled.
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.manager_addr?, self.manager_port?))
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            arena_size: self.arena_size,
            arena_dir: self.arena_dir.clone(),
            notification_capacity: self.notification_capacity,
        }
    }
}
