//! Start-up configuration for a bank node.
//!
//! Values come from an optional JSON file (camelCase keys, every field
//! optional) and are then overridden by command-line flags.

use std::{
    fs, io,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeConfig {
    /// The address this bank is known by; commands naming any other address
    /// are relayed.
    pub address: String,
    /// Interface the listener binds to.
    pub bind: IpAddr,
    /// Port to listen on, and the port peers are assumed to listen on.
    pub port: u16,
    pub command_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// Budget for a relayed command. Defaults to four fifths of the command
    /// timeout so a relay failure is reported before the command times out.
    pub forward_timeout_ms: Option<u64>,
    pub state_path: PathBuf,
    /// Optional JSON-lines file that receives every event.
    pub event_log: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 65530,
            command_timeout_ms: 5_000,
            idle_timeout_ms: 15_000,
            forward_timeout_ms: None,
            state_path: PathBuf::from("data").join("bank-state.json"),
            event_log: None,
        }
    }
}

impl NodeConfig {
    /// Reads a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("address must not be empty".into()));
        }
        if self.address.contains(char::is_whitespace) || self.address.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "address '{}' must not contain whitespace or '/'",
                self.address
            )));
        }
        if self.command_timeout_ms == 0 || self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.forward_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("forward timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        let millis = self
            .forward_timeout_ms
            .unwrap_or(self.command_timeout_ms.saturating_mul(4) / 5)
            .max(1);
        Duration::from_millis(millis)
    }
}
