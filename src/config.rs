//! Configuration management for peerchain

use crate::error::{ChainError, Result};
use crate::logging::LogFormat;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// The url other peers reach this node at. Also its identity.
    #[serde(default = "default_self_url")]
    pub self_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// Attempts made to fetch a peer's chain before falling back to the
    /// other peers.
    #[serde(default = "default_chain_fetch_attempts")]
    pub chain_fetch_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `":memory:"` keeps everything in process memory.
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            self_url: default_self_url(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            peer_timeout_ms: default_peer_timeout_ms(),
            chain_fetch_attempts: default_chain_fetch_attempts(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Defaults for a node reachable at `self_url`, backed by memory.
    pub fn ephemeral(self_url: &str) -> Self {
        let mut config = Config::default();
        config.node.self_url = self_url.to_string();
        config.database.path = ":memory:".to_string();
        config
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.network.peer_timeout_ms)
    }

    /// Validate critical values
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.node.self_url).map_err(|e| {
            ChainError::Config(format!("node.self_url '{}' is not a url: {}", self.node.self_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ChainError::Config(format!(
                "node.self_url '{}' must use http or https",
                self.node.self_url
            )));
        }
        if self.network.peer_timeout_ms == 0 {
            return Err(ChainError::Config(
                "network.peer_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.network.chain_fetch_attempts == 0 {
            return Err(ChainError::Config(
                "network.chain_fetch_attempts must be at least 1".to_string(),
            ));
        }
        if self.database.path.is_empty() {
            return Err(ChainError::Config("database.path must be set".to_string()));
        }
        Ok(())
    }
}

/// Read `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw)
            .map_err(|e| ChainError::Config(format!("{}: {}", path.display(), e)))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

fn default_self_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_peer_timeout_ms() -> u64 {
    3_000
}

fn default_chain_fetch_attempts() -> u32 {
    3
}

fn default_db_path() -> String {
    "./data/peerchain.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
