//! Configuration for a mesh node.
//!
//! The config file lives at a platform-appropriate location (via `dirs`):
//! - Linux: `~/.config/waterfall-mesh/config.toml`
//! - macOS: `~/Library/Application Support/waterfall-mesh/config.toml`
//!
//! On first run no config file exists; the demonstration binary creates one
//! with a fresh protocol/bind configuration. CLI flags are layered on top
//! of whatever was loaded.

use crate::error::ConfigError;
use crate::protocol::Protocol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_max_outgoing() -> usize {
    8
}

fn default_stale_peer_secs() -> u64 {
    60
}

fn default_seen_set_cap() -> usize {
    100
}

fn default_seen_set_ttl_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_subnet() -> String {
    "waterfall".to_string()
}

fn default_encryption() -> String {
    "Plaintext".to_string()
}

/// The persisted configuration for a mesh node.
///
/// Distinct from the in-memory runtime state the socket keeps (routing
/// table, seen-set, …): this is only the handful of values a host may
/// configure, per `SPEC_FULL.md` §6's configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Local address to bind the listener to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Local port to bind the listener to. `0` lets the OS assign one.
    #[serde(default)]
    pub bind_port: u16,

    /// The `(host, port)` this node advertises to peers, if different from
    /// the bind address (NAT, port-forwarding). `None` means "use the bind
    /// address and the port the OS assigned."
    #[serde(default)]
    pub outward_addr: Option<(String, u16)>,

    /// The subnet tag folded into the protocol identifier.
    #[serde(default = "default_subnet")]
    pub subnet: String,

    /// The transport/encryption tag folded into the protocol identifier.
    #[serde(default = "default_encryption")]
    pub encryption: String,

    /// Debug verbosity, 0 (quiet) through 6 (everything). Only loosely
    /// wired to `tracing` levels — see `waterfall-mesh::main::init_logging`.
    #[serde(default)]
    pub debug_level: u8,

    /// Maximum number of outgoing (self-initiated) connections this node
    /// will keep open at once.
    #[serde(default = "default_max_outgoing")]
    pub max_outgoing: usize,

    /// How long a peer may go without activity before the daemon reaps it.
    #[serde(default = "default_stale_peer_secs")]
    pub stale_peer_secs: u64,

    /// Maximum number of entries retained in the waterfall seen-set.
    #[serde(default = "default_seen_set_cap")]
    pub seen_set_cap: usize,

    /// Maximum age of a seen-set entry before it is evicted.
    #[serde(default = "default_seen_set_ttl_secs")]
    pub seen_set_ttl_secs: u64,

    /// Bound on how long `connect()` may block dialing a peer.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: 0,
            outward_addr: None,
            subnet: default_subnet(),
            encryption: default_encryption(),
            debug_level: 0,
            max_outgoing: default_max_outgoing(),
            stale_peer_secs: default_stale_peer_secs(),
            seen_set_cap: default_seen_set_cap(),
            seen_set_ttl_secs: default_seen_set_ttl_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl NodeConfig {
    /// The `Protocol` descriptor this config's `subnet`/`encryption` fields
    /// resolve to.
    pub fn protocol(&self) -> Protocol {
        Protocol::new(self.subnet.clone(), self.encryption.clone())
    }

    /// Returns the platform-appropriate config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("waterfall-mesh"))
    }

    /// Returns the full path to the config file.
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.toml"))
    }

    /// Returns the platform-appropriate data directory for logs.
    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("waterfall-mesh"))
    }

    /// Loads the config from the default config file path.
    ///
    /// Returns `Ok(None)` if no config file exists yet (first run).
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    /// Loads the config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_owned(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(Some(config))
    }

    /// Saves this config to the default config file path, creating parent
    /// directories as needed.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_file_path()?;
        self.save_to(&path)
    }

    /// Saves this config to a specific file path, creating parent
    /// directories as needed.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: path.to_owned(),
                source: e,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(())
    }

    /// A config for first-run: defaults plus the caller's chosen bind port.
    pub fn new_first_run() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");

        let mut config = NodeConfig::default();
        config.bind_port = 9876;
        config.subnet = "test-mesh".to_string();

        config.save_to(&path).unwrap();
        let loaded = NodeConfig::load_from(&path).unwrap().unwrap();

        assert_eq!(loaded.bind_port, 9876);
        assert_eq!(loaded.subnet, "test-mesh");
        assert_eq!(loaded.max_outgoing, 8);
    }

    #[test]
    fn config_missing_file_returns_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nonexistent.toml");
        assert!(NodeConfig::load_from(&path).unwrap().is_none());
    }

    #[test]
    fn config_creates_parent_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("deep").join("nested").join("config.toml");
        NodeConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn defaults_match_spec_resource_caps() {
        let config = NodeConfig::default();
        assert_eq!(config.max_outgoing, 8);
        assert_eq!(config.stale_peer_secs, 60);
        assert_eq!(config.seen_set_cap, 100);
        assert_eq!(config.seen_set_ttl_secs, 60);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "bind_port = 1234\n").unwrap();
        let loaded = NodeConfig::load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.bind_port, 1234);
        assert_eq!(loaded.max_outgoing, 8);
    }
}
