//! Configuration persistence module
//!
//! Provides TOML-based configuration for peerlink sessions.
//! The default file lives in the platform-specific config directory:
//! - Linux: ~/.config/peerlink/config.toml
//! - Windows: %APPDATA%\peerlink\config.toml
//! - macOS: ~/Library/Application Support/peerlink/config.toml

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{SignalingMode, Topology};

/// Application name used for configuration directory
const APP_NAME: &str = "peerlink";

/// Public PeerJS broker
pub const DEFAULT_CLOUD_URL: &str = "wss://0.peerjs.com/peerjs";

/// API key accepted by the public broker
pub const DEFAULT_CLOUD_KEY: &str = "peerjs";

/// Smallest room (host + one peer)
pub const MIN_NODES: usize = 2;

/// Largest room
pub const MAX_NODES: usize = 8;

/// Clamp a requested room size to [`MIN_NODES`, `MAX_NODES`]
pub fn clamp_max_nodes(requested: i64) -> usize {
    requested.clamp(MIN_NODES as i64, MAX_NODES as i64) as usize
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Cloud broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Broker websocket endpoint (ws:// or wss://)
    pub url: String,
    /// Broker API key
    pub key: String,
    /// Interval between client heartbeats, 0 disables them
    pub heartbeat_interval_ms: u64,
}

impl CloudConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        match self.heartbeat_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_CLOUD_URL.to_string(),
            key: DEFAULT_CLOUD_KEY.to_string(),
            heartbeat_interval_ms: 5000,
        }
    }
}

/// LAN discovery server settings (host side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Address the discovery server binds to
    pub bind_ip: IpAddr,
    /// Port the discovery server binds to (0 = ephemeral)
    pub port: u16,
    /// Address embedded in the LAN code (None = detect)
    pub advertise_ip: Option<Ipv4Addr>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            advertise_ip: None,
        }
    }
}

/// Direct transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address channel listeners bind to
    pub bind_ip: IpAddr,
    /// Addresses offered as candidates (empty = detect)
    pub advertise_ips: Vec<IpAddr>,
    /// Timeout for dialing one candidate
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ips: Vec::new(),
            connect_timeout_ms: 5000,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub topology: Topology,
    /// Room size including the host, clamped to [2, 8]
    pub max_nodes: usize,
    /// Star hosts relay application messages between peers
    pub auto_relay: bool,
    /// Signaling used when creating a room
    pub signaling_mode: SignalingMode,
    /// Time a peer has to open its channel
    pub negotiation_timeout_ms: u64,
    pub cloud: CloudConfig,
    pub local: LocalConfig,
    pub transport: TransportConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Star,
            max_nodes: MAX_NODES,
            auto_relay: true,
            signaling_mode: SignalingMode::Cloud,
            negotiation_timeout_ms: 15_000,
            cloud: CloudConfig::default(),
            local: LocalConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cloud.url.starts_with("ws://") && !self.cloud.url.starts_with("wss://") {
            return Err(ConfigError::Invalid(format!(
                "Invalid cloud signaling URL: {}. Must start with ws:// or wss://",
                self.cloud.url
            )));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "negotiation_timeout_ms must be positive".to_string(),
            ));
        }

        if self.transport.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.connect_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse and validate a TOML document; `max_nodes` is clamped
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: NetworkConfig = toml::from_str(content)?;
        config.max_nodes = clamp_max_nodes(config.max_nodes as i64);
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration, creating the parent directory if needed
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                    path: dir.to_path_buf(),
                    source,
                })?;
            }
        }

        fs::write(path, self.to_toml_string()?).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.cloud.heartbeat_interval()
    }
}
