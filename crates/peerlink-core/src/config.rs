//! Configuration system for peerlink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/com.peerlink.peerlink/config.toml
//! - Linux: ~/.config/peerlink/config.toml
//! - Windows: %APPDATA%/peerlink/peerlink/config/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::ClientSource;
use crate::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_PENDING_MESSAGES,
    DEFAULT_REASSEMBLY_TIMEOUT_SECS,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay connection settings
    pub signaling: SignalingConfig,
    /// Peer channel settings
    pub transport: TransportConfig,
    /// Chunk reassembly limits
    pub reassembly: ReassemblyConfig,
    /// Automatic reconnection
    pub reconnect: ReconnectConfig,
    /// Development relay server
    pub relay: RelayConfig,
}

/// Relay connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Base URL of the relay; the connection id is appended as a path segment
    pub relay_url: String,
    /// Side this process speaks for
    pub source: ClientSource,
    /// Side we want to reach
    pub target: ClientSource,
    /// WebSocket connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://signaling-server-rcnet.radixdlt.com/".to_string(),
            source: ClientSource::Wallet,
            target: ClientSource::Extension,
            connect_timeout_secs: 10,
        }
    }
}

/// One STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Peer channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// ICE servers handed to the transport
    pub ice_servers: Vec<IceServerConfig>,
    /// Maximum raw bytes carried by one chunk frame
    pub chunk_size: usize,
    /// Negotiation attempts that do not open a channel in time are dropped
    pub negotiation_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            chunk_size: DEFAULT_CHUNK_SIZE,
            negotiation_timeout_secs: 30,
        }
    }
}

/// Reassembly limits, applied per connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Idle timeout for an incomplete message in seconds
    pub idle_timeout_secs: u64,
    /// Maximum incomplete messages held at once
    pub max_pending_messages: usize,
    /// Maximum size of one message in bytes
    pub max_message_bytes: usize,
    /// Finished message ids remembered to reject late frames
    pub tombstone_capacity: usize,
    /// How often idle buffers are swept in seconds
    pub sweep_interval_secs: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_REASSEMBLY_TIMEOUT_SECS,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            tombstone_capacity: 1024,
            sweep_interval_secs: 10,
        }
    }
}

/// Reconnection behavior after a transport drop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Retry dropped links while the remote client is still on the relay
    pub enabled: bool,
    /// First retry delay in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for the retry delay in milliseconds
    pub max_delay_ms: u64,
    /// Attempts before giving up (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << shift);
        std::time::Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether retry number `attempt` (1-based) is within budget
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt <= self.max_attempts)
    }
}

/// Development relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address
    pub bind: IpAddr,
    /// Listen port
    pub port: u16,
    /// Room idle timeout in seconds
    pub room_idle_timeout_secs: u64,
    /// Maximum clients per connection id
    pub max_clients_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            room_idle_timeout_secs: 300, // 5 minutes
            max_clients_per_room: 10,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "peerlink", "peerlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// No config directory available
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No configuration directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.chunk_size, 15_441);
        assert_eq!(config.signaling.source, ClientSource::Wallet);
        assert_eq!(config.signaling.target, ClientSource::Extension);
        assert_eq!(config.relay.port, 8080);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.transport.chunk_size, config.transport.chunk_size);
        assert_eq!(parsed.transport.ice_servers, config.transport.ice_servers);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [signaling]
            relay_url = "ws://127.0.0.1:9000/"
            source = "extension"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.signaling.relay_url, "ws://127.0.0.1:9000/");
        assert_eq!(config.signaling.source, ClientSource::Extension);
        // Other values should be defaults
        assert_eq!(config.signaling.connect_timeout_secs, 10);
        assert_eq!(config.reassembly.max_pending_messages, DEFAULT_MAX_PENDING_MESSAGES);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[signaling]"));
        assert!(sample.contains("[reassembly]"));
        assert!(sample.contains("[relay]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.transport.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.reconnect.max_attempts = 3;
        config.relay.port = 9999;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.reconnect.max_attempts, 3);
        assert_eq!(loaded.relay.port, 9999);
    }

    #[test]
    fn test_config_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[signaling\nrelay_url = ").unwrap();
        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_reconnect_backoff() {
        let reconnect = ReconnectConfig {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            max_attempts: 3,
        };
        assert_eq!(reconnect.delay_for(1), Duration::from_millis(100));
        assert_eq!(reconnect.delay_for(2), Duration::from_millis(200));
        assert_eq!(reconnect.delay_for(3), Duration::from_millis(400));
        assert_eq!(reconnect.delay_for(10), Duration::from_millis(1000));
        assert!(reconnect.allows(3));
        assert!(!reconnect.allows(4));

        let unlimited = ReconnectConfig {
            max_attempts: 0,
            ..reconnect
        };
        assert!(unlimited.allows(1000));
    }
}
