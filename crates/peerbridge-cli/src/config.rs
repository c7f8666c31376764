//! Configuration file for the PeerBridge CLI.

use peerbridge_core::BridgeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Bridge configuration
    #[serde(default)]
    pub bridge: BridgeSection,
    /// Echo server configuration
    #[serde(default)]
    pub echo: EchoSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Service type advertised and browsed for
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Identifier this node advertises
    #[serde(default = "default_peer_identifier")]
    pub peer_identifier: String,
    /// Forward connect deadline in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Reverse connect deadline in seconds
    #[serde(default = "default_reverse_connect_timeout")]
    pub reverse_connect_timeout_secs: u64,
    /// Relay buffer per direction in bytes
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
    /// Advertisement reset interval in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertisement_reset_secs: Option<u64>,
    /// Application event queue capacity
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

/// Echo server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoSection {
    /// Bind address
    #[serde(default = "default_echo_bind")]
    pub bind: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_service_type() -> String {
    "peerbridge".to_string()
}

fn default_peer_identifier() -> String {
    "peerbridge-node".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reverse_connect_timeout() -> u64 {
    15
}

fn default_relay_buffer_size() -> usize {
    64 * 1024
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_echo_bind() -> String {
    "127.0.0.1:7007".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            peer_identifier: default_peer_identifier(),
            connect_timeout_secs: default_connect_timeout(),
            reverse_connect_timeout_secs: default_reverse_connect_timeout(),
            relay_buffer_size: default_relay_buffer_size(),
            advertisement_reset_secs: None,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl Default for EchoSection {
    fn default() -> Self {
        Self {
            bind: default_echo_bind(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("peerbridge/config.toml")
    }

    /// Load from `path`, or from the default path if it exists, or defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit path is missing or any file is invalid.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse the echo bind address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn echo_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.echo.bind.parse()?)
    }

    /// Bridge configuration for a node advertising as `peer_identifier`
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn bridge_config(&self, peer_identifier: &str) -> anyhow::Result<BridgeConfig> {
        let mut config = BridgeConfig::new(self.bridge.service_type.clone(), peer_identifier);
        config.connect_timeout = Duration::from_secs(self.bridge.connect_timeout_secs);
        config.reverse_connect_timeout =
            Duration::from_secs(self.bridge.reverse_connect_timeout_secs);
        config.relay_buffer_size = self.bridge.relay_buffer_size;
        config.advertisement_reset_interval =
            self.bridge.advertisement_reset_secs.map(Duration::from_secs);
        config.event_channel_capacity = self.bridge.event_channel_capacity;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.echo_addr()?;
        self.bridge_config(&self.bridge.peer_identifier)?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }
}
