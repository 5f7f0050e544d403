//! Configuration file support
//!
//! Loads configuration from ~/.config/lanspeed/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientDefaults,

    #[serde(default)]
    pub server: ServerDefaults,
}

/// Default settings for client mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientDefaults {
    /// Bytes requested per session (e.g., "10M", "512K")
    pub size: Option<String>,

    /// Concurrent stream sessions per round
    pub tcp_sessions: Option<u32>,

    /// Concurrent datagram sessions per round
    pub udp_sessions: Option<u32>,

    /// Rounds to run (0 runs until interrupted)
    pub rounds: Option<u32>,

    /// How long to wait for an offer (e.g., "10s")
    pub discovery_timeout: Option<String>,

    /// Silence that ends a datagram transfer (e.g., "1s", "250ms")
    pub idle_window: Option<String>,

    pub discovery_port: Option<u16>,

    /// Enable TCP_NODELAY by default
    pub tcp_nodelay: Option<bool>,

    /// Default to JSON output
    pub json_output: Option<bool>,

    /// Log file path (e.g., "~/.config/lanspeed/lanspeed.log")
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// Default settings for server mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    pub tcp_port: Option<u16>,

    pub udp_port: Option<u16>,

    /// Port Offers are broadcast to
    pub discovery_port: Option<u16>,

    /// Broadcast destination (e.g., "192.168.1.255")
    pub broadcast_addr: Option<String>,

    /// Offer interval (e.g., "1s")
    pub interval: Option<String>,

    /// Bytes per stream write and per datagram payload
    pub chunk_size: Option<usize>,

    /// Maximum concurrent workers per transport
    pub max_workers: Option<usize>,

    pub tcp_nodelay: Option<bool>,

    /// Log file path (e.g., "~/.config/lanspeed/lanspeed.log")
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lanspeed")
            .join("config.toml")
    }
}
