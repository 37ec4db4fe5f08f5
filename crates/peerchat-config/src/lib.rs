//! Shared configuration for peerchat tools
//!
//! Reads from ~/.peerchat/config.toml

use anyhow::{Context, Result};
use peerchat::{ChannelConfig, NegotiationConfig, PresenceConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default signaling relay
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8765";

/// Default STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Top-level config structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub media: MediaConfig,
}

/// Where signaling goes and which STUN servers ICE uses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingConfig {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            stun_servers: default_stun_servers(),
        }
    }
}

fn default_relay_url() -> String {
    DEFAULT_RELAY_URL.to_string()
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

/// Session lifecycle settings; the component tables live in their own sections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_search_poll_interval_ms")]
    pub search_poll_interval_ms: u64,
    #[serde(default = "default_connect_request_timeout_ms")]
    pub connect_request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub auto_accept: bool,
    #[serde(default = "default_true")]
    pub disconnect_on_unresponsive: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            search_timeout_ms: defaults.search_timeout_ms,
            search_poll_interval_ms: defaults.search_poll_interval_ms,
            connect_request_timeout_ms: defaults.connect_request_timeout_ms,
            auto_accept: defaults.auto_accept,
            disconnect_on_unresponsive: defaults.disconnect_on_unresponsive,
        }
    }
}

fn default_search_timeout_ms() -> u64 {
    SessionConfig::default().search_timeout_ms
}

fn default_search_poll_interval_ms() -> u64 {
    SessionConfig::default().search_poll_interval_ms
}

fn default_connect_request_timeout_ms() -> u64 {
    SessionConfig::default().connect_request_timeout_ms
}

/// Which local tracks to ask for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_true")]
    pub video: bool,
    #[serde(default = "default_true")]
    pub audio: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self { video: true, audio: true }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path())
    }

    /// Load config from an explicit path, creating it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(())
    }

    /// Assemble the core session settings from the file sections
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            search_timeout_ms: self.session.search_timeout_ms,
            search_poll_interval_ms: self.session.search_poll_interval_ms,
            connect_request_timeout_ms: self.session.connect_request_timeout_ms,
            want_video: self.media.video,
            want_audio: self.media.audio,
            auto_accept: self.session.auto_accept,
            disconnect_on_unresponsive: self.session.disconnect_on_unresponsive,
            presence: self.presence.clone(),
            negotiation: self.negotiation.clone(),
            channel: self.channel.clone(),
        }
    }
}

/// Get the peerchat directory (~/.peerchat)
pub fn get_peerchat_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PEERCHAT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerchat")
}

/// Get the config file path (~/.peerchat/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peerchat_dir().join("config.toml")
}
