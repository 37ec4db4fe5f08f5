//! Tunables for each component
//!
//! Durations are stored in milliseconds so the structs embed directly in
//! the TOML config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Presence announcement and expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Entries not refreshed within this window are gone
    pub ttl_ms: u64,
    /// Announce interval; 0 means a third of the TTL
    pub announce_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 45_000,
            announce_interval_ms: 0,
        }
    }
}

impl PresenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn announce_interval(&self) -> Duration {
        if self.announce_interval_ms > 0 {
            Duration::from_millis(self.announce_interval_ms)
        } else {
            Duration::from_millis((self.ttl_ms / 3).max(1))
        }
    }
}

/// Offer/answer/ICE exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Overall bound on reaching Connected, per attempt and per ICE restart
    pub negotiation_timeout_ms: u64,
    /// Resend interval for unacknowledged offers and local candidates
    pub retransmit_interval_ms: u64,
    pub max_retransmits: u32,
    /// Grace period after "disconnected" before restarting ICE
    pub ice_disconnect_grace_ms: u64,
    /// A second failure within this window is fatal
    pub ice_failure_window_ms: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 15_000,
            retransmit_interval_ms: 1_000,
            max_retransmits: 5,
            ice_disconnect_grace_ms: 5_000,
            ice_failure_window_ms: 30_000,
        }
    }
}

impl NegotiationConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn ice_disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.ice_disconnect_grace_ms)
    }

    pub fn ice_failure_window(&self) -> Duration {
        Duration::from_millis(self.ice_failure_window_ms)
    }
}

/// Data channel keepalive and typing indicator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub ping_interval_ms: u64,
    /// Silent intervals before the peer counts as unresponsive
    pub missed_pings: u32,
    pub typing_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 30_000,
            missed_pings: 2,
            typing_timeout_ms: 2_000,
        }
    }
}

impl ChannelConfig {
    /// Never zero, so the keepalive ticker can always be built
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn unresponsive_after(&self) -> Duration {
        self.ping_interval() * self.missed_pings.max(1)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub search_timeout_ms: u64,
    pub search_poll_interval_ms: u64,
    /// A selected peer that does not engage within this window is stale
    pub connect_request_timeout_ms: u64,
    pub want_video: bool,
    pub want_audio: bool,
    /// Accept inbound connect requests while idle
    pub auto_accept: bool,
    pub disconnect_on_unresponsive: bool,
    pub presence: PresenceConfig,
    pub negotiation: NegotiationConfig,
    pub channel: ChannelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            search_timeout_ms: 30_000,
            search_poll_interval_ms: 1_000,
            connect_request_timeout_ms: 5_000,
            want_video: true,
            want_audio: true,
            auto_accept: true,
            disconnect_on_unresponsive: true,
            presence: PresenceConfig::default(),
            negotiation: NegotiationConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn search_poll_interval(&self) -> Duration {
        Duration::from_millis(self.search_poll_interval_ms.max(1))
    }

    pub fn connect_request_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_request_timeout_ms)
    }
}
