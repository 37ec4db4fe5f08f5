//! Wire types shared by every transport and channel implementation
//!
//! Signaling messages travel as JSON objects:
//! `{"type": "offer_sdp", "from": "user_x", "to": "user_y", "sentAt": 1700000000000, "sdp": "..."}`.
//! Receivers ignore fields they do not know about.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix of locally generated peer ids
pub const PEER_ID_PREFIX: &str = "user_";

/// Peer id that addresses every subscribed peer
pub const BROADCAST_PEER: &str = "*";

/// Label of the chat data channel
pub const DATA_CHANNEL_LABEL: &str = "chat";

const PEER_ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Opaque identifier of one chat participant, stable for one process lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id: `user_` plus random base36 characters
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..PEER_ID_SUFFIX_LEN)
            .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
            .collect();
        Self(format!("{}{}", PEER_ID_PREFIX, suffix))
    }

    /// The broadcast address
    pub fn broadcast() -> Self {
        Self(BROADCAST_PEER.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == BROADCAST_PEER
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether we back off when both sides start negotiating at once.
    /// The lower id is polite.
    pub fn is_polite_towards(&self, other: &PeerId) -> bool {
        self < other
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Kind of a signaling message, used for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingKind {
    Announce,
    ConnectRequest,
    OfferSdp,
    AnswerSdp,
    IceCandidate,
    Disconnect,
}

impl SignalingKind {
    pub const ALL: [SignalingKind; 6] = [
        SignalingKind::Announce,
        SignalingKind::ConnectRequest,
        SignalingKind::OfferSdp,
        SignalingKind::AnswerSdp,
        SignalingKind::IceCandidate,
        SignalingKind::Disconnect,
    ];
}

/// ICE candidate descriptor, shaped like the browser's `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Type-specific part of a signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingPayload {
    Announce,
    ConnectRequest,
    OfferSdp {
        sdp: String,
        #[serde(rename = "iceRestart", default, skip_serializing_if = "is_false")]
        ice_restart: bool,
    },
    AnswerSdp {
        sdp: String,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    Disconnect,
}

impl SignalingPayload {
    pub fn kind(&self) -> SignalingKind {
        match self {
            SignalingPayload::Announce => SignalingKind::Announce,
            SignalingPayload::ConnectRequest => SignalingKind::ConnectRequest,
            SignalingPayload::OfferSdp { .. } => SignalingKind::OfferSdp,
            SignalingPayload::AnswerSdp { .. } => SignalingKind::AnswerSdp,
            SignalingPayload::IceCandidate { .. } => SignalingKind::IceCandidate,
            SignalingPayload::Disconnect => SignalingKind::Disconnect,
        }
    }
}

/// Addressed signaling message. Immutable once sent; may arrive zero, one or many times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub from: PeerId,
    pub to: PeerId,
    #[serde(rename = "sentAt")]
    pub sent_at: u64,
    #[serde(flatten)]
    pub payload: SignalingPayload,
}

impl SignalingMessage {
    pub fn new(from: PeerId, to: PeerId, payload: SignalingPayload) -> Self {
        Self {
            from,
            to,
            sent_at: now_ms(),
            payload,
        }
    }

    pub fn kind(&self) -> SignalingKind {
        self.payload.kind()
    }

    /// Whether a peer with id `peer_id` should receive this message
    pub fn is_for(&self, peer_id: &PeerId) -> bool {
        if self.to.is_broadcast() {
            &self.from != peer_id
        } else {
            &self.to == peer_id
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description handed to and produced by the media connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Envelope of everything sent over the chat data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelMessage {
    Chat {
        content: String,
        #[serde(rename = "sentAt")]
        sent_at: u64,
    },
    Typing {
        #[serde(rename = "sentAt")]
        sent_at: u64,
    },
    Ping {
        #[serde(rename = "sentAt", alias = "timestamp")]
        sent_at: u64,
    },
}

impl ChannelMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Which side wrote a transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Local,
    Remote,
}

/// One transcript entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub content: String,
    pub sent_at: u64,
    pub direction: Direction,
}

/// Inbound typing notification; carries no content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingSignal {
    pub sent_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_peer_id_shape() {
        let id = PeerId::generate();
        assert!(id.as_str().starts_with(PEER_ID_PREFIX));
        assert_eq!(id.as_str().len(), PEER_ID_PREFIX.len() + PEER_ID_SUFFIX_LEN);
        assert!(id.as_str()[PEER_ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(id, PeerId::generate());
    }

    #[test]
    fn test_is_for() {
        let a = PeerId::new("user_a");
        let b = PeerId::new("user_b");
        let direct = SignalingMessage::new(a.clone(), b.clone(), SignalingPayload::ConnectRequest);
        assert!(direct.is_for(&b));
        assert!(!direct.is_for(&a));

        let announce = SignalingMessage::new(a.clone(), PeerId::broadcast(), SignalingPayload::Announce);
        assert!(announce.is_for(&b));
        assert!(!announce.is_for(&a));
    }

    #[test]
    fn test_politeness_is_antisymmetric() {
        let a = PeerId::new("user_a");
        let b = PeerId::new("user_b");
        assert!(a.is_polite_towards(&b));
        assert!(!b.is_polite_towards(&a));
    }
}
