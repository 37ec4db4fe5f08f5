//! Peer-to-peer chat session engine
//!
//! Finds a peer through a shared presence list, negotiates a direct
//! connection over an unreliable signaling transport and runs a small chat
//! protocol over the resulting data channel.
//!
//! # Overview
//!
//! - **Signaling**: [`SignalingTransport`] carries JSON messages between peers,
//!   either in process ([`BroadcastBus`]) or through a WebSocket relay ([`RelayTransport`])
//! - **Presence**: [`PresenceRegistry`] tracks announced peers with a TTL
//! - **Negotiation**: [`NegotiationEngine`] runs the offer/answer/ICE exchange with retries and ICE restarts
//! - **Chat**: [`DataChannelProtocol`] frames chat, typing and ping messages
//! - **Lifecycle**: [`SessionStateMachine`] owns everything above for one local peer
//!
//! # Example
//!
//! ```rust,no_run
//! use peerchat::{
//!     BroadcastBus, MockMedia, MockNetwork, PeerId, PresenceRegistry, SessionConfig, SessionStateMachine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = BroadcastBus::new();
//!     let net = MockNetwork::new();
//!     let config = SessionConfig::default();
//!
//!     let transport = Arc::new(bus.connect(PeerId::generate()));
//!     let presence = PresenceRegistry::new(transport.clone(), config.presence.clone());
//!     let session = SessionStateMachine::new(
//!         transport,
//!         presence,
//!         Arc::new(net.factory()),
//!         Arc::new(MockMedia::new()),
//!         config,
//!     );
//!
//!     let peer = session.connect().await?;
//!     session.send_message(format!("hello {}", peer)).await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod media;
pub mod mock;
pub mod negotiation;
pub mod presence;
pub mod protocol;
pub mod real_factory;
pub mod relay;
pub mod session;
pub mod transport;
pub mod types;

pub use bus::{BroadcastBus, BusTransport, FaultConfig};
pub use config::{ChannelConfig, NegotiationConfig, PresenceConfig, SessionConfig};
pub use media::{acquire_local_media, MediaError, MediaHandle, MediaSource, MediaTrack, NullMedia, TrackKind};
pub use mock::{MockConnectionFactory, MockDataChannel, MockMedia, MockNetwork};
pub use negotiation::{NegotiationEngine, NegotiationError, NegotiationEvent, NegotiationState, Role};
pub use presence::{ActivePeers, PresenceEntry, PresenceRegistry};
pub use protocol::{DataChannelProtocol, ProtocolError, ProtocolEvent};
pub use real_factory::{WebRtcConnection, WebRtcConnectionFactory};
pub use relay::{RelayControl, RelayTransport};
pub use session::{EndReason, SessionError, SessionEvent, SessionState, SessionStateMachine};
pub use transport::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionStatus, DataChannel, MediaConnection,
    SignalingTransport, Subscription, TransportError,
};
pub use types::{
    now_ms, ChannelMessage, ChatMessage, Direction, IceCandidate, PeerId, SdpKind, SessionDescription,
    SignalingKind, SignalingMessage, SignalingPayload, TypingSignal, BROADCAST_PEER, DATA_CHANNEL_LABEL,
    PEER_ID_PREFIX,
};
