//! Transport abstractions
//!
//! Defines the signaling transport contract and the capability interface of
//! the underlying real-time connection, so negotiation and session logic run
//! unchanged over real (WebSocket relay + WebRTC) and in-process mock
//! implementations.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{MediaHandle, TrackKind};
use crate::types::{IceCandidate, PeerId, SessionDescription, SignalingKind, SignalingMessage};

/// Errors from transport and connection operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout")]
    Timeout,
    #[error("Not connected")]
    NotConnected,
    #[error("Closed")]
    Closed,
}

/// Stream of inbound signaling messages of the subscribed kinds
#[derive(Debug)]
pub struct Subscription {
    kinds: Vec<SignalingKind>,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl Subscription {
    pub(crate) fn new(kinds: Vec<SignalingKind>, rx: mpsc::UnboundedReceiver<SignalingMessage>) -> Self {
        Self { kinds, rx }
    }

    pub fn kinds(&self) -> &[SignalingKind] {
        &self.kinds
    }

    /// Next message, or None once the transport is closed
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        self.rx.try_recv().ok()
    }
}

/// Carrier of signaling messages between peers
///
/// Delivery is best effort: messages may be dropped, duplicated or
/// reordered. Messages addressed to a peer that is not subscribed are not
/// delivered, and `send` gives no delivery confirmation.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Peer id this transport receives for
    fn local_peer_id(&self) -> &PeerId;

    /// Subscribe to inbound messages of the given kinds
    fn subscribe(&self, kinds: &[SignalingKind]) -> Subscription;

    /// Fire-and-forget send. Errors only report local failures.
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError>;

    /// Stop delivering and release resources. Idempotent.
    async fn close(&self);
}

/// Reliable, ordered, message-oriented channel between two peers
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Send data to the peer
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Receive data from the peer, None once the channel is closed
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Wait until the channel opens; false if it closed first
    async fn wait_open(&self) -> bool;

    /// Close the channel
    async fn close(&self);
}

/// Status of the underlying connection, as reported by the ICE agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::New => "new",
            ConnectionStatus::Checking => "checking",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Events emitted by an underlying connection
pub enum ConnectionEvent {
    /// A local ICE candidate was gathered
    IceCandidate(IceCandidate),
    StatusChanged(ConnectionStatus),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    RemoteTrack(TrackKind),
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            ConnectionEvent::StatusChanged(s) => f.debug_tuple("StatusChanged").field(s).finish(),
            ConnectionEvent::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            ConnectionEvent::RemoteTrack(k) => f.debug_tuple("RemoteTrack").field(k).finish(),
        }
    }
}

pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// One underlying peer-to-peer media connection
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Generate a local offer, with fresh ICE credentials when `ice_restart`
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    /// Generate an answer to the current remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Fails when no remote description has been set yet
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Attach local tracks before the first offer or answer
    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Creates underlying connections together with their event streams
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn MediaConnection>, ConnectionEvents), TransportError>;
}

// Blanket implementations so Arc-wrapped implementations can be used directly

#[async_trait]
impl<T: SignalingTransport + ?Sized> SignalingTransport for Arc<T> {
    fn local_peer_id(&self) -> &PeerId {
        (**self).local_peer_id()
    }

    fn subscribe(&self, kinds: &[SignalingKind]) -> Subscription {
        (**self).subscribe(kinds)
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        (**self).send(msg).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: DataChannel + ?Sized> DataChannel for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        (**self).send(data).await
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        (**self).recv().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn wait_open(&self) -> bool {
        (**self).wait_open().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: ConnectionFactory + ?Sized> ConnectionFactory for Arc<T> {
    async fn create(&self) -> Result<(Arc<dyn MediaConnection>, ConnectionEvents), TransportError> {
        (**self).create().await
    }
}
