//! Real WebRTC peer connections
//!
//! Wraps the webrtc crate behind [`MediaConnection`]. Callbacks registered on
//! the peer connection feed one event channel per connection; data channel
//! messages arrive through `on_message` and are queued for `recv`.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::media::{MediaHandle, TrackKind};
use crate::transport::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionStatus, DataChannel, MediaConnection,
    TransportError,
};
use crate::types::{IceCandidate, SdpKind, SessionDescription};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

/// RTCDataChannel behind our DataChannel trait
struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// None while connecting, then whether it opened
    opened: Arc<watch::Sender<Option<bool>>>,
}

impl WebRtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Dropped on close so `recv` ends
        let tx = Arc::new(Mutex::new(Some(tx)));

        let on_message_tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sender = on_message_tx.lock().ok().and_then(|s| s.clone());
            let data = msg.data.to_vec();
            Box::pin(async move {
                if let Some(sender) = sender {
                    let _ = sender.send(data);
                }
            })
        }));

        let (opened, _) = watch::channel(None);
        let opened = Arc::new(opened);
        let on_open = opened.clone();
        dc.on_open(Box::new(move || {
            on_open.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(true);
                    true
                } else {
                    false
                }
            });
            Box::pin(async {})
        }));

        let label = dc.label().to_string();
        let close_label = label.clone();
        let on_close = opened.clone();
        dc.on_close(Box::new(move || {
            if let Ok(mut slot) = tx.lock() {
                slot.take();
            }
            on_close.send_replace(Some(false));
            let label = close_label.clone();
            Box::pin(async move {
                debug!("data channel '{}' closed", label);
            })
        }));

        Arc::new(Self {
            dc,
            label,
            rx: tokio::sync::Mutex::new(rx),
            opened,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.dc
            .send(&bytes::Bytes::from(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn wait_open(&self) -> bool {
        if self.is_open() {
            return true;
        }
        let mut opened = self.opened.subscribe();
        let open = match opened.wait_for(Option::is_some).await {
            Ok(state) => *state == Some(true),
            Err(_) => false,
        };
        open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<ConnectionStatus> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionStatus::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionStatus::Checking),
        RTCPeerConnectionState::Connected => Some(ConnectionStatus::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionStatus::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionStatus::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionStatus::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// One RTCPeerConnection
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcConnection {
    fn register_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(ConnectionEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                info!("peer connection state: {}", state);
                if let Some(status) = map_state(state) {
                    let _ = tx.send(ConnectionEvent::StatusChanged(status));
                }
            })
        }));

        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            Box::pin(async move {
                // Overall status comes from the peer connection state
                debug!("ICE connection state: {}", state);
            })
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                info!("received data channel: {}", dc.label());
                let channel: Arc<dyn DataChannel> = WebRtcDataChannel::wrap(dc);
                let _ = tx.send(ConnectionEvent::DataChannel(channel));
            })
        }));

        let tx = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        RTPCodecType::Unspecified => return,
                    };
                    let _ = tx.send(ConnectionEvent::RemoteTrack(kind));
                })
            },
        ));
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(failed)
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(failed)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(failed)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc(desc)?).await.map_err(failed)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc(desc)?).await.map_err(failed)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(failed)
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        // Chat needs in-order delivery
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await.map_err(failed)?;
        Ok(WebRtcDataChannel::wrap(dc))
    }

    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        for track in media.tracks() {
            let kind = match track.kind() {
                TrackKind::Audio => RTPCodecType::Audio,
                TrackKind::Video => RTPCodecType::Video,
            };
            self.pc.add_transceiver_from_kind(kind, None).await.map_err(failed)?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("peer connection close: {}", e);
        }
    }
}

/// Creates real WebRTC connections using the configured STUN servers
pub struct WebRtcConnectionFactory {
    ice_servers: Vec<String>,
}

impl WebRtcConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(&self) -> Result<(Arc<dyn MediaConnection>, ConnectionEvents), TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(failed)?);

        let (tx, rx) = mpsc::unbounded_channel();
        WebRtcConnection::register_handlers(&pc, tx);
        let conn: Arc<dyn MediaConnection> = Arc::new(WebRtcConnection { pc });
        Ok((conn, rx))
    }
}
