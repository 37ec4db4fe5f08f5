//! In-process stand-ins for the real-time connection, data channels and media devices
//!
//! [`MockNetwork`] links connections by the ids embedded in their session
//! descriptions. A pair connects once both sides hold each other's current
//! descriptions and at least one remote candidate of the current ICE
//! generation, so lost or reordered signaling really does stall it. Tests
//! break, interrupt and restore links to drive the ICE recovery paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::media::{MediaError, MediaHandle, MediaSource, MediaTrack, TrackKind};
use crate::transport::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, ConnectionStatus, DataChannel, MediaConnection,
    TransportError,
};
use crate::types::{IceCandidate, SdpKind, SessionDescription};

const CANDIDATES_PER_GATHER: u32 = 2;

// ============================================================================
// Mock Data Channel
// ============================================================================

/// One end of an in-memory channel pair
pub struct MockDataChannel {
    label: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    phase: Arc<watch::Sender<ChannelPhase>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelPhase {
    Connecting,
    Open,
    Closed,
}

impl MockDataChannel {
    /// Create an open, connected pair
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = Self::closed_pair(label);
        a.mark_open();
        (a, b)
    }

    /// Pair that stays closed until the owning connection links up
    pub(crate) fn closed_pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(ChannelPhase::Connecting);
        let phase = Arc::new(phase);

        let chan_a = Self {
            label: label.to_string(),
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            phase: phase.clone(),
        };
        let chan_b = Self {
            label: label.to_string(),
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            phase,
        };
        (Arc::new(chan_a), Arc::new(chan_b))
    }

    pub(crate) fn mark_open(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == ChannelPhase::Connecting {
                *phase = ChannelPhase::Open;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let tx = self
            .tx
            .lock()
            .map_err(|_| TransportError::Closed)?
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(data).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    fn is_open(&self) -> bool {
        *self.phase.borrow() == ChannelPhase::Open
    }

    async fn wait_open(&self) -> bool {
        let mut phase = self.phase.subscribe();
        let open = match phase.wait_for(|p| *p != ChannelPhase::Connecting).await {
            Ok(p) => *p == ChannelPhase::Open,
            Err(_) => false,
        };
        open
    }

    async fn close(&self) {
        self.phase.send_replace(ChannelPhase::Closed);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.rx.lock().await.close();
    }
}

// ============================================================================
// Mock Network
// ============================================================================

struct ConnState {
    events: mpsc::UnboundedSender<ConnectionEvent>,
    ice_gen: u32,
    local_gen: Option<u32>,
    /// Peer connection id and the ICE generation of its description
    remote: Option<(u64, u32)>,
    remote_candidate_gens: HashSet<u32>,
    completed: Option<(u32, u32)>,
    status: ConnectionStatus,
    /// Halves of channels we created, handed to the peer on first connect
    outgoing_channels: Vec<Arc<MockDataChannel>>,
    channels: Vec<Arc<MockDataChannel>>,
    local_media: Vec<TrackKind>,
    remote_tracks_seen: bool,
    closed: bool,
}

impl ConnState {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            self.status = status;
            self.emit(ConnectionEvent::StatusChanged(status));
        }
    }
}

#[derive(Default)]
struct NetState {
    next_id: u64,
    conns: HashMap<u64, ConnState>,
    broken: bool,
    /// How long handed-over channels take to open after the link comes up
    channel_open_delay: Duration,
}

impl NetState {
    fn conn(&mut self, id: u64) -> Result<&mut ConnState, TransportError> {
        match self.conns.get_mut(&id) {
            Some(c) if !c.closed => Ok(c),
            _ => Err(TransportError::Closed),
        }
    }

    /// Link two connections once both sides hold current descriptions and candidates
    fn try_complete(&mut self, id: u64) {
        let Some(a) = self.conns.get(&id) else { return };
        let Some((peer, a_remote_gen)) = a.remote else { return };
        let Some(b) = self.conns.get(&peer) else { return };

        let ready = !a.closed
            && !b.closed
            && b.remote == Some((id, a.ice_gen))
            && a_remote_gen == b.ice_gen
            && a.local_gen == Some(a.ice_gen)
            && b.local_gen == Some(b.ice_gen)
            && a.remote_candidate_gens.contains(&b.ice_gen)
            && b.remote_candidate_gens.contains(&a.ice_gen)
            && a.completed != Some((a.ice_gen, b.ice_gen));
        if !ready {
            return;
        }

        let pair_a = (a.ice_gen, b.ice_gen);
        let pair_b = (b.ice_gen, a.ice_gen);
        let broken = self.broken;

        for (this, other, pair) in [(id, peer, pair_a), (peer, id, pair_b)] {
            let handover = match self.conns.get_mut(&this) {
                Some(c) => {
                    c.completed = Some(pair);
                    std::mem::take(&mut c.outgoing_channels)
                }
                None => continue,
            };
            if broken {
                // Channels wait for a working link
                if let Some(c) = self.conns.get_mut(&this) {
                    c.outgoing_channels = handover;
                }
                continue;
            }
            let delay = self.channel_open_delay;
            if let Some(o) = self.conns.get_mut(&other) {
                for ch in handover {
                    if delay.is_zero() {
                        ch.mark_open();
                    } else {
                        let opening = ch.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            opening.mark_open();
                        });
                    }
                    o.channels.push(ch.clone());
                    o.emit(ConnectionEvent::DataChannel(ch));
                }
            }
        }

        let status = if broken {
            ConnectionStatus::Failed
        } else {
            ConnectionStatus::Connected
        };
        // Every completed check is reported, even when the status is unchanged
        for this in [id, peer] {
            if let Some(c) = self.conns.get_mut(&this) {
                c.status = status;
                c.emit(ConnectionEvent::StatusChanged(status));
            }
        }
    }
}

/// Shared in-memory network all mock connections live on
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetState>>,
    created: Arc<AtomicUsize>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> MockConnectionFactory {
        MockConnectionFactory { net: self.clone() }
    }

    /// Number of connections ever created
    pub fn connection_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Connections not yet closed
    pub fn open_connection_count(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.conns.values().filter(|c| !c.closed).count())
            .unwrap_or(0)
    }

    /// While broken, connectivity checks fail instead of connecting
    pub fn set_broken(&self, broken: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.broken = broken;
        }
    }

    /// Open data channels this long after their link connects instead of at once
    pub fn set_channel_open_delay(&self, delay: Duration) {
        if let Ok(mut s) = self.state.lock() {
            s.channel_open_delay = delay;
        }
    }

    /// Report ICE failure on every connected link
    pub fn fail_links(&self) {
        self.transition(ConnectionStatus::Connected, ConnectionStatus::Failed);
    }

    /// Report a transient disconnect on every connected link
    pub fn interrupt_links(&self) {
        self.transition(ConnectionStatus::Connected, ConnectionStatus::Disconnected);
    }

    /// Bring interrupted links back without an ICE restart
    pub fn restore_links(&self) {
        self.transition(ConnectionStatus::Disconnected, ConnectionStatus::Connected);
    }

    fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) {
        if let Ok(mut s) = self.state.lock() {
            for c in s.conns.values_mut().filter(|c| !c.closed && c.status == from) {
                c.set_status(to);
            }
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut NetState) -> Result<T, TransportError>) -> Result<T, TransportError> {
        let mut s = self.state.lock().map_err(|_| TransportError::Closed)?;
        f(&mut s)
    }
}

fn encode_sdp(kind: SdpKind, conn: u64, gen: u32, media: &[TrackKind]) -> String {
    let mut sdp = format!(
        "v=0\r\no=mock {} {}\r\na=type:{}\r\na=mock-conn:{}\r\na=ice-gen:{}\r\n",
        conn,
        gen,
        match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        },
        conn,
        gen
    );
    for kind in media {
        sdp.push_str(&format!("m={}\r\n", kind));
    }
    sdp.push_str("m=application\r\n");
    sdp
}

struct ParsedSdp {
    conn: u64,
    gen: u32,
    media: Vec<TrackKind>,
}

fn parse_sdp(sdp: &str) -> Option<ParsedSdp> {
    let mut conn = None;
    let mut gen = None;
    let mut media = Vec::new();
    for line in sdp.lines() {
        if let Some(v) = line.strip_prefix("a=mock-conn:") {
            conn = v.trim().parse().ok();
        } else if let Some(v) = line.strip_prefix("a=ice-gen:") {
            gen = v.trim().parse().ok();
        } else if line.trim() == "m=audio" {
            media.push(TrackKind::Audio);
        } else if line.trim() == "m=video" {
            media.push(TrackKind::Video);
        }
    }
    Some(ParsedSdp {
        conn: conn?,
        gen: gen?,
        media,
    })
}

fn encode_candidate(conn: u64, gen: u32, n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:mock {} {} {} udp 127.0.0.1 {}", conn, gen, n, 40000 + n),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
        username_fragment: Some(format!("u{}g{}", conn, gen)),
    }
}

fn parse_candidate(c: &IceCandidate) -> Option<(u64, u32)> {
    let mut parts = c.candidate.split_whitespace();
    if parts.next()? != "candidate:mock" {
        return None;
    }
    let conn = parts.next()?.parse().ok()?;
    let gen = parts.next()?.parse().ok()?;
    Some((conn, gen))
}

// ============================================================================
// Mock Connection
// ============================================================================

pub struct MockConnection {
    id: u64,
    net: MockNetwork,
}

impl MockConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl MediaConnection for MockConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let id = self.id;
        self.net.with_state(|s| {
            let c = s.conn(id)?;
            if ice_restart {
                c.ice_gen += 1;
            }
            Ok(SessionDescription::offer(encode_sdp(SdpKind::Offer, id, c.ice_gen, &c.local_media)))
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let id = self.id;
        self.net.with_state(|s| {
            let c = s.conn(id)?;
            if c.remote.is_none() {
                return Err(TransportError::InvalidState("no remote offer".into()));
            }
            Ok(SessionDescription::answer(encode_sdp(SdpKind::Answer, id, c.ice_gen, &c.local_media)))
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let id = self.id;
        let parsed = parse_sdp(&desc.sdp).ok_or_else(|| TransportError::InvalidState("malformed sdp".into()))?;
        if parsed.conn != id {
            return Err(TransportError::InvalidState("description belongs to another connection".into()));
        }
        self.net.with_state(|s| {
            let c = s.conn(id)?;
            if parsed.gen != c.ice_gen {
                return Err(TransportError::InvalidState("stale local description".into()));
            }
            let first = c.local_gen != Some(parsed.gen);
            c.local_gen = Some(parsed.gen);
            if first {
                for n in 0..CANDIDATES_PER_GATHER {
                    c.emit(ConnectionEvent::IceCandidate(encode_candidate(id, parsed.gen, n)));
                }
            }
            s.try_complete(id);
            Ok(())
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let id = self.id;
        let parsed = parse_sdp(&desc.sdp).ok_or_else(|| TransportError::InvalidState("malformed sdp".into()))?;
        self.net.with_state(|s| {
            if !s.conns.contains_key(&parsed.conn) {
                return Err(TransportError::InvalidState("unknown remote connection".into()));
            }
            let c = s.conn(id)?;
            match c.remote {
                Some((peer, _)) if peer != parsed.conn => {
                    return Err(TransportError::InvalidState("remote peer changed".into()));
                }
                // Restart offer: answer with fresh credentials
                Some((_, gen)) if desc.kind == SdpKind::Offer && gen != parsed.gen => {
                    c.ice_gen += 1;
                }
                _ => {}
            }
            c.remote = Some((parsed.conn, parsed.gen));
            if !c.remote_tracks_seen {
                c.remote_tracks_seen = true;
                for kind in &parsed.media {
                    c.emit(ConnectionEvent::RemoteTrack(*kind));
                }
            }
            if c.status == ConnectionStatus::New {
                c.set_status(ConnectionStatus::Checking);
            }
            s.try_complete(id);
            Ok(())
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let id = self.id;
        let (conn, gen) =
            parse_candidate(&candidate).ok_or_else(|| TransportError::InvalidState("malformed candidate".into()))?;
        self.net.with_state(|s| {
            let c = s.conn(id)?;
            let Some((peer, _)) = c.remote else {
                return Err(TransportError::InvalidState("remote description not set".into()));
            };
            if conn == peer {
                c.remote_candidate_gens.insert(gen);
                s.try_complete(id);
            }
            Ok(())
        })
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let id = self.id;
        let (local, remote) = MockDataChannel::closed_pair(label);
        self.net.with_state(|s| {
            let c = s.conn(id)?;
            c.channels.push(local.clone());
            c.outgoing_channels.push(remote);
            Ok(())
        })?;
        Ok(local)
    }

    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), TransportError> {
        let id = self.id;
        self.net.with_state(|s| {
            let c = s.conn(id)?;
            c.local_media = media.tracks().iter().map(|t| t.kind()).collect();
            Ok(())
        })
    }

    async fn close(&self) {
        let channels = self
            .net
            .with_state(|s| {
                let c = s.conn(self.id)?;
                c.closed = true;
                c.status = ConnectionStatus::Closed;
                Ok(std::mem::take(&mut c.channels))
            })
            .unwrap_or_default();
        for ch in channels {
            ch.close().await;
        }
    }
}

/// Creates [`MockConnection`]s on a [`MockNetwork`]
#[derive(Clone)]
pub struct MockConnectionFactory {
    net: MockNetwork,
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create(&self) -> Result<(Arc<dyn MediaConnection>, ConnectionEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.net.with_state(|s| {
            s.next_id += 1;
            let id = s.next_id;
            s.conns.insert(
                id,
                ConnState {
                    events: tx,
                    ice_gen: 0,
                    local_gen: None,
                    remote: None,
                    remote_candidate_gens: HashSet::new(),
                    completed: None,
                    status: ConnectionStatus::New,
                    outgoing_channels: Vec::new(),
                    channels: Vec::new(),
                    local_media: Vec::new(),
                    remote_tracks_seen: false,
                    closed: false,
                },
            );
            Ok(id)
        })?;
        self.net.created.fetch_add(1, Ordering::Relaxed);
        let conn = MockConnection {
            id,
            net: self.net.clone(),
        };
        Ok((Arc::new(conn), rx))
    }
}

// ============================================================================
// Mock Media
// ============================================================================

/// Media source with configurable missing devices and acquisition delay
#[derive(Debug, Clone, Default)]
pub struct MockMedia {
    unavailable: HashSet<TrackKind>,
    delay: Option<Duration>,
    opened: Arc<AtomicUsize>,
}

impl MockMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without(mut self, kind: TrackKind) -> Self {
        self.unavailable.insert(kind);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Successful acquisitions so far
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn open(&self, kinds: &[TrackKind]) -> Result<Vec<MediaTrack>, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(missing) = kinds.iter().find(|k| self.unavailable.contains(k)) {
            return Err(MediaError::Unavailable(*missing));
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(kinds
            .iter()
            .map(|k| MediaTrack::new(*k, format!("mock-{}", k)))
            .collect())
    }
}
