//! Session lifecycle: Idle → Connecting → Searching → Connected → Disconnecting → Idle
//!
//! `SessionStateMachine` is the only owner of session state. Every transition
//! runs under one async lock; inbound signaling and component events are
//! processed one at a time by a router task.
//!
//! Each connection attempt gets a fresh `Session` with its own id. Timers,
//! engine events and channel events carry that id and are dropped once the
//! session is no longer current, and the connect operation carries its own
//! id so a late media acquisition cannot revive a cancelled operation.

use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::media::{acquire_local_media, MediaError, MediaHandle, MediaSource, TrackKind};
use crate::negotiation::{NegotiationEngine, NegotiationError, NegotiationEvent, Role};
use crate::presence::PresenceRegistry;
use crate::protocol::{DataChannelProtocol, ProtocolError, ProtocolEvent};
use crate::transport::{ConnectionFactory, SignalingTransport, Subscription, TransportError};
use crate::types::{ChatMessage, PeerId, SignalingKind, SignalingMessage, SignalingPayload};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Searching,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Searching => "searching",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid in current state ({0})")]
    InvalidState(SessionState),
    #[error("cannot connect to {0}")]
    InvalidPeer(PeerId),
    #[error("media unavailable: {0}")]
    Media(MediaError),
    #[error("no peer found")]
    NoPeerFound,
    #[error("peer {0} did not respond")]
    PeerUnreachable(PeerId),
    #[error("negotiation failed: {0}")]
    Negotiation(NegotiationError),
    #[error("remote peer disconnected")]
    RemoteDisconnected,
    #[error("cancelled by disconnect")]
    Cancelled,
    #[error("data channel: {0}")]
    Channel(#[from] ProtocolError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Why a session went back to Idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalDisconnect,
    RemoteDisconnect,
    PeerUnresponsive,
    ChannelClosed,
    NoPeerFound,
    PeerUnreachable(PeerId),
    NegotiationFailed(NegotiationError),
    MediaUnavailable(MediaError),
}

impl EndReason {
    fn to_error(&self) -> SessionError {
        match self {
            EndReason::LocalDisconnect => SessionError::Cancelled,
            EndReason::RemoteDisconnect | EndReason::PeerUnresponsive | EndReason::ChannelClosed => {
                SessionError::RemoteDisconnected
            }
            EndReason::NoPeerFound => SessionError::NoPeerFound,
            EndReason::PeerUnreachable(peer) => SessionError::PeerUnreachable(peer.clone()),
            EndReason::NegotiationFailed(e) => SessionError::Negotiation(e.clone()),
            EndReason::MediaUnavailable(e) => SessionError::Media(e.clone()),
        }
    }
}

/// Notifications for the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    PeerConnected(PeerId),
    MessageReceived(ChatMessage),
    PeerTyping(bool),
    PeerUnresponsive,
    PeerResponsive,
    RemoteTrack(TrackKind),
    IceRestarting { attempt: u32 },
    Ended(EndReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectMode {
    /// Pick a random announced peer
    Discover,
    /// Connect to a given peer
    Direct(PeerId),
    /// Accepting an inbound request while idle
    Accept(PeerId),
}

struct Operation {
    id: u64,
    mode: ConnectMode,
    outcome: Option<oneshot::Sender<Result<PeerId, SessionError>>>,
    task: Option<JoinHandle<()>>,
    tried: HashSet<PeerId>,
    deadline: Instant,
}

struct Session {
    id: u64,
    remote: PeerId,
    role: Role,
    engine: Option<Arc<NegotiationEngine>>,
    protocol: Option<Arc<DataChannelProtocol>>,
    /// Signaling from the remote received before the engine exists
    deferred: Vec<SignalingMessage>,
    /// Offer and answer exchanged
    engaged: bool,
    connected: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    state: SessionState,
    op: Option<Operation>,
    session: Option<Session>,
    media: Option<MediaHandle>,
}

enum RouterEvent {
    Negotiation { session: u64, event: NegotiationEvent },
    Channel { session: u64, event: ProtocolEvent },
    RequestTimeout { session: u64 },
}

/// Engine plus the messages to feed it once the session lock is released
type Replay = (Arc<NegotiationEngine>, Vec<SignalingMessage>);

struct Shared {
    local_id: PeerId,
    signaling: Arc<dyn SignalingTransport>,
    presence: Arc<PresenceRegistry>,
    factory: Arc<dyn ConnectionFactory>,
    media_source: Arc<dyn MediaSource>,
    config: SessionConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
    router_tx: mpsc::UnboundedSender<RouterEvent>,
    ids: AtomicU64,
    router: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to the local peer's session state machine. Clones share state.
#[derive(Clone)]
pub struct SessionStateMachine {
    shared: Arc<Shared>,
}

impl SessionStateMachine {
    /// Build the state machine and start routing inbound signaling.
    /// Must be called inside a tokio runtime.
    pub fn new(
        signaling: Arc<dyn SignalingTransport>,
        presence: Arc<PresenceRegistry>,
        factory: Arc<dyn ConnectionFactory>,
        media_source: Arc<dyn MediaSource>,
        config: SessionConfig,
    ) -> Self {
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let signals = signaling.subscribe(&[
            SignalingKind::ConnectRequest,
            SignalingKind::OfferSdp,
            SignalingKind::AnswerSdp,
            SignalingKind::IceCandidate,
            SignalingKind::Disconnect,
        ]);

        let shared = Arc::new(Shared {
            local_id: signaling.local_peer_id().clone(),
            signaling,
            presence,
            factory,
            media_source,
            config,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                op: None,
                session: None,
                media: None,
            }),
            events,
            router_tx,
            ids: AtomicU64::new(0),
            router: StdMutex::new(None),
        });

        let router = tokio::spawn(route(Arc::downgrade(&shared), signals, router_rx));
        if let Ok(mut slot) = shared.router.lock() {
            *slot = Some(router);
        }
        Self { shared }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    /// Remote peer of the current session, if any
    pub async fn remote_peer_id(&self) -> Option<PeerId> {
        self.shared.inner.lock().await.session.as_ref().map(|s| s.remote.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Find a random announced peer and connect to it
    ///
    /// Resolves with the remote peer once connected. Rejected with
    /// `InvalidState` unless Idle.
    pub async fn connect(&self) -> Result<PeerId, SessionError> {
        self.shared.start_op(ConnectMode::Discover).await
    }

    /// Connect to `peer` directly, skipping discovery
    pub async fn connect_to(&self, peer: PeerId) -> Result<PeerId, SessionError> {
        if peer == self.shared.local_id || peer.is_broadcast() {
            return Err(SessionError::InvalidPeer(peer));
        }
        self.shared.start_op(ConnectMode::Direct(peer)).await
    }

    /// Tear everything down and return to Idle. A no-op while Idle.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == SessionState::Idle {
            debug!("disconnect while idle");
            return;
        }
        self.shared.end(&mut inner, EndReason::LocalDisconnect, true).await;
    }

    /// Send a chat message. Only valid while Connected; nothing is queued.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<ChatMessage, SessionError> {
        let protocol = self.connected_protocol().await?;
        Ok(protocol.send_chat(content).await?)
    }

    /// Send one typing signal
    pub async fn send_typing(&self) -> Result<(), SessionError> {
        let protocol = self.connected_protocol().await?;
        Ok(protocol.send_typing().await?)
    }

    /// Chat transcript of the current session
    pub async fn transcript(&self) -> Vec<ChatMessage> {
        let inner = self.shared.inner.lock().await;
        inner
            .session
            .as_ref()
            .and_then(|s| s.protocol.as_ref())
            .map(|p| p.transcript())
            .unwrap_or_default()
    }

    pub async fn is_peer_typing(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner
            .session
            .as_ref()
            .and_then(|s| s.protocol.as_ref())
            .is_some_and(|p| p.is_peer_typing())
    }

    /// Mute or unmute local audio, or turn the camera off and on
    pub async fn set_media_enabled(&self, kind: TrackKind, enabled: bool) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.media.as_ref().is_some_and(|m| m.set_enabled(kind, enabled))
    }

    /// Disconnect and stop routing. The handle is inert afterwards.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        if let Ok(mut slot) = self.shared.router.lock() {
            if let Some(router) = slot.take() {
                router.abort();
            }
        }
    }

    async fn connected_protocol(&self) -> Result<Arc<DataChannelProtocol>, SessionError> {
        let inner = self.shared.inner.lock().await;
        if inner.state != SessionState::Connected {
            return Err(SessionError::InvalidState(inner.state));
        }
        inner
            .session
            .as_ref()
            .and_then(|s| s.protocol.clone())
            .ok_or(SessionError::Channel(ProtocolError::NotOpen))
    }
}

async fn route(
    weak: Weak<Shared>,
    mut signals: Subscription,
    mut internal: mpsc::UnboundedReceiver<RouterEvent>,
) {
    // Signaling may end while a direct session keeps running
    let mut signaling_open = true;
    loop {
        tokio::select! {
            msg = signals.recv(), if signaling_open => {
                let Some(msg) = msg else {
                    warn!("signaling transport closed, serving the live session only");
                    signaling_open = false;
                    continue;
                };
                let Some(shared) = weak.upgrade() else { break };
                shared.on_signal(msg).await;
            }
            event = internal.recv() => {
                let Some(event) = event else { break };
                let Some(shared) = weak.upgrade() else { break };
                shared.on_internal(event).await;
            }
        }
    }
    debug!("session router stopped");
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        if inner.state != state {
            info!(peer = %self.local_id, from = %inner.state, to = %state, "session state");
            inner.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn op_is(inner: &Inner, id: u64) -> bool {
        inner.op.as_ref().is_some_and(|op| op.id == id)
    }

    fn op_mode(inner: &Inner) -> Option<&ConnectMode> {
        inner.op.as_ref().map(|op| &op.mode)
    }

    /// Forget the running op task's handle so a teardown issued from inside it does not abort it
    fn detach_op_task(inner: &mut Inner) {
        if let Some(op) = inner.op.as_mut() {
            op.task.take();
        }
    }

    // ------------------------------------------------------------------------
    // Connect operations
    // ------------------------------------------------------------------------

    async fn start_op(self: &Arc<Self>, mode: ConnectMode) -> Result<PeerId, SessionError> {
        let outcome = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Idle {
                warn!(state = %inner.state, "connect rejected");
                return Err(SessionError::InvalidState(inner.state));
            }
            let (tx, rx) = oneshot::channel();
            self.begin_op(&mut inner, mode, Some(tx));
            rx
        };
        outcome.await.unwrap_or(Err(SessionError::Cancelled))
    }

    fn begin_op(
        self: &Arc<Self>,
        inner: &mut Inner,
        mode: ConnectMode,
        outcome: Option<oneshot::Sender<Result<PeerId, SessionError>>>,
    ) {
        let id = self.next_id();
        self.set_state(inner, SessionState::Connecting);
        inner.op = Some(Operation {
            id,
            mode: mode.clone(),
            outcome,
            task: None,
            tried: HashSet::new(),
            deadline: Instant::now() + self.config.search_timeout(),
        });
        let task = tokio::spawn(self.clone().run_op(id, mode));
        if let Some(op) = inner.op.as_mut() {
            op.task = Some(task);
        }
    }

    async fn run_op(self: Arc<Self>, op_id: u64, mode: ConnectMode) {
        let acquired = acquire_local_media(
            self.media_source.as_ref(),
            self.config.want_video,
            self.config.want_audio,
        )
        .await;

        let mut inner = self.inner.lock().await;
        if !Self::op_is(&inner, op_id) {
            debug!(op = op_id, "discarding media acquired for a cancelled operation");
            if let Ok(media) = &acquired {
                media.stop();
            }
            return;
        }
        let media = match acquired {
            Ok(media) => media,
            Err(e) => {
                Self::detach_op_task(&mut inner);
                self.end(&mut inner, EndReason::MediaUnavailable(e), false).await;
                return;
            }
        };
        inner.media = Some(media);
        self.set_state(&mut inner, SessionState::Searching);

        // A request accepted while media was being acquired takes precedence
        if inner.session.is_some() {
            let replay = self.attach_engine(&mut inner);
            drop(inner);
            if let Some(replay) = replay {
                Self::replay(replay).await;
            }
            if mode == ConnectMode::Discover {
                self.search(op_id).await;
            }
            return;
        }

        match mode {
            ConnectMode::Direct(peer) => {
                let engine = self.open_session(&mut inner, peer, Role::Initiator);
                drop(inner);
                if let Some(engine) = engine {
                    self.kick_initiator(engine).await;
                }
            }
            ConnectMode::Discover => {
                self.presence.start_announcing(self.local_id.clone());
                drop(inner);
                self.search(op_id).await;
            }
            ConnectMode::Accept(peer) => {
                // The accepted session was torn down while media was acquired
                debug!(peer = %peer, "accepted session vanished");
                Self::detach_op_task(&mut inner);
                self.end(&mut inner, EndReason::RemoteDisconnect, false).await;
            }
        }
    }

    /// Poll presence for a candidate until connected or the search deadline passes
    async fn search(self: &Arc<Self>, op_id: u64) {
        let poll = self.config.search_poll_interval();
        loop {
            let engine = {
                let mut inner = self.inner.lock().await;
                let Some((deadline, tried)) = inner
                    .op
                    .as_ref()
                    .filter(|op| op.id == op_id)
                    .map(|op| (op.deadline, op.tried.clone()))
                else {
                    return;
                };
                if inner.state != SessionState::Searching {
                    return;
                }

                if inner.session.is_some() {
                    // An attempt is in flight; it ends by connecting or by being abandoned
                    None
                } else if Instant::now() >= deadline {
                    info!(peer = %self.local_id, "search timed out");
                    Self::detach_op_task(&mut inner);
                    self.end(&mut inner, EndReason::NoPeerFound, false).await;
                    return;
                } else {
                    let mut candidates: Vec<PeerId> = self
                        .presence
                        .list_active(&self.local_id)
                        .iter()
                        .map(|entry| entry.peer_id)
                        .filter(|peer| !tried.contains(peer))
                        .collect();
                    candidates.shuffle(&mut rand::thread_rng());
                    match candidates.into_iter().next() {
                        Some(peer) => {
                            info!(peer = %peer, "selected candidate");
                            self.open_session(&mut inner, peer, Role::Initiator)
                        }
                        None => None,
                    }
                }
            };

            if let Some(engine) = engine {
                self.kick_initiator(engine).await;
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn kick_initiator(&self, engine: Arc<NegotiationEngine>) {
        let remote = engine.remote_peer_id().clone();
        let request = SignalingMessage::new(self.local_id.clone(), remote.clone(), SignalingPayload::ConnectRequest);
        if let Err(e) = self.signaling.send(request).await {
            debug!(peer = %remote, "connect request send failed: {}", e);
        }
        // Failures come back as engine events
        if let Err(e) = engine.start_as_initiator().await {
            debug!(peer = %remote, "initiator start failed: {}", e);
        }
    }

    async fn replay((engine, messages): Replay) {
        if engine.role() == Role::Responder {
            if let Err(e) = engine.await_offer().await {
                debug!("await offer: {}", e);
            }
        }
        for msg in messages {
            if let Err(e) = engine.handle_signaling(msg).await {
                debug!("replayed signaling failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Start a fresh session with `remote`. Returns its engine when media is already available.
    fn open_session(self: &Arc<Self>, inner: &mut Inner, remote: PeerId, role: Role) -> Option<Arc<NegotiationEngine>> {
        let id = self.next_id();
        debug!(session = id, peer = %remote, ?role, "opening session");

        let router = self.router_tx.clone();
        let timeout = self.config.connect_request_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = router.send(RouterEvent::RequestTimeout { session: id });
        });

        inner.session = Some(Session {
            id,
            remote,
            role,
            engine: None,
            protocol: None,
            deferred: Vec::new(),
            engaged: false,
            connected: false,
            tasks: vec![timer],
        });

        if inner.media.is_some() {
            self.attach_engine(inner).map(|(engine, _)| engine)
        } else {
            None
        }
    }

    /// Create the engine for the current session if it has none yet
    fn attach_engine(self: &Arc<Self>, inner: &mut Inner) -> Option<Replay> {
        let media = inner.media.clone();
        let session = inner.session.as_mut()?;
        if session.engine.is_some() {
            return None;
        }

        let (engine, mut events) = NegotiationEngine::new(
            self.local_id.clone(),
            session.remote.clone(),
            session.role,
            self.signaling.clone(),
            self.factory.clone(),
            media,
            self.config.negotiation.clone(),
        );
        let router = self.router_tx.clone();
        let id = session.id;
        session.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if router.send(RouterEvent::Negotiation { session: id, event }).is_err() {
                    break;
                }
            }
        }));
        session.engine = Some(engine.clone());
        Some((engine, std::mem::take(&mut session.deferred)))
    }

    async fn close_session(&self, mut session: Session, notify_remote: bool) {
        for task in session.tasks.drain(..) {
            task.abort();
        }
        if notify_remote {
            let bye = SignalingMessage::new(self.local_id.clone(), session.remote.clone(), SignalingPayload::Disconnect);
            if let Err(e) = self.signaling.send(bye).await {
                debug!(peer = %session.remote, "disconnect send failed: {}", e);
            }
        }
        if let Some(protocol) = session.protocol.take() {
            protocol.close().await;
        }
        if let Some(engine) = session.engine.take() {
            engine.close().await;
        }
        debug!(session = session.id, peer = %session.remote, "session closed");
    }

    /// Full teardown back to Idle
    async fn end(&self, inner: &mut Inner, reason: EndReason, notify_remote: bool) {
        if inner.state == SessionState::Idle {
            return;
        }
        self.set_state(inner, SessionState::Disconnecting);

        if let Some(session) = inner.session.take() {
            self.close_session(session, notify_remote).await;
        }
        if let Some(mut op) = inner.op.take() {
            if let Some(task) = op.task.take() {
                task.abort();
            }
            if let Some(outcome) = op.outcome.take() {
                let _ = outcome.send(Err(reason.to_error()));
            }
        }
        self.presence.withdraw(&self.local_id).await;
        if let Some(media) = inner.media.take() {
            media.stop();
        }

        self.set_state(inner, SessionState::Idle);
        info!(peer = %self.local_id, ?reason, "session ended");
        self.emit(SessionEvent::Ended(reason));
    }

    /// Drop the current attempt. Discovery keeps searching; anything else ends.
    async fn abandon_attempt(&self, inner: &mut Inner, reason: EndReason, stale: bool, notify_remote: bool) {
        let Some(session) = inner.session.take() else { return };
        let remote = session.remote.clone();
        let was_connected = session.connected;
        self.close_session(session, notify_remote).await;
        if stale {
            self.presence.withdraw(&remote).await;
        }

        let keep_searching = !was_connected && Self::op_mode(inner) == Some(&ConnectMode::Discover);
        if keep_searching {
            if let Some(op) = inner.op.as_mut() {
                op.tried.insert(remote.clone());
            }
            info!(peer = %remote, ?reason, "attempt abandoned, searching again");
        } else {
            self.end(inner, reason, false).await;
        }
    }

    // ------------------------------------------------------------------------
    // Inbound signaling
    // ------------------------------------------------------------------------

    async fn on_signal(self: &Arc<Self>, msg: SignalingMessage) {
        // Broadcasts are presence traffic
        if msg.to.is_broadcast() {
            return;
        }
        match &msg.payload {
            SignalingPayload::ConnectRequest
            | SignalingPayload::OfferSdp {
                ice_restart: false, ..
            } => self.on_inbound_request(msg).await,
            SignalingPayload::OfferSdp { .. }
            | SignalingPayload::AnswerSdp { .. }
            | SignalingPayload::IceCandidate { .. } => self.forward_to_session(msg).await,
            SignalingPayload::Disconnect => self.on_remote_disconnect(msg.from).await,
            SignalingPayload::Announce => {}
        }
    }

    async fn forward_to_session(&self, msg: SignalingMessage) {
        let engine = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.session.as_mut().filter(|s| s.remote == msg.from) else {
                debug!(from = %msg.from, kind = ?msg.kind(), "signaling outside the current session, ignoring");
                return;
            };
            match &session.engine {
                Some(engine) => engine.clone(),
                None => {
                    session.deferred.push(msg);
                    return;
                }
            }
        };
        if let Err(e) = engine.handle_signaling(msg).await {
            debug!("signaling handler: {}", e);
        }
    }

    /// Connect request or initial offer: accept, resolve a collision, or ignore
    async fn on_inbound_request(self: &Arc<Self>, msg: SignalingMessage) {
        let from = msg.from.clone();
        let offer = matches!(msg.payload, SignalingPayload::OfferSdp { .. }).then_some(msg);

        let mut inner = self.inner.lock().await;
        let replay: Option<Replay> = if let Some(session) = inner.session.as_mut() {
            if session.remote != from {
                debug!(peer = %from, current = %session.remote, "busy, ignoring request");
                return;
            }
            match session.role {
                Role::Responder => match (&session.engine, offer) {
                    (Some(engine), Some(offer)) => Some((engine.clone(), vec![offer])),
                    (None, Some(offer)) => {
                        session.deferred.push(offer);
                        None
                    }
                    // Repeated connect request
                    (_, None) => None,
                },
                Role::Initiator => {
                    if session.engaged {
                        debug!(peer = %from, "request from peer already negotiating with us, ignoring");
                        return;
                    }
                    if !self.local_id.is_polite_towards(&from) {
                        debug!(peer = %from, "collision, we are impolite: keeping our offer");
                        return;
                    }
                    debug!(peer = %from, "collision, we are polite: accepting their offer");
                    if let Some(ours) = inner.session.take() {
                        self.close_session(ours, false).await;
                    }
                    self.accept_as_responder(&mut inner, from, offer)
                }
            }
        } else {
            let state = inner.state;
            let mode = Self::op_mode(&inner).cloned();
            match state {
                SessionState::Idle if self.config.auto_accept => {
                    info!(peer = %from, "accepting inbound connection");
                    self.begin_op(&mut inner, ConnectMode::Accept(from.clone()), None);
                    self.accept_as_responder(&mut inner, from, offer)
                }
                SessionState::Connecting | SessionState::Searching
                    if mode == Some(ConnectMode::Discover) || mode == Some(ConnectMode::Direct(from.clone())) =>
                {
                    self.accept_as_responder(&mut inner, from, offer)
                }
                state => {
                    debug!(peer = %from, %state, "not accepting connections, ignoring request");
                    return;
                }
            }
        };

        drop(inner);
        if let Some(replay) = replay {
            Self::replay(replay).await;
        }
    }

    fn accept_as_responder(
        self: &Arc<Self>,
        inner: &mut Inner,
        from: PeerId,
        offer: Option<SignalingMessage>,
    ) -> Option<Replay> {
        match self.open_session(inner, from, Role::Responder) {
            Some(engine) => Some((engine, offer.into_iter().collect())),
            None => {
                if let (Some(session), Some(offer)) = (inner.session.as_mut(), offer) {
                    session.deferred.push(offer);
                }
                None
            }
        }
    }

    async fn on_remote_disconnect(&self, from: PeerId) {
        let mut inner = self.inner.lock().await;
        if !inner.session.as_ref().is_some_and(|s| s.remote == from) {
            return;
        }
        info!(peer = %from, "remote peer disconnected");
        self.abandon_attempt(&mut inner, EndReason::RemoteDisconnect, false, false).await;
    }

    // ------------------------------------------------------------------------
    // Component events
    // ------------------------------------------------------------------------

    async fn on_internal(self: &Arc<Self>, event: RouterEvent) {
        match event {
            RouterEvent::Negotiation { session, event } => self.on_negotiation_event(session, event).await,
            RouterEvent::Channel { session, event } => self.on_channel_event(session, event).await,
            RouterEvent::RequestTimeout { session } => self.on_request_timeout(session).await,
        }
    }

    fn is_current(inner: &Inner, session: u64) -> bool {
        inner.session.as_ref().is_some_and(|s| s.id == session)
    }

    async fn on_request_timeout(&self, session: u64) {
        let mut inner = self.inner.lock().await;
        if !Self::is_current(&inner, session) {
            debug!(session, "stale request timer");
            return;
        }
        let Some(current) = inner.session.as_ref() else { return };
        if current.engaged || current.connected {
            return;
        }
        let remote = current.remote.clone();
        warn!(peer = %remote, "peer did not respond, treating it as gone");
        self.abandon_attempt(&mut inner, EndReason::PeerUnreachable(remote), true, true)
            .await;
    }

    async fn on_negotiation_event(&self, session_id: u64, event: NegotiationEvent) {
        let mut inner = self.inner.lock().await;
        if !Self::is_current(&inner, session_id) {
            debug!(session = session_id, ?event, "stale negotiation event");
            return;
        }

        match event {
            NegotiationEvent::StateChanged(state) => {
                if state.descriptions_exchanged() {
                    if let Some(session) = inner.session.as_mut() {
                        session.engaged = true;
                    }
                }
            }
            NegotiationEvent::ChannelReady(channel) => {
                let Some(session) = inner.session.as_mut() else { return };
                if session.protocol.is_some() {
                    return;
                }
                let (tx, mut rx) = mpsc::unbounded_channel();
                session.protocol = Some(DataChannelProtocol::start(channel, self.config.channel.clone(), tx));
                let router = self.router_tx.clone();
                session.tasks.push(tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        if router.send(RouterEvent::Channel { session: session_id, event }).is_err() {
                            break;
                        }
                    }
                }));
            }
            NegotiationEvent::Connected => {
                let Some(session) = inner.session.as_mut() else { return };
                session.engaged = true;
                if session.connected {
                    return;
                }
                session.connected = true;
                let remote = session.remote.clone();

                self.set_state(&mut inner, SessionState::Connected);
                // The op task may still be replaying deferred signaling; it exits once it sees no op
                Self::detach_op_task(&mut inner);
                if let Some(mut op) = inner.op.take() {
                    if let Some(outcome) = op.outcome.take() {
                        let _ = outcome.send(Ok(remote.clone()));
                    }
                }
                // No longer available for new connections
                self.presence.withdraw(&self.local_id).await;
                info!(peer = %remote, "connected");
                self.emit(SessionEvent::PeerConnected(remote));
            }
            NegotiationEvent::RemoteTrack(kind) => self.emit(SessionEvent::RemoteTrack(kind)),
            NegotiationEvent::IceRestarting { attempt } => self.emit(SessionEvent::IceRestarting { attempt }),
            NegotiationEvent::Failed(error) => {
                self.abandon_attempt(&mut inner, EndReason::NegotiationFailed(error), false, true)
                    .await;
            }
        }
    }

    async fn on_channel_event(&self, session_id: u64, event: ProtocolEvent) {
        let mut inner = self.inner.lock().await;
        if !Self::is_current(&inner, session_id) {
            debug!(session = session_id, ?event, "stale channel event");
            return;
        }

        match event {
            ProtocolEvent::Chat(message) => self.emit(SessionEvent::MessageReceived(message)),
            ProtocolEvent::TypingStarted => self.emit(SessionEvent::PeerTyping(true)),
            ProtocolEvent::TypingStopped => self.emit(SessionEvent::PeerTyping(false)),
            ProtocolEvent::PeerResponsive => self.emit(SessionEvent::PeerResponsive),
            ProtocolEvent::PeerUnresponsive => {
                self.emit(SessionEvent::PeerUnresponsive);
                if self.config.disconnect_on_unresponsive && inner.state == SessionState::Connected {
                    self.end(&mut inner, EndReason::PeerUnresponsive, true).await;
                }
            }
            ProtocolEvent::Closed => {
                if inner.state == SessionState::Connected {
                    self.end(&mut inner, EndReason::ChannelClosed, false).await;
                }
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.router.lock() {
            if let Some(router) = slot.take() {
                router.abort();
            }
        }
    }
}
