//! Offer/answer/ICE negotiation for one session
//!
//! A `NegotiationEngine` owns exactly one underlying connection and drives it
//! from `New` to `Connected`, tolerating lost, duplicated and reordered
//! signaling:
//! - remote candidates that arrive before the remote description are parked
//!   and replayed once it is set; duplicates are ignored
//! - an unanswered offer and the gathered local candidates are resent on a
//!   bounded schedule, and the attempt fails at the negotiation timeout
//! - a duplicate offer makes the responder resend its cached answer
//! - ICE "disconnected" arms a recovery timer; "failed" restarts ICE at once;
//!   a second failure inside the failure window is fatal
//!
//! Every operation runs under one async lock, so handlers never interleave.
//! `close` does not take that lock and can interrupt an operation that is
//! waiting on the connection; the operation then discards its result.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NegotiationConfig;
use crate::media::{MediaHandle, TrackKind};
use crate::transport::{
    ConnectionEvent, ConnectionFactory, ConnectionStatus, DataChannel, MediaConnection, SignalingTransport,
    TransportError,
};
use crate::types::{
    IceCandidate, PeerId, SessionDescription, SignalingMessage, SignalingPayload, DATA_CHANNEL_LABEL,
};

/// Which side of the exchange we are; fixed for the engine's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    AwaitingOffer,
    AnswerExchanged,
    IceNegotiating,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }

    /// Offer and answer have both been applied
    pub fn descriptions_exchanged(&self) -> bool {
        matches!(
            self,
            NegotiationState::AnswerExchanged | NegotiationState::IceNegotiating | NegotiationState::Connected
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("operation invalid in state {0:?}")]
    InvalidState(NegotiationState),
    #[error("operation invalid for {0:?}")]
    WrongRole(Role),
    #[error("no answer to offer")]
    AnswerTimeout,
    #[error("negotiation timed out")]
    Timeout,
    #[error("ICE failed again after restart")]
    IceFailed,
    #[error("engine closed")]
    Closed,
}

/// Notifications for the session owning the engine
#[derive(Clone)]
pub enum NegotiationEvent {
    StateChanged(NegotiationState),
    Connected,
    /// The chat data channel is available
    ChannelReady(Arc<dyn DataChannel>),
    RemoteTrack(TrackKind),
    IceRestarting { attempt: u32 },
    Failed(NegotiationError),
}

impl fmt::Debug for NegotiationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            NegotiationEvent::Connected => write!(f, "Connected"),
            NegotiationEvent::ChannelReady(dc) => f.debug_tuple("ChannelReady").field(&dc.label()).finish(),
            NegotiationEvent::RemoteTrack(k) => f.debug_tuple("RemoteTrack").field(k).finish(),
            NegotiationEvent::IceRestarting { attempt } => {
                f.debug_struct("IceRestarting").field("attempt", attempt).finish()
            }
            NegotiationEvent::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

struct EngineInner {
    state: NegotiationState,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    applied_candidates: HashSet<IceCandidate>,
    /// Gathered for the current ICE generation, resent until connected
    local_candidates: Vec<IceCandidate>,
    local_channel: Option<Arc<dyn DataChannel>>,
    /// A chat channel was picked, possibly still opening
    channel_claimed: bool,
    /// The picked channel is open and was handed out
    channel_ready: bool,
    /// Initiator: our outstanding offer. Responder: the offer we answered.
    current_offer: Option<String>,
    offer_is_restart: bool,
    cached_answer: Option<String>,
    /// Bumped for every offer/answer round; tags deadline and retransmit timers
    round: u64,
    status: ConnectionStatus,
    recovery_epoch: u64,
    last_failure: Option<Instant>,
    restarts: u32,
}

#[derive(Default)]
struct EngineTasks {
    pump: Option<JoinHandle<()>>,
    retransmit: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
    channel_open: Option<JoinHandle<()>>,
}

impl EngineTasks {
    fn abort_all(&mut self) {
        for task in [
            self.pump.take(),
            self.retransmit.take(),
            self.deadline.take(),
            self.recovery.take(),
            self.channel_open.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

pub struct NegotiationEngine {
    local_id: PeerId,
    remote_id: PeerId,
    role: Role,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<dyn ConnectionFactory>,
    media: Option<MediaHandle>,
    config: NegotiationConfig,
    inner: Mutex<EngineInner>,
    connection: StdMutex<Option<Arc<dyn MediaConnection>>>,
    tasks: StdMutex<EngineTasks>,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<NegotiationEvent>,
}

impl NegotiationEngine {
    pub fn new(
        local_id: PeerId,
        remote_id: PeerId,
        role: Role,
        signaling: Arc<dyn SignalingTransport>,
        factory: Arc<dyn ConnectionFactory>,
        media: Option<MediaHandle>,
        config: NegotiationConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NegotiationEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            local_id,
            remote_id,
            role,
            signaling,
            factory,
            media,
            config,
            inner: Mutex::new(EngineInner {
                state: NegotiationState::New,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                applied_candidates: HashSet::new(),
                local_candidates: Vec::new(),
                local_channel: None,
                channel_claimed: false,
                channel_ready: false,
                current_offer: None,
                offer_is_restart: false,
                cached_answer: None,
                round: 0,
                status: ConnectionStatus::New,
                recovery_epoch: 0,
                last_failure: None,
                restarts: 0,
            }),
            connection: StdMutex::new(None),
            tasks: StdMutex::new(EngineTasks::default()),
            closed: AtomicBool::new(false),
            events,
        });
        (engine, rx)
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn remote_peer_id(&self) -> &PeerId {
        &self.remote_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn state(&self) -> NegotiationState {
        if self.closed.load(Ordering::Acquire) {
            return NegotiationState::Closed;
        }
        self.inner.lock().await.state
    }

    /// Candidates parked until the remote description is set
    pub async fn pending_candidate_count(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    /// ICE restarts issued or accepted so far
    pub async fn restart_count(&self) -> u32 {
        self.inner.lock().await.restarts
    }

    /// Create the connection and data channel, send the offer, move to `OfferSent`
    pub async fn start_as_initiator(self: &Arc<Self>) -> Result<(), NegotiationError> {
        if self.role != Role::Initiator {
            return Err(NegotiationError::WrongRole(self.role));
        }
        let mut inner = self.inner.lock().await;
        self.check_open(&mut inner)?;
        if inner.state != NegotiationState::New {
            return Err(NegotiationError::InvalidState(inner.state));
        }

        let result = self.open_as_initiator(&mut inner).await;
        self.fail_on_error(&mut inner, result)
    }

    async fn open_as_initiator(self: &Arc<Self>, inner: &mut EngineInner) -> Result<(), NegotiationError> {
        let conn = self.ensure_connection(inner).await?;
        let channel = conn.create_data_channel(DATA_CHANNEL_LABEL).await?;
        self.check_open(inner)?;
        inner.local_channel = Some(channel);
        self.send_offer(inner, &conn, false).await
    }

    /// Responder side: wait for the initiator's offer
    pub async fn await_offer(&self) -> Result<(), NegotiationError> {
        if self.role != Role::Responder {
            return Err(NegotiationError::WrongRole(self.role));
        }
        let mut inner = self.inner.lock().await;
        self.check_open(&mut inner)?;
        match inner.state {
            NegotiationState::New => {
                self.set_state(&mut inner, NegotiationState::AwaitingOffer);
                Ok(())
            }
            NegotiationState::AwaitingOffer => Ok(()),
            s => Err(NegotiationError::InvalidState(s)),
        }
    }

    /// Route one inbound signaling message from the remote peer
    pub async fn handle_signaling(self: &Arc<Self>, msg: SignalingMessage) -> Result<(), NegotiationError> {
        match msg.payload {
            SignalingPayload::OfferSdp { sdp, ice_restart } => {
                self.handle_offer_received(sdp, &msg.from, ice_restart).await
            }
            SignalingPayload::AnswerSdp { sdp } => self.handle_answer_received(sdp, &msg.from).await,
            SignalingPayload::IceCandidate { candidate } => {
                self.handle_ice_candidate_received(candidate, &msg.from).await
            }
            _ => Ok(()),
        }
    }

    /// Apply a remote offer and answer it
    ///
    /// Valid in `New`/`AwaitingOffer`. After answering, a repeat of the same
    /// offer resends the cached answer and an `iceRestart` offer is accepted.
    pub async fn handle_offer_received(
        self: &Arc<Self>,
        sdp: String,
        from: &PeerId,
        ice_restart: bool,
    ) -> Result<(), NegotiationError> {
        if from != &self.remote_id {
            warn!(from = %from, expected = %self.remote_id, "offer from unexpected peer, ignoring");
            return Ok(());
        }
        if self.role != Role::Responder {
            debug!(peer = %from, "offer received as initiator, ignoring");
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        self.check_open(&mut inner)?;

        let restart = match inner.state {
            NegotiationState::New | NegotiationState::AwaitingOffer => false,
            s if s.descriptions_exchanged() => {
                if inner.current_offer.as_deref() == Some(sdp.as_str()) {
                    debug!(peer = %from, "duplicate offer, resending answer");
                    if let Some(answer) = inner.cached_answer.clone() {
                        self.send_signal(SignalingPayload::AnswerSdp { sdp: answer }).await;
                    }
                    return Ok(());
                }
                if !ice_restart {
                    warn!(peer = %from, state = ?s, "unexpected offer, ignoring");
                    return Ok(());
                }
                true
            }
            s => {
                warn!(peer = %from, state = ?s, "offer received in wrong state, ignoring");
                return Ok(());
            }
        };

        let result = self.answer_offer(&mut inner, sdp, restart).await;
        self.fail_on_error(&mut inner, result)
    }

    async fn answer_offer(
        self: &Arc<Self>,
        inner: &mut EngineInner,
        sdp: String,
        restart: bool,
    ) -> Result<(), NegotiationError> {
        let conn = self.ensure_connection(inner).await?;
        if restart {
            inner.restarts += 1;
            inner.local_candidates.clear();
            info!(peer = %self.remote_id, attempt = inner.restarts, "accepting ICE restart");
            self.emit(NegotiationEvent::IceRestarting {
                attempt: inner.restarts,
            });
        }

        conn.set_remote_description(SessionDescription::offer(sdp.clone())).await?;
        self.check_open(inner)?;
        inner.remote_description_set = true;
        let applied = self.flush_pending(inner, &conn).await;

        let answer = conn.create_answer().await?;
        self.check_open(inner)?;
        conn.set_local_description(answer.clone()).await?;
        self.check_open(inner)?;

        inner.current_offer = Some(sdp);
        inner.cached_answer = Some(answer.sdp.clone());
        inner.round += 1;
        self.send_signal(SignalingPayload::AnswerSdp { sdp: answer.sdp }).await;

        if inner.state != NegotiationState::Connected {
            self.set_state(inner, NegotiationState::AnswerExchanged);
            if applied > 0 {
                self.set_state(inner, NegotiationState::IceNegotiating);
            }
            self.arm_deadline(inner.round);
        }
        self.arm_retransmit(inner.round);
        Ok(())
    }

    /// Apply the remote answer. Outside `OfferSent` this is a logged no-op.
    pub async fn handle_answer_received(&self, sdp: String, from: &PeerId) -> Result<(), NegotiationError> {
        if from != &self.remote_id {
            warn!(from = %from, expected = %self.remote_id, "answer from unexpected peer, ignoring");
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        self.check_open(&mut inner)?;
        if inner.state != NegotiationState::OfferSent {
            warn!(peer = %from, state = ?inner.state, "answer received outside OfferSent, ignoring");
            return Ok(());
        }

        let result = self.apply_answer(&mut inner, sdp).await;
        self.fail_on_error(&mut inner, result)
    }

    async fn apply_answer(&self, inner: &mut EngineInner, sdp: String) -> Result<(), NegotiationError> {
        let conn = self.current_connection().ok_or(NegotiationError::Closed)?;
        conn.set_remote_description(SessionDescription::answer(sdp)).await?;
        self.check_open(inner)?;
        inner.remote_description_set = true;
        self.set_state(inner, NegotiationState::AnswerExchanged);

        if self.flush_pending(inner, &conn).await > 0 {
            self.set_state(inner, NegotiationState::IceNegotiating);
        }
        Ok(())
    }

    /// Add a remote candidate, or park it until the remote description is set.
    /// Duplicates are accepted and ignored.
    pub async fn handle_ice_candidate_received(
        &self,
        candidate: IceCandidate,
        from: &PeerId,
    ) -> Result<(), NegotiationError> {
        if from != &self.remote_id {
            warn!(from = %from, expected = %self.remote_id, "candidate from unexpected peer, ignoring");
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) || inner.state.is_terminal() {
            return Ok(());
        }
        if inner.applied_candidates.contains(&candidate) {
            debug!(peer = %from, "duplicate candidate");
            return Ok(());
        }

        match self.current_connection() {
            Some(conn) if inner.remote_description_set => match conn.add_ice_candidate(candidate.clone()).await {
                Ok(()) => {
                    inner.applied_candidates.insert(candidate);
                    if inner.state == NegotiationState::AnswerExchanged {
                        self.set_state(&mut inner, NegotiationState::IceNegotiating);
                    }
                }
                Err(e) => warn!(peer = %from, "remote candidate rejected: {}", e),
            },
            _ => {
                if !inner.pending_candidates.contains(&candidate) {
                    inner.pending_candidates.push(candidate);
                }
            }
        }
        Ok(())
    }

    /// Tear down the connection and every timer. Safe to call at any time, more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_all();
        }
        let conn = self.connection.lock().ok().and_then(|mut c| c.take());
        if let Some(conn) = conn {
            conn.close().await;
        }
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.state = NegotiationState::Closed;
        }
        debug!(peer = %self.remote_id, "negotiation closed");
    }

    // ------------------------------------------------------------------------
    // Connection plumbing
    // ------------------------------------------------------------------------

    fn current_connection(&self) -> Option<Arc<dyn MediaConnection>> {
        self.connection.lock().ok().and_then(|c| c.clone())
    }

    async fn ensure_connection(
        self: &Arc<Self>,
        inner: &mut EngineInner,
    ) -> Result<Arc<dyn MediaConnection>, NegotiationError> {
        if let Some(conn) = self.current_connection() {
            return Ok(conn);
        }

        let (conn, mut events) = self.factory.create().await?;
        if let Some(media) = &self.media {
            conn.add_local_media(media).await?;
        }
        if let Ok(mut slot) = self.connection.lock() {
            *slot = Some(conn.clone());
        }
        if self.check_open(inner).is_err() {
            // Closed while the connection was being created
            let orphan = self.connection.lock().ok().and_then(|mut c| c.take());
            if let Some(orphan) = orphan {
                orphan.close().await;
            }
            return Err(NegotiationError::Closed);
        }

        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(engine) = weak.upgrade() else { break };
                engine.handle_connection_event(event).await;
            }
        });
        self.replace_task(|t| &mut t.pump, pump);
        Ok(conn)
    }

    async fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::IceCandidate(candidate) => {
                let mut inner = self.inner.lock().await;
                if self.closed.load(Ordering::Acquire) || inner.state.is_terminal() {
                    return;
                }
                inner.local_candidates.push(candidate.clone());
                self.send_signal(SignalingPayload::IceCandidate { candidate }).await;
            }
            ConnectionEvent::StatusChanged(status) => self.handle_status(status).await,
            ConnectionEvent::DataChannel(channel) => {
                if channel.label() != DATA_CHANNEL_LABEL {
                    debug!(label = channel.label(), "ignoring unknown data channel");
                    return;
                }
                let mut inner = self.inner.lock().await;
                if self.closed.load(Ordering::Acquire) || inner.state.is_terminal() {
                    return;
                }
                self.claim_channel(&mut inner, channel);
                self.mark_connected(&mut inner);
            }
            ConnectionEvent::RemoteTrack(kind) => self.emit(NegotiationEvent::RemoteTrack(kind)),
        }
    }

    async fn handle_status(self: &Arc<Self>, status: ConnectionStatus) {
        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) || inner.state.is_terminal() {
            return;
        }
        inner.status = status;
        debug!(peer = %self.remote_id, %status, "connection status");

        match status {
            ConnectionStatus::Checking => {
                if inner.state == NegotiationState::AnswerExchanged {
                    self.set_state(&mut inner, NegotiationState::IceNegotiating);
                }
            }
            ConnectionStatus::Connected => {
                inner.recovery_epoch += 1;
                inner.last_failure = None;
                self.cancel_task(|t| &mut t.recovery);
                if let Some(channel) = inner.local_channel.clone() {
                    self.claim_channel(&mut inner, channel);
                }
                self.mark_connected(&mut inner);
            }
            ConnectionStatus::Disconnected => {
                if inner.state.descriptions_exchanged() {
                    inner.recovery_epoch += 1;
                    self.arm_recovery(inner.recovery_epoch);
                }
            }
            ConnectionStatus::Failed => {
                let now = Instant::now();
                let window = self.config.ice_failure_window();
                if inner
                    .last_failure
                    .is_some_and(|at| now.duration_since(at) < window)
                {
                    self.fail(&mut inner, NegotiationError::IceFailed);
                    return;
                }
                inner.last_failure = Some(now);
                match self.role {
                    Role::Initiator => self.restart_ice(&mut inner).await,
                    Role::Responder => debug!(peer = %self.remote_id, "ICE failed, waiting for restart offer"),
                }
            }
            ConnectionStatus::New | ConnectionStatus::Closed => {}
        }
    }

    /// Take `channel` as the chat channel and hand it out once it is open
    fn claim_channel(self: &Arc<Self>, inner: &mut EngineInner, channel: Arc<dyn DataChannel>) {
        if inner.channel_claimed {
            return;
        }
        inner.channel_claimed = true;
        if channel.is_open() {
            self.channel_opened(inner, channel);
            return;
        }

        debug!(peer = %self.remote_id, label = channel.label(), "waiting for data channel to open");
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            if !channel.wait_open().await {
                debug!("data channel closed before opening");
                return;
            }
            let Some(engine) = weak.upgrade() else { return };
            let mut inner = engine.inner.lock().await;
            if engine.closed.load(Ordering::Acquire) || inner.state.is_terminal() {
                return;
            }
            engine.channel_opened(&mut inner, channel);
            engine.mark_connected(&mut inner);
        });
        self.replace_task(|t| &mut t.channel_open, handle);
    }

    fn channel_opened(&self, inner: &mut EngineInner, channel: Arc<dyn DataChannel>) {
        inner.channel_ready = true;
        self.emit(NegotiationEvent::ChannelReady(channel));
    }

    /// Connected needs both a working link and an open chat channel, so the session can send at once
    fn mark_connected(&self, inner: &mut EngineInner) {
        if inner.status != ConnectionStatus::Connected || !inner.channel_ready {
            return;
        }
        if inner.state != NegotiationState::Connected {
            self.set_state(inner, NegotiationState::Connected);
            info!(peer = %self.remote_id, role = ?self.role, "peer connection established");
            self.emit(NegotiationEvent::Connected);
        }
    }

    async fn restart_ice(self: &Arc<Self>, inner: &mut EngineInner) {
        let Some(conn) = self.current_connection() else { return };
        inner.restarts += 1;
        info!(peer = %self.remote_id, attempt = inner.restarts, "restarting ICE");
        self.emit(NegotiationEvent::IceRestarting {
            attempt: inner.restarts,
        });
        let result = self.send_offer(inner, &conn, true).await;
        let _ = self.fail_on_error(inner, result);
    }

    async fn send_offer(
        self: &Arc<Self>,
        inner: &mut EngineInner,
        conn: &Arc<dyn MediaConnection>,
        ice_restart: bool,
    ) -> Result<(), NegotiationError> {
        if ice_restart {
            // New credentials: old candidates are useless and the old answer no longer applies
            inner.local_candidates.clear();
            inner.remote_description_set = false;
        }
        let offer = conn.create_offer(ice_restart).await?;
        self.check_open(inner)?;
        conn.set_local_description(offer.clone()).await?;
        self.check_open(inner)?;

        inner.current_offer = Some(offer.sdp.clone());
        inner.offer_is_restart = ice_restart;
        inner.round += 1;
        self.set_state(inner, NegotiationState::OfferSent);
        self.send_signal(SignalingPayload::OfferSdp {
            sdp: offer.sdp,
            ice_restart,
        })
        .await;

        self.arm_deadline(inner.round);
        self.arm_retransmit(inner.round);
        Ok(())
    }

    async fn flush_pending(&self, inner: &mut EngineInner, conn: &Arc<dyn MediaConnection>) -> usize {
        let parked = std::mem::take(&mut inner.pending_candidates);
        if !parked.is_empty() {
            debug!(peer = %self.remote_id, count = parked.len(), "replaying parked candidates");
        }
        let mut applied = 0;
        for candidate in parked {
            if inner.applied_candidates.contains(&candidate) {
                continue;
            }
            match conn.add_ice_candidate(candidate.clone()).await {
                Ok(()) => {
                    inner.applied_candidates.insert(candidate);
                    applied += 1;
                }
                Err(e) => warn!(peer = %self.remote_id, "parked candidate rejected: {}", e),
            }
        }
        applied
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn arm_deadline(self: &Arc<Self>, round: u64) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.negotiation_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(engine) = weak.upgrade() {
                engine.on_deadline(round).await;
            }
        });
        self.replace_task(|t| &mut t.deadline, handle);
    }

    async fn on_deadline(&self, round: u64) {
        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) || inner.state.is_terminal() {
            return;
        }
        if inner.round != round {
            debug!(round, current = inner.round, "stale negotiation deadline");
            return;
        }
        let error = match inner.state {
            NegotiationState::Connected => return,
            NegotiationState::OfferSent => NegotiationError::AnswerTimeout,
            _ => NegotiationError::Timeout,
        };
        self.fail(&mut inner, error);
    }

    fn arm_retransmit(self: &Arc<Self>, round: u64) {
        let weak = Arc::downgrade(self);
        let interval = self.config.retransmit_interval();
        let max = self.config.max_retransmits;
        let handle = tokio::spawn(async move {
            for attempt in 1..=max {
                tokio::time::sleep(interval).await;
                let Some(engine) = weak.upgrade() else { return };
                if !engine.retransmit(round, attempt).await {
                    return;
                }
            }
        });
        self.replace_task(|t| &mut t.retransmit, handle);
    }

    /// Resend whatever the peer may have missed. Returns false once nothing is left to resend.
    async fn retransmit(&self, round: u64, attempt: u32) -> bool {
        let inner = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) || inner.round != round {
            return false;
        }
        match inner.state {
            NegotiationState::OfferSent => {
                let Some(sdp) = inner.current_offer.clone() else { return false };
                debug!(peer = %self.remote_id, attempt, "resending offer");
                self.send_signal(SignalingPayload::OfferSdp {
                    sdp,
                    ice_restart: inner.offer_is_restart,
                })
                .await;
                true
            }
            NegotiationState::AnswerExchanged | NegotiationState::IceNegotiating => {
                debug!(
                    peer = %self.remote_id,
                    attempt,
                    count = inner.local_candidates.len(),
                    "resending local candidates"
                );
                for candidate in inner.local_candidates.clone() {
                    self.send_signal(SignalingPayload::IceCandidate { candidate }).await;
                }
                true
            }
            _ => false,
        }
    }

    fn arm_recovery(self: &Arc<Self>, epoch: u64) {
        let weak = Arc::downgrade(self);
        let grace = self.config.ice_disconnect_grace();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(engine) = weak.upgrade() {
                engine.on_recovery_timer(epoch).await;
            }
        });
        self.replace_task(|t| &mut t.recovery, handle);
    }

    async fn on_recovery_timer(self: &Arc<Self>, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if self.closed.load(Ordering::Acquire) || inner.state.is_terminal() {
            return;
        }
        if inner.recovery_epoch != epoch {
            debug!(epoch, "stale recovery timer");
            return;
        }
        if inner.status == ConnectionStatus::Connected {
            return;
        }
        match self.role {
            Role::Initiator => self.restart_ice(&mut inner).await,
            Role::Responder => debug!(peer = %self.remote_id, "still disconnected, waiting for restart offer"),
        }
    }

    fn replace_task(&self, slot: impl FnOnce(&mut EngineTasks) -> &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
        if self.closed.load(Ordering::Acquire) {
            handle.abort();
            return;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old) = slot(&mut tasks).replace(handle) {
                old.abort();
            }
        }
    }

    fn cancel_task(&self, slot: impl FnOnce(&mut EngineTasks) -> &mut Option<JoinHandle<()>>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old) = slot(&mut tasks).take() {
                old.abort();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn check_open(&self, inner: &mut EngineInner) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::Acquire) {
            inner.state = NegotiationState::Closed;
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    fn fail_on_error(&self, inner: &mut EngineInner, result: Result<(), NegotiationError>) -> Result<(), NegotiationError> {
        if let Err(e) = &result {
            if !matches!(e, NegotiationError::Closed) {
                self.fail(inner, e.clone());
            }
        }
        result
    }

    fn fail(&self, inner: &mut EngineInner, error: NegotiationError) {
        if inner.state.is_terminal() {
            return;
        }
        warn!(peer = %self.remote_id, "negotiation failed: {}", error);
        self.set_state(inner, NegotiationState::Failed);
        self.emit(NegotiationEvent::Failed(error));
    }

    fn set_state(&self, inner: &mut EngineInner, state: NegotiationState) {
        if inner.state != state {
            debug!(peer = %self.remote_id, from = ?inner.state, to = ?state, "negotiation state");
            inner.state = state;
            self.emit(NegotiationEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: NegotiationEvent) {
        let _ = self.events.send(event);
    }

    async fn send_signal(&self, payload: SignalingPayload) {
        let msg = SignalingMessage::new(self.local_id.clone(), self.remote_id.clone(), payload);
        if let Err(e) = self.signaling.send(msg).await {
            debug!(peer = %self.remote_id, "signaling send failed: {}", e);
        }
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_all();
        }
    }
}
