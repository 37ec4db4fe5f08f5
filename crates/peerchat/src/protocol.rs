//! Chat protocol over an open data channel
//!
//! Frames chat, typing and ping messages, keeps the transcript, tracks the
//! peer's typing indicator and checks liveness. Events go out on an mpsc
//! channel so the owner decides what to do about them.

use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::transport::{DataChannel, TransportError};
use crate::types::{now_ms, ChannelMessage, ChatMessage, Direction};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("data channel is not open")]
    NotOpen,
    #[error("send failed: {0}")]
    Send(#[from] TransportError),
    #[error("encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Chat(ChatMessage),
    TypingStarted,
    TypingStopped,
    /// No traffic for the configured number of ping intervals
    PeerUnresponsive,
    PeerResponsive,
    /// The remote closed the channel
    Closed,
}

struct ProtocolState {
    transcript: Vec<ChatMessage>,
    typing_until: Option<Instant>,
    typing_timer: Option<JoinHandle<()>>,
    last_inbound: Instant,
    unresponsive: bool,
}

pub struct DataChannelProtocol {
    channel: Arc<dyn DataChannel>,
    config: ChannelConfig,
    state: Mutex<ProtocolState>,
    events: mpsc::UnboundedSender<ProtocolEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataChannelProtocol {
    /// Wrap `channel` and start the reader and keepalive tasks
    pub fn start(
        channel: Arc<dyn DataChannel>,
        config: ChannelConfig,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> Arc<Self> {
        let protocol = Arc::new(Self {
            channel: channel.clone(),
            config,
            state: Mutex::new(ProtocolState {
                transcript: Vec::new(),
                typing_until: None,
                typing_timer: None,
                last_inbound: Instant::now(),
                unresponsive: false,
            }),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let reader = {
            let weak = Arc::downgrade(&protocol);
            tokio::spawn(async move {
                while let Some(data) = channel.recv().await {
                    let Some(protocol) = weak.upgrade() else { return };
                    protocol.handle_inbound(&data);
                }
                if let Some(protocol) = weak.upgrade() {
                    debug!(label = protocol.channel.label(), "data channel closed by peer");
                    protocol.emit(ProtocolEvent::Closed);
                }
            })
        };

        let keepalive = {
            let weak = Arc::downgrade(&protocol);
            let period = protocol.config.ping_interval();
            let channel = protocol.channel.clone();
            tokio::spawn(async move {
                if !channel.wait_open().await {
                    return;
                }
                drop(channel);
                // First tick fires at once: ping on open
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let Some(protocol) = weak.upgrade() else { return };
                    protocol.check_liveness();
                    if protocol.channel.is_open() {
                        if let Err(e) = protocol.send_frame(&ChannelMessage::Ping { sent_at: now_ms() }).await {
                            debug!("ping failed: {}", e);
                        }
                    }
                }
            })
        };

        if let Ok(mut tasks) = protocol.tasks.lock() {
            tasks.push(reader);
            tasks.push(keepalive);
        }
        protocol
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Send a chat message. Nothing is buffered: fails when the channel is not open.
    pub async fn send_chat(&self, content: impl Into<String>) -> Result<ChatMessage, ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::NotOpen);
        }
        let content = content.into();
        let sent_at = now_ms();
        self.send_frame(&ChannelMessage::Chat {
            content: content.clone(),
            sent_at,
        })
        .await?;

        let message = ChatMessage {
            content,
            sent_at,
            direction: Direction::Local,
        };
        if let Ok(mut state) = self.state.lock() {
            state.transcript.push(message.clone());
        }
        Ok(message)
    }

    /// Send one typing signal. Throttling is up to the caller.
    pub async fn send_typing(&self) -> Result<(), ProtocolError> {
        if !self.is_open() {
            return Err(ProtocolError::NotOpen);
        }
        self.send_frame(&ChannelMessage::Typing { sent_at: now_ms() }).await
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        self.state.lock().map(|s| s.transcript.clone()).unwrap_or_default()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.typing_until.is_some_and(|until| Instant::now() < until))
            .unwrap_or(false)
    }

    pub fn is_peer_unresponsive(&self) -> bool {
        self.state.lock().map(|s| s.unresponsive).unwrap_or(false)
    }

    /// Stop the background tasks and close the channel
    pub async fn close(&self) {
        self.stop_tasks();
        self.channel.close().await;
    }

    fn stop_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut state) = self.state.lock() {
            if let Some(timer) = state.typing_timer.take() {
                timer.abort();
            }
        }
    }

    async fn send_frame(&self, msg: &ChannelMessage) -> Result<(), ProtocolError> {
        let bytes = msg.encode().map_err(|e| ProtocolError::Encode(e.to_string()))?;
        self.channel.send(bytes).await?;
        Ok(())
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.events.send(event);
    }

    fn handle_inbound(self: &Arc<Self>, data: &[u8]) {
        let msg = match ChannelMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(len = data.len(), "dropping malformed channel message: {}", e);
                return;
            }
        };

        let Ok(mut state) = self.state.lock() else { return };
        state.last_inbound = Instant::now();
        if state.unresponsive {
            state.unresponsive = false;
            self.emit(ProtocolEvent::PeerResponsive);
        }

        match msg {
            ChannelMessage::Chat { content, sent_at } => {
                let message = ChatMessage {
                    content,
                    sent_at,
                    direction: Direction::Remote,
                };
                state.transcript.push(message.clone());
                self.emit(ProtocolEvent::Chat(message));
                // A message ends the typing burst that produced it
                if state.typing_until.take().is_some() {
                    if let Some(timer) = state.typing_timer.take() {
                        timer.abort();
                    }
                    self.emit(ProtocolEvent::TypingStopped);
                }
            }
            ChannelMessage::Typing { .. } => {
                let was_typing = state.typing_until.is_some();
                let timeout = self.config.typing_timeout();
                state.typing_until = Some(Instant::now() + timeout);
                if let Some(timer) = state.typing_timer.take() {
                    timer.abort();
                }
                state.typing_timer = Some(self.spawn_typing_timer(timeout));
                if !was_typing {
                    self.emit(ProtocolEvent::TypingStarted);
                }
            }
            ChannelMessage::Ping { .. } => {}
        }
    }

    fn spawn_typing_timer(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(protocol) = weak.upgrade() {
                protocol.expire_typing();
            }
        })
    }

    fn expire_typing(&self) {
        let Ok(mut state) = self.state.lock() else { return };
        match state.typing_until {
            Some(until) if Instant::now() >= until => {
                state.typing_until = None;
                state.typing_timer = None;
                self.emit(ProtocolEvent::TypingStopped);
            }
            _ => {}
        }
    }

    fn check_liveness(&self) {
        let Ok(mut state) = self.state.lock() else { return };
        if !state.unresponsive && state.last_inbound.elapsed() >= self.config.unresponsive_after() {
            state.unresponsive = true;
            warn!("peer silent for {:?}", state.last_inbound.elapsed());
            self.emit(ProtocolEvent::PeerUnresponsive);
        }
    }
}

impl Drop for DataChannelProtocol {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
