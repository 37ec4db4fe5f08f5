//! WebSocket relay signaling transport
//!
//! Each peer holds one WebSocket to a relay. The first frame registers the
//! peer id; after that every text frame is one JSON `SignalingMessage`. The
//! relay forwards directed messages to their recipient and broadcasts to
//! everyone else.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::transport::{SignalingTransport, Subscription, TransportError};
use crate::types::{PeerId, SignalingKind, SignalingMessage};

/// Control frames between a peer and the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayControl {
    Register {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

impl RelayControl {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Signaling over a WebSocket relay
pub struct RelayTransport {
    peer_id: PeerId,
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    dispatcher: Arc<Dispatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayTransport {
    /// Connect to the relay at `url` and register as `peer_id`
    pub async fn connect(url: &str, peer_id: PeerId) -> Result<Self, TransportError> {
        info!("Connecting to relay: {}", url);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let register = RelayControl::Register {
            peer_id: peer_id.clone(),
        }
        .to_json()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        write
            .send(Message::Text(register))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        info!(peer = %peer_id, "registered with relay {}", url);

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if let Err(e) = write.send(frame).await {
                    warn!("relay write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let dispatcher = Arc::new(Dispatcher::new());
        let sink = dispatcher.clone();
        let me = peer_id.clone();
        let relay_url = url.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(msg) if msg.is_for(&me) => sink.dispatch(msg),
                        Ok(msg) => debug!(to = %msg.to, "relay frame not for us"),
                        Err(e) => warn!("malformed signaling frame from relay: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", relay_url, e);
                        break;
                    }
                }
            }
            warn!("WebSocket closed: {}", relay_url);
            sink.close();
        });

        Ok(Self {
            peer_id,
            url: url.to_string(),
            outbound,
            dispatcher,
            tasks: Mutex::new(vec![writer, reader]),
            closed: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl SignalingTransport for RelayTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn subscribe(&self, kinds: &[SignalingKind]) -> Subscription {
        self.dispatcher.subscribe(kinds)
    }

    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let text = msg.to_json().map_err(|e| TransportError::SendFailed(e.to_string()))?;
        debug!(to = %msg.to, kind = ?msg.kind(), "relay send");
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The writer exits after flushing the close frame; the reader once the relay hangs up
        let _ = self.outbound.send(Message::Close(None));
        self.dispatcher.close();
        debug!(peer = %self.peer_id, "relay transport closed");
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
