//! WebSocket signaling relay
//!
//! Peers register with a `register` frame, then send signaling messages as
//! text frames. Directed messages go to their recipient only; broadcast
//! messages go to every other registered peer. Frames are forwarded as
//! received so fields this relay does not know survive the hop.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use peerchat::{PeerId, RelayControl, SignalingMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

type Clients = Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<Message>>>>;

pub struct RelayServer {
    listener: TcpListener,
    clients: Clients,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind relay on {}", addr))?;
        Ok(Self {
            listener,
            clients: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Relay has no local address")
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!("Signaling relay listening on ws://{}", self.local_addr()?);
        loop {
            let (stream, addr) = self.listener.accept().await.context("Accept failed")?;
            tokio::spawn(handle_connection(stream, addr, self.clients.clone()));
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, clients: Clients) {
    let ws_stream = match accept_async(stream).await {
        Ok(s) => s,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    // The first text frame names the peer
    let peer_id = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match RelayControl::from_json(&text) {
                Ok(RelayControl::Register { peer_id }) => break peer_id,
                Err(e) => {
                    warn!("{} sent {} before registering", addr, e);
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            },
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    };
    if peer_id.is_broadcast() {
        warn!("{} tried to register the broadcast address", addr);
        let _ = write.send(Message::Close(None)).await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if clients.write().await.insert(peer_id.clone(), tx.clone()).is_some() {
        info!(peer = %peer_id, "re-registered, replacing older connection");
    } else {
        info!(peer = %peer_id, "registered from {}", addr);
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.send(frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = read.next().await {
        let text = match frame {
            Ok(Message::Text(t)) => t,
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(peer = %peer_id, "read error: {}", e);
                break;
            }
        };

        let msg = match SignalingMessage::from_json(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %peer_id, "dropping malformed frame: {}", e);
                continue;
            }
        };
        if msg.from != peer_id {
            warn!(peer = %peer_id, claimed = %msg.from, "dropping frame with forged sender");
            continue;
        }
        forward(&clients, &peer_id, &msg, text).await;
    }

    // A newer connection for the same id keeps its slot
    {
        let mut map = clients.write().await;
        if map.get(&peer_id).is_some_and(|current| current.same_channel(&tx)) {
            map.remove(&peer_id);
        }
    }
    drop(tx);
    writer.abort();
    info!(peer = %peer_id, "disconnected");
}

async fn forward(clients: &Clients, sender: &PeerId, msg: &SignalingMessage, text: String) {
    let map = clients.read().await;
    if msg.to.is_broadcast() {
        let mut delivered = 0;
        for (peer, tx) in map.iter().filter(|(peer, _)| *peer != sender) {
            if tx.send(Message::Text(text.clone())).is_ok() {
                delivered += 1;
            } else {
                debug!(peer = %peer, "recipient gone");
            }
        }
        debug!(from = %sender, kind = ?msg.kind(), delivered, "broadcast");
    } else if let Some(tx) = map.get(&msg.to) {
        let _ = tx.send(Message::Text(text));
        debug!(from = %sender, to = %msg.to, kind = ?msg.kind(), "forwarded");
    } else {
        debug!(from = %sender, to = %msg.to, "recipient not registered, dropping");
    }
}
