//! Interactive chat over a signaling relay and real WebRTC

use anyhow::{Context, Result};
use peerchat::{
    NullMedia, PeerId, PresenceRegistry, RelayTransport, SessionConfig, SessionEvent, SessionStateMachine,
    SignalingTransport, WebRtcConnectionFactory,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::warn;

pub struct ChatOptions {
    pub relay_url: String,
    /// Connect to this peer instead of a random announced one
    pub peer: Option<PeerId>,
    pub id: Option<PeerId>,
    pub stun_servers: Vec<String>,
    pub session: SessionConfig,
}

/// Join the relay, connect and chat until `/quit` or end of input
pub async fn run(opts: ChatOptions) -> Result<()> {
    let id = opts.id.unwrap_or_else(PeerId::generate);
    let transport = Arc::new(
        RelayTransport::connect(&opts.relay_url, id.clone())
            .await
            .with_context(|| format!("Failed to connect to relay {}", opts.relay_url))?,
    );
    let presence = PresenceRegistry::new(transport.clone(), opts.session.presence.clone());
    let session = SessionStateMachine::new(
        transport.clone(),
        presence.clone(),
        Arc::new(WebRtcConnectionFactory::new(opts.stun_servers)),
        Arc::new(NullMedia),
        opts.session,
    );

    println!("You are {}", id);
    println!("Type a message and press enter. /typing sends a typing signal, /quit leaves.");
    let printer = tokio::spawn(print_events(session.subscribe()));

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move {
            let result = match opts.peer {
                Some(peer) => {
                    println!("*** connecting to {}", peer);
                    session.connect_to(peer).await
                }
                None => {
                    println!("*** looking for someone to talk to");
                    session.connect().await
                }
            };
            if let Err(e) = result {
                println!("*** could not connect: {}", e);
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/typing" => {
                if let Err(e) = session.send_typing().await {
                    println!("*** {}", e);
                }
            }
            text => {
                if let Err(e) = session.send_message(text).await {
                    println!("*** not sent: {}", e);
                }
            }
        }
    }

    connecting.abort();
    session.shutdown().await;
    presence.shutdown();
    transport.close().await;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PeerConnected(peer)) => println!("*** connected to {}", peer),
            Ok(SessionEvent::MessageReceived(msg)) => println!("<peer> {}", msg.content),
            Ok(SessionEvent::PeerTyping(true)) => println!("*** peer is typing..."),
            Ok(SessionEvent::PeerUnresponsive) => println!("*** peer is not responding"),
            Ok(SessionEvent::PeerResponsive) => println!("*** peer is back"),
            Ok(SessionEvent::RemoteTrack(kind)) => println!("*** receiving remote {}", kind),
            Ok(SessionEvent::IceRestarting { attempt }) => println!("*** reconnecting (attempt {})", attempt),
            Ok(SessionEvent::Ended(reason)) => println!("*** session ended: {:?}", reason),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("missed {} session events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
