//! Two in-process peers chatting over the broadcast bus and mock network

use anyhow::{bail, Context, Result};
use peerchat::{
    BroadcastBus, ChatMessage, Direction, MockMedia, MockNetwork, PeerId, PresenceRegistry, SessionConfig,
    SessionEvent, SessionStateMachine,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::info;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings that make the demo finish in well under a second
pub fn fast_config() -> SessionConfig {
    let mut config = SessionConfig {
        search_timeout_ms: 5_000,
        search_poll_interval_ms: 100,
        ..Default::default()
    };
    config.presence.announce_interval_ms = 100;
    config
}

fn spawn_peer(bus: &Arc<BroadcastBus>, net: &MockNetwork, config: &SessionConfig) -> SessionStateMachine {
    let transport = Arc::new(bus.connect(PeerId::generate()));
    let presence = PresenceRegistry::new(transport.clone(), config.presence.clone());
    SessionStateMachine::new(
        transport,
        presence,
        Arc::new(net.factory()),
        Arc::new(MockMedia::new()),
        config.clone(),
    )
}

async fn next_message(events: &mut broadcast::Receiver<SessionEvent>) -> Result<ChatMessage> {
    loop {
        let event = timeout(DELIVERY_TIMEOUT, events.recv())
            .await
            .context("Message was not delivered")?
            .context("Session event stream closed")?;
        match event {
            SessionEvent::MessageReceived(msg) => return Ok(msg),
            SessionEvent::Ended(reason) => bail!("Session ended early: {:?}", reason),
            _ => {}
        }
    }
}

fn print_transcript(name: &str, transcript: &[ChatMessage]) {
    println!("{}:", name);
    for msg in transcript {
        let who = match msg.direction {
            Direction::Local => "me",
            Direction::Remote => "them",
        };
        println!("  [{}] {}", who, msg.content);
    }
}

/// Connect two peers through discovery, trade two messages and return both transcripts
pub async fn run(config: SessionConfig) -> Result<(Vec<ChatMessage>, Vec<ChatMessage>)> {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = spawn_peer(&bus, &net, &config);
    let bob = spawn_peer(&bus, &net, &config);
    info!(alice = %alice.local_peer_id(), bob = %bob.local_peer_id(), "demo peers created");

    let (a, b) = tokio::join!(alice.connect(), bob.connect());
    let a = a.context("First peer could not connect")?;
    let b = b.context("Second peer could not connect")?;
    println!("{} <-> {}", b, a);

    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    alice.send_message("hello").await?;
    next_message(&mut bob_events).await?;
    bob.send_message("hi").await?;
    next_message(&mut alice_events).await?;

    let transcripts = (alice.transcript().await, bob.transcript().await);
    print_transcript(alice.local_peer_id().as_str(), &transcripts.0);
    print_transcript(bob.local_peer_id().as_str(), &transcripts.1);

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(transcripts)
}
