//! End-to-end session lifecycle over the in-process bus and mock network

use peerchat::{
    BroadcastBus, BusTransport, Direction, EndReason, FaultConfig, MediaError, MockMedia, MockNetwork, NegotiationError, PeerId,
    PresenceConfig, PresenceRegistry, SessionConfig, SessionError, SessionEvent, SessionState, SessionStateMachine,
    SignalingTransport, TrackKind,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

struct Peer {
    machine: SessionStateMachine,
    presence: Arc<PresenceRegistry>,
    transport: Arc<BusTransport>,
}

fn config() -> SessionConfig {
    SessionConfig {
        search_timeout_ms: 3_000,
        search_poll_interval_ms: 50,
        connect_request_timeout_ms: 1_000,
        presence: PresenceConfig {
            ttl_ms: 3_000,
            announce_interval_ms: 100,
        },
        ..Default::default()
    }
}

fn peer(bus: &Arc<BroadcastBus>, net: &MockNetwork, id: &str, media: MockMedia, config: SessionConfig) -> Peer {
    let transport = Arc::new(bus.connect(PeerId::new(id)));
    let presence = PresenceRegistry::new(transport.clone(), config.presence.clone());
    let machine = SessionStateMachine::new(
        transport.clone(),
        presence.clone(),
        Arc::new(net.factory()),
        Arc::new(media),
        config,
    );
    Peer {
        machine,
        presence,
        transport,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_state(machine: &SessionStateMachine, state: SessionState) {
    eventually(&format!("state {}", state), || async { machine.state().await == state }).await;
}

async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> (SessionEvent, Vec<SessionEvent>) {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timed out")
            .expect("event stream closed");
        if pred(&event) {
            return (event, seen);
        }
        seen.push(event);
    }
}

async fn connected_pair(bus: &Arc<BroadcastBus>, net: &MockNetwork) -> (Peer, Peer) {
    let alice = peer(bus, net, "user_alice", MockMedia::new(), config());
    let bob = peer(bus, net, "user_bob", MockMedia::new(), config());
    let remote = alice.machine.connect_to(PeerId::new("user_bob")).await.unwrap();
    assert_eq!(remote, PeerId::new("user_bob"));
    wait_state(&bob.machine, SessionState::Connected).await;
    (alice, bob)
}

#[tokio::test]
async fn test_connect_to_and_chat() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let (alice, bob) = connected_pair(&bus, &net).await;

    assert_eq!(alice.machine.state().await, SessionState::Connected);
    assert_eq!(alice.machine.remote_peer_id().await, Some(PeerId::new("user_bob")));
    assert_eq!(bob.machine.remote_peer_id().await, Some(PeerId::new("user_alice")));

    let mut bob_events = bob.machine.subscribe();
    let sent = alice.machine.send_message("hello").await.unwrap();
    assert_eq!(sent.direction, Direction::Local);
    let (received, _) = next_event(&mut bob_events, |e| matches!(e, SessionEvent::MessageReceived(_))).await;
    let SessionEvent::MessageReceived(received) = received else { unreachable!() };
    assert_eq!(received.content, "hello");
    assert_eq!(received.direction, Direction::Remote);

    bob.machine.send_message("hi").await.unwrap();
    eventually("alice transcript", || async { alice.machine.transcript().await.len() == 2 }).await;

    let alice_log: Vec<_> = alice
        .machine
        .transcript()
        .await
        .into_iter()
        .map(|m| (m.content, m.direction))
        .collect();
    assert_eq!(
        alice_log,
        vec![("hello".to_string(), Direction::Local), ("hi".to_string(), Direction::Remote)]
    );
    let bob_log: Vec<_> = bob.machine.transcript().await.into_iter().map(|m| m.direction).collect();
    assert_eq!(bob_log, vec![Direction::Remote, Direction::Local]);

    // Connected peers are no longer offered to others
    assert!(bob.presence.list_active(&PeerId::new("user_bob")).peer_ids().is_empty());
}

#[tokio::test]
async fn test_typing_indicator_reaches_peer() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let (alice, bob) = connected_pair(&bus, &net).await;
    let mut bob_events = bob.machine.subscribe();

    alice.machine.send_typing().await.unwrap();
    next_event(&mut bob_events, |e| *e == SessionEvent::PeerTyping(true)).await;
    assert!(bob.machine.is_peer_typing().await);

    // A chat message clears the indicator
    alice.machine.send_message("done typing").await.unwrap();
    next_event(&mut bob_events, |e| *e == SessionEvent::PeerTyping(false)).await;
    assert!(!bob.machine.is_peer_typing().await);
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_reaches_remote() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let (alice, bob) = connected_pair(&bus, &net).await;
    let mut bob_events = bob.machine.subscribe();

    alice.machine.disconnect().await;
    alice.machine.disconnect().await;
    assert_eq!(alice.machine.state().await, SessionState::Idle);
    assert_eq!(alice.machine.remote_peer_id().await, None);

    let (ended, _) = next_event(&mut bob_events, |e| matches!(e, SessionEvent::Ended(_))).await;
    // The channel may close before the Disconnect message lands
    assert!(matches!(
        ended,
        SessionEvent::Ended(EndReason::RemoteDisconnect) | SessionEvent::Ended(EndReason::ChannelClosed)
    ));
    assert_eq!(bob.machine.state().await, SessionState::Idle);
    eventually("connections closed", || async { net.open_connection_count() == 0 }).await;

    assert_eq!(
        alice.machine.send_message("anyone?").await.unwrap_err(),
        SessionError::InvalidState(SessionState::Idle)
    );
}

#[tokio::test]
async fn test_connected_session_outlives_signaling() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let (alice, bob) = connected_pair(&bus, &net).await;
    let mut bob_events = bob.machine.subscribe();

    bob.transport.close().await;

    alice.machine.send_message("still there?").await.unwrap();
    let (received, _) = next_event(&mut bob_events, |e| matches!(e, SessionEvent::MessageReceived(_))).await;
    let SessionEvent::MessageReceived(received) = received else { unreachable!() };
    assert_eq!(received.content, "still there?");

    bob.machine.send_message("yes").await.unwrap();
    eventually("alice transcript", || async { alice.machine.transcript().await.len() == 2 }).await;

    // Without signaling, the closing channel is what ends bob's side
    alice.machine.disconnect().await;
    let (ended, _) = next_event(&mut bob_events, |e| matches!(e, SessionEvent::Ended(_))).await;
    assert_eq!(ended, SessionEvent::Ended(EndReason::ChannelClosed));
    wait_state(&bob.machine, SessionState::Idle).await;
}

#[tokio::test]
async fn test_slow_responder_media_still_connects() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = peer(&bus, &net, "user_alice", MockMedia::new(), config());
    let slow = MockMedia::new().with_delay(Duration::from_millis(300));
    let bob = peer(&bus, &net, "user_bob", slow, config());

    // Offer and candidates reach bob while his media is still being acquired
    alice.machine.connect_to(PeerId::new("user_bob")).await.unwrap();
    wait_state(&bob.machine, SessionState::Connected).await;

    alice.machine.send_message("hello").await.unwrap();
    eventually("bob transcript", || async { bob.machine.transcript().await.len() == 1 }).await;
    bob.machine.send_message("hi").await.unwrap();
    eventually("alice transcript", || async { alice.machine.transcript().await.len() == 2 }).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bob.machine.state().await, SessionState::Connected);
    assert_eq!(net.connection_count(), 2);
}

#[tokio::test]
async fn test_second_connect_is_rejected_while_searching() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = peer(&bus, &net, "user_alice", MockMedia::new(), config());

    let searching = {
        let machine = alice.machine.clone();
        tokio::spawn(async move { machine.connect().await })
    };
    wait_state(&alice.machine, SessionState::Searching).await;

    assert_eq!(
        alice.machine.connect().await.unwrap_err(),
        SessionError::InvalidState(SessionState::Searching)
    );
    assert_eq!(
        alice.machine.connect_to(PeerId::new("user_bob")).await.unwrap_err(),
        SessionError::InvalidState(SessionState::Searching)
    );
    assert_eq!(alice.machine.state().await, SessionState::Searching);
    assert_eq!(net.connection_count(), 0);

    alice.machine.disconnect().await;
    assert_eq!(searching.await.unwrap().unwrap_err(), SessionError::Cancelled);
    assert_eq!(alice.machine.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_search_times_out_without_peers() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = peer(
        &bus,
        &net,
        "user_alice",
        MockMedia::new(),
        SessionConfig {
            search_timeout_ms: 300,
            ..config()
        },
    );

    assert_eq!(alice.machine.connect().await.unwrap_err(), SessionError::NoPeerFound);
    assert_eq!(alice.machine.state().await, SessionState::Idle);
    assert!(!alice.presence.is_announcing());
}

#[tokio::test]
async fn test_unresponsive_candidate_is_withdrawn_and_skipped() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = peer(
        &bus,
        &net,
        "user_alice",
        MockMedia::new(),
        SessionConfig {
            search_timeout_ms: 1_000,
            connect_request_timeout_ms: 200,
            ..config()
        },
    );
    // Announced once, then vanished
    alice.presence.record_seen(PeerId::new("user_ghost"));

    assert_eq!(alice.machine.connect().await.unwrap_err(), SessionError::NoPeerFound);
    assert!(alice.presence.list_active(&PeerId::new("user_alice")).peer_ids().is_empty());
    assert_eq!(net.connection_count(), 1);
    assert_eq!(net.open_connection_count(), 0);
}

#[tokio::test]
async fn test_two_searching_peers_find_each_other() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = peer(&bus, &net, "user_alice", MockMedia::new(), config());
    let bob = peer(&bus, &net, "user_bob", MockMedia::new(), config());

    let (a, b) = tokio::join!(alice.machine.connect(), bob.machine.connect());
    assert_eq!(a.unwrap(), PeerId::new("user_bob"));
    assert_eq!(b.unwrap(), PeerId::new("user_alice"));

    alice.machine.send_message("found you").await.unwrap();
    eventually("bob receives", || async { bob.machine.transcript().await.len() == 1 }).await;
}

#[tokio::test]
async fn test_disconnect_during_media_acquisition() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let media = MockMedia::new().with_delay(Duration::from_millis(300));
    let alice = peer(&bus, &net, "user_alice", media, config());

    let pending = {
        let machine = alice.machine.clone();
        tokio::spawn(async move { machine.connect_to(PeerId::new("user_bob")).await })
    };
    wait_state(&alice.machine, SessionState::Connecting).await;
    alice.machine.disconnect().await;

    assert_eq!(pending.await.unwrap().unwrap_err(), SessionError::Cancelled);
    tokio::time::sleep(Duration::from_millis(400)).await;
    // The late acquisition must not revive the operation
    assert_eq!(alice.machine.state().await, SessionState::Idle);
    assert_eq!(net.connection_count(), 0);
}

#[tokio::test]
async fn test_audio_only_fallback() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = peer(&bus, &net, "user_alice", MockMedia::new().without(TrackKind::Video), config());
    let _bob = peer(&bus, &net, "user_bob", MockMedia::new(), config());

    alice.machine.connect_to(PeerId::new("user_bob")).await.unwrap();
    assert!(alice.machine.set_media_enabled(TrackKind::Audio, false).await);
    assert!(!alice.machine.set_media_enabled(TrackKind::Video, false).await);
}

#[tokio::test]
async fn test_no_media_fails_connect() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let media = MockMedia::new().without(TrackKind::Video).without(TrackKind::Audio);
    let alice = peer(&bus, &net, "user_alice", media, config());

    assert_eq!(
        alice.machine.connect().await.unwrap_err(),
        SessionError::Media(MediaError::NoMedia)
    );
    assert_eq!(alice.machine.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_connect_to_self_is_rejected() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let alice = peer(&bus, &net, "user_alice", MockMedia::new(), config());
    assert_eq!(
        alice.machine.connect_to(PeerId::new("user_alice")).await.unwrap_err(),
        SessionError::InvalidPeer(PeerId::new("user_alice"))
    );
    assert_eq!(alice.machine.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_repeated_ice_failure_ends_session() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let (alice, bob) = connected_pair(&bus, &net).await;
    let mut alice_events = alice.machine.subscribe();

    net.set_broken(true);
    net.fail_links();

    let (ended, before) = next_event(&mut alice_events, |e| matches!(e, SessionEvent::Ended(_))).await;
    let restarts = before
        .iter()
        .filter(|e| matches!(e, SessionEvent::IceRestarting { .. }))
        .count();
    assert_eq!(restarts, 1);
    assert!(matches!(
        ended,
        SessionEvent::Ended(EndReason::NegotiationFailed(NegotiationError::IceFailed))
            | SessionEvent::Ended(EndReason::RemoteDisconnect)
            | SessionEvent::Ended(EndReason::ChannelClosed)
    ));
    wait_state(&alice.machine, SessionState::Idle).await;
    wait_state(&bob.machine, SessionState::Idle).await;
}

#[tokio::test]
async fn test_ice_failure_recovers_without_dropping_session() {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let (alice, bob) = connected_pair(&bus, &net).await;
    let mut alice_events = alice.machine.subscribe();

    net.fail_links();
    next_event(&mut alice_events, |e| matches!(e, SessionEvent::IceRestarting { attempt: 1 })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(alice.machine.state().await, SessionState::Connected);
    alice.machine.send_message("still here").await.unwrap();
    eventually("bob receives", || async { bob.machine.transcript().await.len() == 1 }).await;
}

#[tokio::test]
async fn test_connects_over_lossy_signaling() {
    let bus = BroadcastBus::with_faults(FaultConfig {
        drop_rate: 0.1,
        duplicate_rate: 0.3,
        max_delay_ms: 30,
    });
    let net = MockNetwork::new();
    let lossy = SessionConfig {
        connect_request_timeout_ms: 3_000,
        negotiation: peerchat::NegotiationConfig {
            retransmit_interval_ms: 100,
            max_retransmits: 20,
            ..Default::default()
        },
        ..config()
    };
    let alice = peer(&bus, &net, "user_alice", MockMedia::new(), lossy.clone());
    let bob = peer(&bus, &net, "user_bob", MockMedia::new(), lossy);

    alice.machine.connect_to(PeerId::new("user_bob")).await.unwrap();
    wait_state(&bob.machine, SessionState::Connected).await;
    // One connection per side: duplicates never spawn a second one
    assert_eq!(net.connection_count(), 2);
}
