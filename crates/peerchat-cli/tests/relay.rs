//! Relay server forwarding between real WebSocket clients

use futures::SinkExt;
use peerchat::{PeerId, RelayTransport, SignalingKind, SignalingMessage, SignalingPayload, SignalingTransport, Subscription};
use peerchat_cli::RelayServer;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const ALL: [SignalingKind; 3] = [SignalingKind::Announce, SignalingKind::ConnectRequest, SignalingKind::Disconnect];

async fn start_relay() -> String {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    tokio::spawn(server.run());
    url
}

async fn join(url: &str, id: &str) -> (RelayTransport, Subscription) {
    let transport = RelayTransport::connect(url, PeerId::new(id)).await.unwrap();
    let sub = transport.subscribe(&ALL);
    (transport, sub)
}

/// Registration is processed asynchronously on the relay
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn recv(sub: &mut Subscription) -> SignalingMessage {
    timeout(Duration::from_secs(2), sub.recv())
        .await
        .expect("nothing forwarded")
        .expect("transport closed")
}

async fn assert_silent(sub: &mut Subscription) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_directed_message_reaches_only_its_recipient() {
    let url = start_relay().await;
    let (alice, mut alice_sub) = join(&url, "user_alice").await;
    let (_bob, mut bob_sub) = join(&url, "user_bob").await;
    let (_carol, mut carol_sub) = join(&url, "user_carol").await;
    settle().await;

    alice
        .send(SignalingMessage::new(
            PeerId::new("user_alice"),
            PeerId::new("user_bob"),
            SignalingPayload::ConnectRequest,
        ))
        .await
        .unwrap();

    let msg = recv(&mut bob_sub).await;
    assert_eq!(msg.from, PeerId::new("user_alice"));
    assert_eq!(msg.payload, SignalingPayload::ConnectRequest);
    assert_silent(&mut carol_sub).await;
    assert_silent(&mut alice_sub).await;
}

#[tokio::test]
async fn test_broadcast_skips_the_sender() {
    let url = start_relay().await;
    let (alice, mut alice_sub) = join(&url, "user_alice").await;
    let (_bob, mut bob_sub) = join(&url, "user_bob").await;
    let (_carol, mut carol_sub) = join(&url, "user_carol").await;
    settle().await;

    alice
        .send(SignalingMessage::new(
            PeerId::new("user_alice"),
            PeerId::broadcast(),
            SignalingPayload::Announce,
        ))
        .await
        .unwrap();

    assert_eq!(recv(&mut bob_sub).await.payload, SignalingPayload::Announce);
    assert_eq!(recv(&mut carol_sub).await.payload, SignalingPayload::Announce);
    assert_silent(&mut alice_sub).await;
}

#[tokio::test]
async fn test_forged_sender_and_unknown_target_are_dropped() {
    let url = start_relay().await;
    let (_bob, mut bob_sub) = join(&url, "user_bob").await;

    let (mut raw, _) = connect_async(url.as_str()).await.unwrap();
    raw.send(Message::Text(r#"{"type":"register","peerId":"user_mallory"}"#.to_string()))
        .await
        .unwrap();
    settle().await;

    let forged = serde_json::json!({"type": "connect_request", "from": "user_alice", "to": "user_bob", "sentAt": 1});
    raw.send(Message::Text(forged.to_string())).await.unwrap();
    let nowhere = serde_json::json!({"type": "connect_request", "from": "user_mallory", "to": "user_nobody", "sentAt": 2});
    raw.send(Message::Text(nowhere.to_string())).await.unwrap();
    raw.send(Message::Text("not json".to_string())).await.unwrap();
    let honest = serde_json::json!({"type": "connect_request", "from": "user_mallory", "to": "user_bob", "sentAt": 3});
    raw.send(Message::Text(honest.to_string())).await.unwrap();

    let msg = recv(&mut bob_sub).await;
    assert_eq!(msg.from, PeerId::new("user_mallory"));
    assert_eq!(msg.sent_at, 3);
    assert_silent(&mut bob_sub).await;
}

#[tokio::test]
async fn test_closed_client_is_unregistered() {
    let url = start_relay().await;
    let (alice, _alice_sub) = join(&url, "user_alice").await;
    let (bob, _bob_sub) = join(&url, "user_bob").await;
    settle().await;

    bob.close().await;
    settle().await;
    // Sending towards a gone peer is not an error for the sender
    alice
        .send(SignalingMessage::new(
            PeerId::new("user_alice"),
            PeerId::new("user_bob"),
            SignalingPayload::Disconnect,
        ))
        .await
        .unwrap();

    // A fresh registration under the same id receives traffic again
    let (_bob2, mut bob2_sub) = join(&url, "user_bob").await;
    settle().await;
    alice
        .send(SignalingMessage::new(
            PeerId::new("user_alice"),
            PeerId::new("user_bob"),
            SignalingPayload::ConnectRequest,
        ))
        .await
        .unwrap();
    assert_eq!(recv(&mut bob2_sub).await.payload, SignalingPayload::ConnectRequest);

    assert!(matches!(
        bob.send(SignalingMessage::new(
            PeerId::new("user_bob"),
            PeerId::new("user_alice"),
            SignalingPayload::Announce,
        ))
        .await,
        Err(peerchat::TransportError::Closed)
    ));
}
