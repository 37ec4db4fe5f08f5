//! Negotiation between two engines over the in-process bus and mock network

use peerchat::{
    BroadcastBus, NegotiationConfig, NegotiationEngine, NegotiationError, NegotiationEvent, NegotiationState,
    MockNetwork, PeerId, Role, SignalingKind, SignalingMessage, SignalingPayload, SignalingTransport, Subscription,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const KINDS: [SignalingKind; 3] = [SignalingKind::OfferSdp, SignalingKind::AnswerSdp, SignalingKind::IceCandidate];

struct Pair {
    net: MockNetwork,
    a: Arc<NegotiationEngine>,
    b: Arc<NegotiationEngine>,
    a_events: UnboundedReceiver<NegotiationEvent>,
    b_events: UnboundedReceiver<NegotiationEvent>,
    /// Messages addressed to A, until handed to a pump
    to_a: Option<Subscription>,
    /// Messages addressed to B
    to_b: Option<Subscription>,
}

fn pair(config: NegotiationConfig) -> Pair {
    let bus = BroadcastBus::new();
    let net = MockNetwork::new();
    let ta = Arc::new(bus.connect(PeerId::new("user_a")));
    let tb = Arc::new(bus.connect(PeerId::new("user_b")));
    let to_a = ta.subscribe(&KINDS);
    let to_b = tb.subscribe(&KINDS);

    let (a, a_events) = NegotiationEngine::new(
        PeerId::new("user_a"),
        PeerId::new("user_b"),
        Role::Initiator,
        ta,
        Arc::new(net.factory()),
        None,
        config.clone(),
    );
    let (b, b_events) = NegotiationEngine::new(
        PeerId::new("user_b"),
        PeerId::new("user_a"),
        Role::Responder,
        tb,
        Arc::new(net.factory()),
        None,
        config,
    );
    Pair {
        net,
        a,
        b,
        a_events,
        b_events,
        to_a: Some(to_a),
        to_b: Some(to_b),
    }
}

fn pump(mut sub: Subscription, engine: Arc<NegotiationEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            let _ = engine.handle_signaling(msg).await;
        }
    })
}

/// Collect messages until one description and `candidates` candidates have arrived
async fn gather(sub: &mut Subscription, candidates: usize) -> (SignalingMessage, Vec<SignalingMessage>) {
    let mut description = None;
    let mut cands = Vec::new();
    while description.is_none() || cands.len() < candidates {
        let msg = timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("signaling timed out")
            .expect("transport closed");
        match msg.payload {
            SignalingPayload::IceCandidate { .. } => cands.push(msg),
            _ if description.is_none() => description = Some(msg),
            _ => {}
        }
    }
    (description.unwrap(), cands)
}

async fn wait_for(
    events: &mut UnboundedReceiver<NegotiationEvent>,
    pred: impl Fn(&NegotiationEvent) -> bool,
) -> Vec<NegotiationEvent> {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timed out")
            .expect("engine dropped");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn connect_pumped(p: &mut Pair) -> (JoinHandle<()>, JoinHandle<()>) {
    let to_a = p.to_a.take().unwrap();
    let to_b = p.to_b.take().unwrap();
    let pumps = (pump(to_a, p.a.clone()), pump(to_b, p.b.clone()));
    p.b.await_offer().await.unwrap();
    p.a.start_as_initiator().await.unwrap();
    wait_for(&mut p.a_events, |e| matches!(e, NegotiationEvent::Connected)).await;
    wait_for(&mut p.b_events, |e| matches!(e, NegotiationEvent::Connected)).await;
    pumps
}

#[tokio::test]
async fn test_duplicated_and_reordered_signaling_still_connects() {
    let mut p = pair(NegotiationConfig::default());
    p.b.await_offer().await.unwrap();
    p.a.start_as_initiator().await.unwrap();

    // Candidates first, everything twice
    let (offer, a_candidates) = gather(p.to_b.as_mut().unwrap(), 2).await;
    for c in a_candidates.iter().chain(a_candidates.iter()) {
        p.b.handle_signaling(c.clone()).await.unwrap();
    }
    assert_eq!(p.b.pending_candidate_count().await, 2);
    assert_eq!(p.b.state().await, NegotiationState::AwaitingOffer);

    p.b.handle_signaling(offer.clone()).await.unwrap();
    p.b.handle_signaling(offer).await.unwrap();
    assert_eq!(p.b.pending_candidate_count().await, 0);
    assert_eq!(p.b.state().await, NegotiationState::IceNegotiating);

    let (answer, b_candidates) = gather(p.to_a.as_mut().unwrap(), 2).await;
    for c in b_candidates.iter().rev() {
        p.a.handle_signaling(c.clone()).await.unwrap();
    }
    p.a.handle_signaling(answer.clone()).await.unwrap();
    // Late duplicate answer is a no-op
    p.a.handle_signaling(answer).await.unwrap();

    let a_seen = wait_for(&mut p.a_events, |e| matches!(e, NegotiationEvent::Connected)).await;
    assert!(a_seen.iter().any(|e| matches!(e, NegotiationEvent::ChannelReady(_))));
    wait_for(&mut p.b_events, |e| matches!(e, NegotiationEvent::Connected)).await;

    assert_eq!(p.a.state().await, NegotiationState::Connected);
    assert_eq!(p.b.state().await, NegotiationState::Connected);
    assert_eq!(p.a.restart_count().await, 0);
    assert_eq!(p.net.connection_count(), 2);
}

#[tokio::test]
async fn test_duplicate_offer_resends_cached_answer() {
    let mut p = pair(NegotiationConfig::default());
    p.b.await_offer().await.unwrap();
    p.a.start_as_initiator().await.unwrap();

    let (offer, _) = gather(p.to_b.as_mut().unwrap(), 0).await;
    p.b.handle_signaling(offer.clone()).await.unwrap();
    let (first, _) = gather(p.to_a.as_mut().unwrap(), 0).await;

    p.b.handle_signaling(offer).await.unwrap();
    let (second, _) = gather(p.to_a.as_mut().unwrap(), 0).await;
    assert_eq!(first.payload, second.payload);
    assert_eq!(p.net.connection_count(), 2);
}

#[tokio::test]
async fn test_unanswered_offer_is_resent_a_bounded_number_of_times() {
    let mut p = pair(NegotiationConfig {
        negotiation_timeout_ms: 400,
        retransmit_interval_ms: 50,
        max_retransmits: 3,
        ..Default::default()
    });
    p.a.start_as_initiator().await.unwrap();

    let seen = wait_for(&mut p.a_events, |e| matches!(e, NegotiationEvent::Failed(_))).await;
    assert!(matches!(seen.last(), Some(NegotiationEvent::Failed(NegotiationError::AnswerTimeout))));
    assert_eq!(p.a.state().await, NegotiationState::Failed);

    let mut offers = 0;
    while let Some(msg) = p.to_b.as_mut().unwrap().try_recv() {
        if matches!(msg.payload, SignalingPayload::OfferSdp { .. }) {
            offers += 1;
        }
    }
    assert_eq!(offers, 4);
}

#[tokio::test]
async fn test_ice_failure_restarts_once_then_fails() {
    let mut p = pair(NegotiationConfig::default());
    let _pumps = connect_pumped(&mut p).await;

    p.net.set_broken(true);
    p.net.fail_links();

    let seen = wait_for(&mut p.a_events, |e| matches!(e, NegotiationEvent::Failed(_))).await;
    let restarts = seen
        .iter()
        .filter(|e| matches!(e, NegotiationEvent::IceRestarting { .. }))
        .count();
    assert_eq!(restarts, 1);
    assert!(matches!(seen.last(), Some(NegotiationEvent::Failed(NegotiationError::IceFailed))));
    assert_eq!(p.a.restart_count().await, 1);
}

#[tokio::test]
async fn test_ice_failure_recovers_with_restart() {
    let mut p = pair(NegotiationConfig::default());
    let _pumps = connect_pumped(&mut p).await;

    p.net.fail_links();
    let seen = wait_for(&mut p.a_events, |e| matches!(e, NegotiationEvent::Connected)).await;
    assert!(seen.iter().any(|e| matches!(e, NegotiationEvent::IceRestarting { attempt: 1 })));
    assert_eq!(p.a.state().await, NegotiationState::Connected);
    assert_eq!(p.b.restart_count().await, 1);
}

#[tokio::test]
async fn test_transient_disconnect_inside_grace_needs_no_restart() {
    let mut p = pair(NegotiationConfig {
        ice_disconnect_grace_ms: 300,
        ..Default::default()
    });
    let _pumps = connect_pumped(&mut p).await;

    p.net.interrupt_links();
    tokio::time::sleep(Duration::from_millis(50)).await;
    p.net.restore_links();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(p.a.restart_count().await, 0);
    assert_eq!(p.a.state().await, NegotiationState::Connected);
}

#[tokio::test]
async fn test_lasting_disconnect_restarts_after_grace() {
    let mut p = pair(NegotiationConfig {
        ice_disconnect_grace_ms: 100,
        ..Default::default()
    });
    let _pumps = connect_pumped(&mut p).await;

    p.net.interrupt_links();
    wait_for(&mut p.a_events, |e| matches!(e, NegotiationEvent::IceRestarting { .. })).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(p.a.restart_count().await, 1);
    assert_eq!(p.a.state().await, NegotiationState::Connected);
}

#[tokio::test]
async fn test_close_mid_negotiation() {
    let mut p = pair(NegotiationConfig::default());
    p.b.await_offer().await.unwrap();
    p.a.start_as_initiator().await.unwrap();
    let (offer, _) = gather(p.to_b.as_mut().unwrap(), 0).await;

    p.b.close().await;
    assert_eq!(p.b.handle_signaling(offer).await.unwrap_err(), NegotiationError::Closed);
    assert_eq!(p.b.state().await, NegotiationState::Closed);

    p.a.close().await;
    assert_eq!(p.net.open_connection_count(), 0);
}

#[tokio::test]
async fn test_channel_is_open_when_connected_is_reported() {
    let mut p = pair(NegotiationConfig::default());
    p.net.set_channel_open_delay(Duration::from_millis(300));
    let to_a = p.to_a.take().unwrap();
    let to_b = p.to_b.take().unwrap();
    let _pumps = (pump(to_a, p.a.clone()), pump(to_b, p.b.clone()));
    p.b.await_offer().await.unwrap();
    p.a.start_as_initiator().await.unwrap();

    for events in [&mut p.a_events, &mut p.b_events] {
        let seen = wait_for(events, |e| matches!(e, NegotiationEvent::Connected)).await;
        let channel = seen
            .iter()
            .find_map(|e| match e {
                NegotiationEvent::ChannelReady(channel) => Some(channel.clone()),
                _ => None,
            })
            .expect("channel handed out before Connected");
        assert!(channel.is_open());
        channel.send(b"ready".to_vec()).await.unwrap();
    }
    assert_eq!(p.a.state().await, NegotiationState::Connected);
    assert_eq!(p.b.state().await, NegotiationState::Connected);
}
