//! Inbound signaling fan-out shared by the transport implementations
//!
//! Messages of a kind nobody has subscribed to yet are parked and replayed
//! to the first subscription for that kind, so a handler registered slightly
//! late does not miss an offer that raced ahead of it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::Subscription;
use crate::types::{SignalingKind, SignalingMessage};

/// Parked messages kept per kind
pub const PENDING_LIMIT: usize = 32;

struct Subscriber {
    kinds: Vec<SignalingKind>,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct DispatchState {
    subscribers: Vec<Subscriber>,
    pending: HashMap<SignalingKind, VecDeque<SignalingMessage>>,
    closed: bool,
}

#[derive(Default)]
pub struct Dispatcher {
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kinds: &[SignalingKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let Ok(mut state) = self.state.lock() else {
            return Subscription::new(kinds.to_vec(), rx);
        };
        if state.closed {
            // Sender dropped here, so the subscription reports closed at once
            return Subscription::new(kinds.to_vec(), rx);
        }

        for kind in kinds {
            if let Some(parked) = state.pending.remove(kind) {
                debug!(?kind, count = parked.len(), "replaying parked signaling messages");
                for msg in parked {
                    let _ = tx.send(msg);
                }
            }
        }

        state.subscribers.push(Subscriber {
            kinds: kinds.to_vec(),
            tx,
        });
        Subscription::new(kinds.to_vec(), rx)
    }

    /// Deliver to every live subscriber of the message kind, or park it
    pub fn dispatch(&self, msg: SignalingMessage) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.closed {
            return;
        }

        let kind = msg.kind();
        state.subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = false;
        for sub in state.subscribers.iter().filter(|s| s.kinds.contains(&kind)) {
            if sub.tx.send(msg.clone()).is_ok() {
                delivered = true;
            }
        }

        if !delivered {
            let queue = state.pending.entry(kind).or_default();
            if queue.len() >= PENDING_LIMIT {
                queue.pop_front();
            }
            queue.push_back(msg);
        }
    }

    /// Drop all subscribers; their streams end
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.subscribers.clear();
            state.pending.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerId, SignalingPayload};

    fn msg(payload: SignalingPayload) -> SignalingMessage {
        SignalingMessage::new(PeerId::new("user_a"), PeerId::new("user_b"), payload)
    }

    #[test]
    fn test_fans_out_by_kind() {
        let dispatcher = Dispatcher::new();
        let mut requests = dispatcher.subscribe(&[SignalingKind::ConnectRequest]);
        let mut all = dispatcher.subscribe(&SignalingKind::ALL);

        dispatcher.dispatch(msg(SignalingPayload::ConnectRequest));
        dispatcher.dispatch(msg(SignalingPayload::Disconnect));

        assert_eq!(requests.try_recv().map(|m| m.kind()), Some(SignalingKind::ConnectRequest));
        assert!(requests.try_recv().is_none());
        assert_eq!(all.try_recv().map(|m| m.kind()), Some(SignalingKind::ConnectRequest));
        assert_eq!(all.try_recv().map(|m| m.kind()), Some(SignalingKind::Disconnect));
    }

    #[test]
    fn test_parks_until_first_subscriber() {
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(msg(SignalingPayload::AnswerSdp { sdp: "a1".into() }));
        dispatcher.dispatch(msg(SignalingPayload::AnswerSdp { sdp: "a2".into() }));

        let mut sub = dispatcher.subscribe(&[SignalingKind::AnswerSdp]);
        let first = sub.try_recv().map(|m| m.payload);
        let second = sub.try_recv().map(|m| m.payload);
        assert_eq!(first, Some(SignalingPayload::AnswerSdp { sdp: "a1".into() }));
        assert_eq!(second, Some(SignalingPayload::AnswerSdp { sdp: "a2".into() }));

        // Replayed once only
        let mut late = dispatcher.subscribe(&[SignalingKind::AnswerSdp]);
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_pending_is_bounded() {
        let dispatcher = Dispatcher::new();
        for i in 0..(PENDING_LIMIT + 5) {
            dispatcher.dispatch(msg(SignalingPayload::OfferSdp {
                sdp: format!("o{}", i),
                ice_restart: false,
            }));
        }
        let mut sub = dispatcher.subscribe(&[SignalingKind::OfferSdp]);
        let mut count = 0;
        let mut first = None;
        while let Some(m) = sub.try_recv() {
            if first.is_none() {
                first = Some(m.payload.clone());
            }
            count += 1;
        }
        assert_eq!(count, PENDING_LIMIT);
        assert_eq!(
            first,
            Some(SignalingPayload::OfferSdp {
                sdp: "o5".into(),
                ice_restart: false
            })
        );
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let dispatcher = Dispatcher::new();
        let mut sub = dispatcher.subscribe(&[SignalingKind::Announce]);
        dispatcher.close();
        assert!(sub.recv().await.is_none());
        let mut after = dispatcher.subscribe(&[SignalingKind::Announce]);
        assert!(after.recv().await.is_none());
    }
}
