//! In-process broadcast signaling bus
//!
//! Every transport connected to a bus sees every message and keeps the ones
//! addressed to it. Optional fault injection drops, duplicates and delays
//! messages to exercise the negotiation retry and idempotence rules.

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::transport::{SignalingTransport, Subscription, TransportError};
use crate::types::{PeerId, SignalingKind, SignalingMessage};

const BUS_CAPACITY: usize = 1024;

/// Delivery faults applied to every send on a bus
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultConfig {
    /// Probability in [0, 1] that a message is silently dropped
    pub drop_rate: f64,
    /// Probability in [0, 1] that a message is delivered twice
    pub duplicate_rate: f64,
    /// Each delivery is delayed by a random amount up to this
    pub max_delay_ms: u64,
}

pub struct BroadcastBus {
    tx: broadcast::Sender<SignalingMessage>,
    faults: Mutex<FaultConfig>,
}

impl BroadcastBus {
    pub fn new() -> Arc<Self> {
        Self::with_faults(FaultConfig::default())
    }

    pub fn with_faults(faults: FaultConfig) -> Arc<Self> {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Arc::new(Self {
            tx,
            faults: Mutex::new(faults),
        })
    }

    pub fn set_faults(&self, faults: FaultConfig) {
        if let Ok(mut f) = self.faults.lock() {
            *f = faults;
        }
    }

    fn faults(&self) -> FaultConfig {
        self.faults.lock().map(|f| *f).unwrap_or_default()
    }

    /// Attach a transport receiving for `peer_id`. Must be called inside a tokio runtime.
    pub fn connect(self: &Arc<Self>, peer_id: PeerId) -> BusTransport {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut rx = self.tx.subscribe();
        let me = peer_id.clone();
        let sink = dispatcher.clone();
        let pump = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg.is_for(&me) {
                            sink.dispatch(msg);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(peer = %me, skipped = n, "signaling bus lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        BusTransport {
            peer_id,
            bus: self.clone(),
            dispatcher,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }
    }

    fn deliver(&self, msg: SignalingMessage) {
        // No receivers is not an error: nobody is subscribed
        let _ = self.tx.send(msg);
    }
}

/// One peer's view of a [`BroadcastBus`]
pub struct BusTransport {
    peer_id: PeerId,
    bus: Arc<BroadcastBus>,
    dispatcher: Arc<Dispatcher>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl SignalingTransport for BusTransport {
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

        let faults = self.bus.faults();
        let (dropped, copies, delays) = {
            let mut rng = rand::thread_rng();
            let dropped = faults.drop_rate > 0.0 && rng.gen_bool(faults.drop_rate.min(1.0));
            let copies = if faults.duplicate_rate > 0.0 && rng.gen_bool(faults.duplicate_rate.min(1.0)) {
                2
            } else {
                1
            };
            let delays: Vec<u64> = (0..copies)
                .map(|_| {
                    if faults.max_delay_ms > 0 {
                        rng.gen_range(0..=faults.max_delay_ms)
                    } else {
                        0
                    }
                })
                .collect();
            (dropped, copies, delays)
        };

        if dropped {
            debug!(from = %msg.from, to = %msg.to, kind = ?msg.kind(), "bus dropped message");
            return Ok(());
        }
        if copies > 1 {
            debug!(from = %msg.from, to = %msg.to, kind = ?msg.kind(), "bus duplicated message");
        }

        for delay in delays {
            if delay == 0 {
                self.bus.deliver(msg.clone());
            } else {
                let bus = self.bus.clone();
                let msg = msg.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    bus.deliver(msg);
                });
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        self.dispatcher.close();
    }
}

impl Drop for BusTransport {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}
