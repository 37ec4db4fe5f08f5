//! Presence registry: which peers are reachable and willing to connect
//!
//! Entries are refreshed by `Announce` broadcasts and expire after a TTL.
//! Expiry is evaluated lazily when entries are listed, so a peer that stops
//! announcing simply stops showing up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PresenceConfig;
use crate::transport::{SignalingTransport, TransportError};
use crate::types::{PeerId, SignalingKind, SignalingMessage, SignalingPayload};

/// A peer seen recently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub peer_id: PeerId,
    pub last_seen_at: Instant,
}

type Entries = Arc<RwLock<HashMap<PeerId, Instant>>>;

pub struct PresenceRegistry {
    transport: Arc<dyn SignalingTransport>,
    config: PresenceConfig,
    entries: Entries,
    listener: Mutex<Option<JoinHandle<()>>>,
    announcer: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceRegistry {
    /// Create a registry and start listening for announcements.
    /// Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn SignalingTransport>, config: PresenceConfig) -> Arc<Self> {
        let registry = Arc::new(Self {
            transport: transport.clone(),
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
            listener: Mutex::new(None),
            announcer: Mutex::new(None),
        });

        let mut sub = transport.subscribe(&[SignalingKind::Announce, SignalingKind::Disconnect]);
        let weak = Arc::downgrade(&registry);
        let listener = tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                let Some(registry) = weak.upgrade() else { break };
                match msg.payload {
                    SignalingPayload::Announce => registry.record_seen(msg.from),
                    // Directed disconnects belong to the session
                    SignalingPayload::Disconnect if msg.to.is_broadcast() => {
                        debug!(peer = %msg.from, "peer withdrew presence");
                        registry.remove(&msg.from);
                    }
                    _ => {}
                }
            }
        });
        if let Ok(mut slot) = registry.listener.lock() {
            *slot = Some(listener);
        }
        registry
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Publish or refresh an entry and broadcast it
    pub async fn announce(&self, peer_id: &PeerId) -> Result<(), TransportError> {
        self.record_seen(peer_id.clone());
        self.transport
            .send(SignalingMessage::new(
                peer_id.clone(),
                PeerId::broadcast(),
                SignalingPayload::Announce,
            ))
            .await
    }

    /// Announce now and then every announce interval until stopped
    pub fn start_announcing(self: &Arc<Self>, peer_id: PeerId) {
        let Ok(mut slot) = self.announcer.lock() else { return };
        if let Some(old) = slot.take() {
            old.abort();
        }

        let weak = Arc::downgrade(self);
        let period = self.config.announce_interval();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else { break };
                if let Err(e) = registry.announce(&peer_id).await {
                    warn!(peer = %peer_id, "presence announce failed: {}", e);
                }
            }
        }));
    }

    pub fn stop_announcing(&self) {
        if let Ok(mut slot) = self.announcer.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    pub fn is_announcing(&self) -> bool {
        self.announcer.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Entries within the TTL, excluding `excluding`. Evaluated on each iteration.
    pub fn list_active(&self, excluding: &PeerId) -> ActivePeers {
        ActivePeers {
            entries: self.entries.clone(),
            excluding: excluding.clone(),
            ttl: self.config.ttl(),
        }
    }

    /// Remove an entry at once. Withdrawing our own id also tells the other registries. Idempotent.
    pub async fn withdraw(&self, peer_id: &PeerId) {
        let removed = self.remove(peer_id);
        if peer_id == self.transport.local_peer_id() {
            self.stop_announcing();
            let msg = SignalingMessage::new(peer_id.clone(), PeerId::broadcast(), SignalingPayload::Disconnect);
            if let Err(e) = self.transport.send(msg).await {
                debug!(peer = %peer_id, "withdraw broadcast failed: {}", e);
            }
        } else if removed {
            debug!(peer = %peer_id, "withdrew stale presence entry");
        }
    }

    pub fn record_seen(&self, peer_id: PeerId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(peer_id, Instant::now());
        }
    }

    /// Drop expired entries; listing ignores them anyway
    pub fn prune_expired(&self) {
        let ttl = self.config.ttl();
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, seen| seen.elapsed() < ttl);
        }
    }

    fn remove(&self, peer_id: &PeerId) -> bool {
        self.entries
            .write()
            .map(|mut e| e.remove(peer_id).is_some())
            .unwrap_or(false)
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        self.stop_announcing();
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for PresenceRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Restartable view over active entries
#[derive(Clone)]
pub struct ActivePeers {
    entries: Entries,
    excluding: PeerId,
    ttl: std::time::Duration,
}

impl ActivePeers {
    /// Iterate entries alive right now; each call starts over from fresh state
    pub fn iter(&self) -> impl Iterator<Item = PresenceEntry> + '_ {
        let snapshot: Vec<(PeerId, Instant)> = self
            .entries
            .read()
            .map(|e| e.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        snapshot
            .into_iter()
            .filter(move |(id, seen)| id != &self.excluding && seen.elapsed() < self.ttl)
            .map(|(peer_id, last_seen_at)| PresenceEntry { peer_id, last_seen_at })
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.iter().map(|e| e.peer_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use std::time::Duration;

    fn config() -> PresenceConfig {
        PresenceConfig {
            ttl_ms: 30_000,
            announce_interval_ms: 0,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_is_seen_by_others() {
        let bus = BroadcastBus::new();
        let a = Arc::new(bus.connect(PeerId::new("user_a")));
        let b = Arc::new(bus.connect(PeerId::new("user_b")));
        let reg_a = PresenceRegistry::new(a, config());
        let reg_b = PresenceRegistry::new(b, config());

        reg_a.announce(&PeerId::new("user_a")).await.unwrap();
        settle().await;

        assert_eq!(reg_b.list_active(&PeerId::new("user_b")).peer_ids(), vec![PeerId::new("user_a")]);
        assert!(reg_a.list_active(&PeerId::new("user_a")).peer_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let bus = BroadcastBus::new();
        let reg = PresenceRegistry::new(Arc::new(bus.connect(PeerId::new("user_me"))), config());
        reg.record_seen(PeerId::new("user_x"));

        let active = reg.list_active(&PeerId::new("user_me"));
        assert_eq!(active.iter().count(), 1);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(active.iter().count(), 1);

        // Same view, restarted after expiry
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(active.iter().count(), 0);

        reg.prune_expired();
        reg.record_seen(PeerId::new("user_x"));
        assert_eq!(active.iter().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_announce_keeps_entry_alive() {
        let bus = BroadcastBus::new();
        let reg_a = PresenceRegistry::new(Arc::new(bus.connect(PeerId::new("user_a"))), config());
        let reg_b = PresenceRegistry::new(Arc::new(bus.connect(PeerId::new("user_b"))), config());

        reg_a.start_announcing(PeerId::new("user_a"));
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(10)).await;
            settle().await;
        }
        assert_eq!(reg_b.list_active(&PeerId::new("user_b")).peer_ids().len(), 1);

        reg_a.stop_announcing();
        assert!(!reg_a.is_announcing());
        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;
        assert!(reg_b.list_active(&PeerId::new("user_b")).peer_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_is_idempotent_and_propagates() {
        let bus = BroadcastBus::new();
        let reg_a = PresenceRegistry::new(Arc::new(bus.connect(PeerId::new("user_a"))), config());
        let reg_b = PresenceRegistry::new(Arc::new(bus.connect(PeerId::new("user_b"))), config());

        reg_a.announce(&PeerId::new("user_a")).await.unwrap();
        settle().await;
        assert_eq!(reg_b.list_active(&PeerId::new("user_b")).peer_ids().len(), 1);

        reg_a.withdraw(&PeerId::new("user_a")).await;
        reg_a.withdraw(&PeerId::new("user_a")).await;
        settle().await;
        assert!(reg_b.list_active(&PeerId::new("user_b")).peer_ids().is_empty());

        // Withdrawing someone else's stale entry stays local
        reg_b.record_seen(PeerId::new("user_ghost"));
        reg_b.withdraw(&PeerId::new("user_ghost")).await;
        reg_b.withdraw(&PeerId::new("user_ghost")).await;
        assert!(reg_b.list_active(&PeerId::new("user_b")).peer_ids().is_empty());
    }
}
