// src/discovery.rs

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::p2p::PeerTransport;
use crate::types::Peer;

/// Known peers with their consecutive-failure counts.
///
/// Readers take a [`snapshot`](PeerSet::snapshot), so they never see a
/// half-applied merge.
#[derive(Debug)]
pub struct PeerSet {
    local: Peer,
    seed: Option<Peer>,
    max_failures: u32,
    peers: RwLock<HashMap<Peer, u32>>,
}

impl PeerSet {
    /// A joining node starts knowing exactly its seed; a bootstrap node
    /// passes `None` and waits to be found.
    pub fn new(local: Peer, seed: Option<Peer>, max_failures: u32) -> Self {
        let mut peers = HashMap::new();
        if let Some(s) = seed.as_ref().filter(|s| **s != local) {
            peers.insert(s.clone(), 0);
        }
        Self { local, seed, max_failures, peers: RwLock::new(peers) }
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn seed(&self) -> Option<&Peer> {
        self.seed.as_ref()
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let guard = self.peers.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<Peer> = guard.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.read().map(|g| g.contains_key(peer)).unwrap_or(false)
    }

    /// Idempotent union; ignores self. Returns how many peers were new.
    pub fn merge<I: IntoIterator<Item = Peer>>(&self, incoming: I) -> usize {
        let mut guard = self.peers.write().unwrap_or_else(|p| p.into_inner());
        let mut added = 0;
        for peer in incoming {
            if peer == self.local || peer.as_str().is_empty() {
                continue;
            }
            if !guard.contains_key(&peer) {
                guard.insert(peer, 0);
                added += 1;
            }
        }
        added
    }

    pub fn record_success(&self, peer: &Peer) {
        let mut guard = self.peers.write().unwrap_or_else(|p| p.into_inner());
        if let Some(n) = guard.get_mut(peer) {
            *n = 0;
        }
    }

    /// Returns true if the peer was evicted. The seed is never evicted.
    pub fn record_failure(&self, peer: &Peer) -> bool {
        let mut guard = self.peers.write().unwrap_or_else(|p| p.into_inner());
        let Some(n) = guard.get_mut(peer) else {
            return false;
        };
        *n += 1;
        let evict = self.max_failures > 0 && *n >= self.max_failures && Some(peer) != self.seed.as_ref();
        if evict {
            guard.remove(peer);
        }
        evict
    }

    /// Answer to a remote exchange: merge what they know, return what we know
    /// plus ourselves.
    pub fn handle_discover(&self, known: Vec<Peer>) -> Vec<Peer> {
        let added = self.merge(known);
        if added > 0 {
            debug!(added, "peers learned from inbound exchange");
        }
        let mut out = self.snapshot();
        out.push(self.local.clone());
        out
    }
}

/// Periodic peer-list exchange with every known peer (or the seed, while
/// nothing else is known).
pub struct PeerDiscovery {
    peers: Arc<PeerSet>,
    transport: Arc<dyn PeerTransport>,
    interval: Duration,
}

impl PeerDiscovery {
    pub fn new(peers: Arc<PeerSet>, transport: Arc<dyn PeerTransport>, interval: Duration) -> Self {
        Self { peers, transport, interval }
    }

    pub async fn discover_once(&self) {
        let mut targets = self.peers.snapshot();
        if targets.is_empty() {
            if let Some(seed) = self.peers.seed().filter(|s| *s != self.peers.local()) {
                targets.push(seed.clone());
            }
        }
        if targets.is_empty() {
            return;
        }

        let mut offer = targets.clone();
        offer.push(self.peers.local().clone());
        let exchanges = targets.iter().map(|peer| {
            let offer = offer.clone();
            async move { (peer, self.transport.discover(peer, offer).await) }
        });

        for (peer, res) in join_all(exchanges).await {
            match res {
                Ok(list) => {
                    self.peers.merge([peer.clone()]);
                    self.peers.record_success(peer);
                    let added = self.peers.merge(list);
                    if added > 0 {
                        info!(%peer, added, total = self.peers.len(), "discovered peers");
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "peer exchange failed");
                    if self.peers.record_failure(peer) {
                        info!(%peer, "dropping unresponsive peer");
                    }
                }
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.discover_once().await,
            }
        }
        info!("peer discovery stopped");
    }
}
