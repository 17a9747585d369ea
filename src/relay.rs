// src/relay.rs

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::{block_hash, tx_hash};
use crate::discovery::PeerSet;
use crate::events::EventStream;
use crate::p2p::{Envelope, PeerTransport, TransportError};
use crate::types::{short_hex, Block, Event, Hash, Peer, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("{0} relay is shut down")]
    Closed(&'static str),
}

/// What the relay needs to know about a message kind.
pub trait Gossip: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> Hash;

    /// Event raised for local subscribers when the message is first relayed.
    fn event(&self) -> Event;

    fn route<'a>(
        transport: &'a dyn PeerTransport,
        peer: &'a Peer,
        env: Envelope<Self>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}

impl Gossip for Transaction {
    const KIND: &'static str = "tx";

    fn id(&self) -> Hash {
        tx_hash(self)
    }

    fn event(&self) -> Event {
        Event::NewPendingTx(self.clone())
    }

    fn route<'a>(
        transport: &'a dyn PeerTransport,
        peer: &'a Peer,
        env: Envelope<Self>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        transport.send_tx(peer, env)
    }
}

impl Gossip for Block {
    const KIND: &'static str = "block";

    fn id(&self) -> Hash {
        block_hash(self)
    }

    fn event(&self) -> Event {
        Event::NewBlock(self.clone())
    }

    fn route<'a>(
        transport: &'a dyn PeerTransport,
        peer: &'a Peer,
        env: Envelope<Self>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        transport.send_block(peer, env)
    }
}

/// Bounded FIFO set of message ids; the oldest id is forgotten first.
#[derive(Debug)]
pub struct SeenCache {
    order: VecDeque<Hash>,
    set: HashSet<Hash>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { order: VecDeque::with_capacity(capacity.min(1024)), set: HashSet::new(), capacity }
    }

    /// True if `id` was not present.
    pub fn insert(&mut self, id: Hash) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub fn remove(&mut self, id: &Hash) {
        if self.set.remove(id) {
            self.order.retain(|h| h != id);
        }
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.set.contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Deduplicating flood relay for one message kind.
pub struct Relay<M: Gossip> {
    local: Peer,
    seen: Mutex<SeenCache>,
    tx: mpsc::Sender<Envelope<M>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Envelope<M>>>,
    peers: Arc<PeerSet>,
    transport: Arc<dyn PeerTransport>,
    events: EventStream,
    stopped: CancellationToken,
}

impl<M: Gossip> Relay<M> {
    pub fn new(
        local: Peer,
        capacity: usize,
        seen_capacity: usize,
        peers: Arc<PeerSet>,
        transport: Arc<dyn PeerTransport>,
        events: EventStream,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            local,
            seen: Mutex::new(SeenCache::new(seen_capacity)),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            peers,
            transport,
            events,
            stopped: CancellationToken::new(),
        }
    }

    /// Marks `id` seen. False means it already was and the caller should stop.
    pub fn admit(&self, id: Hash) -> bool {
        let fresh = self.seen.lock().unwrap_or_else(|p| p.into_inner()).insert(id);
        if !fresh {
            debug!(kind = M::KIND, id = %short_hex(&id), "duplicate, not relaying");
        }
        fresh
    }

    /// Undoes `admit` for a message that turned out to be invalid.
    pub fn forget(&self, id: &Hash) {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).remove(id);
    }

    pub fn has_seen(&self, id: &Hash) -> bool {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).contains(id)
    }

    /// Raises the kind's event and queues the message for fan-out. Waits when
    /// the queue is full, and fails with `Closed` once [`Relay::run`] has
    /// stopped.
    pub async fn broadcast(&self, msg: M, origin: Option<Peer>) -> Result<(), RelayError> {
        if self.stopped.is_cancelled() {
            return Err(RelayError::Closed(M::KIND));
        }
        self.events.publish(msg.event());
        tokio::select! {
            res = self.tx.send(Envelope::new(msg, origin)) => res.map_err(|_| RelayError::Closed(M::KIND)),
            _ = self.stopped.cancelled() => Err(RelayError::Closed(M::KIND)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// `admit` + `broadcast`. Returns false for a duplicate.
    pub async fn submit(&self, msg: M, origin: Option<Peer>) -> Result<bool, RelayError> {
        let id = msg.id();
        if !self.admit(id) {
            return Ok(false);
        }
        if let Err(e) = self.broadcast(msg, origin).await {
            self.forget(&id);
            return Err(e);
        }
        Ok(true)
    }

    async fn fan_out(&self, env: Envelope<M>) {
        let id = env.payload.id();
        let targets: Vec<Peer> = self
            .peers
            .snapshot()
            .into_iter()
            .filter(|p| *p != self.local && Some(p) != env.originator.as_ref())
            .collect();
        if targets.is_empty() {
            return;
        }

        let outbound = Envelope::new(env.payload, Some(self.local.clone()));
        let sends = targets.iter().map(|peer| {
            let env = outbound.clone();
            async move { (peer, M::route(self.transport.as_ref(), peer, env).await) }
        });
        for (peer, res) in join_all(sends).await {
            if let Err(e) = res {
                warn!(kind = M::KIND, id = %short_hex(&id), %peer, error = %e, "relay send failed");
            }
        }
        debug!(kind = M::KIND, id = %short_hex(&id), peers = targets.len(), "relayed");
    }

    /// Drains the queue until cancelled. On exit the queue is closed, so
    /// pending and later broadcasts fail instead of waiting.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(env) => self.fan_out(env).await,
                    None => break,
                },
            }
        }
        rx.close();
        self.stopped.cancel();
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        info!(kind = M::KIND, dropped, "relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeCore;
    use crate::types::Genesis;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Peer, Option<Peer>)>>,
    }

    #[async_trait]
    impl PeerTransport for Recorder {
        async fn discover(&self, _: &Peer, _: Vec<Peer>) -> Result<Vec<Peer>, TransportError> {
            Ok(vec![])
        }

        async fn send_tx(&self, peer: &Peer, env: Envelope<Transaction>) -> Result<(), TransportError> {
            if peer.as_str() == "broken" {
                return Err(TransportError::Server("boom".into()));
            }
            self.sent.lock().unwrap().push((peer.clone(), env.originator));
            Ok(())
        }

        async fn send_block(&self, _: &Peer, _: Envelope<Block>) -> Result<(), TransportError> {
            Ok(())
        }

        async fn fetch_genesis(&self, peer: &Peer) -> Result<Genesis, TransportError> {
            Err(TransportError::Server(format!("no genesis at {peer}")))
        }

        async fn fetch_blocks(&self, _: &Peer, _: u64, _: usize) -> Result<Vec<Block>, TransportError> {
            Ok(vec![])
        }

        async fn serve(&self, _: Peer, _: Arc<NodeCore>, cancel: CancellationToken) -> Result<(), TransportError> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_submit_broadcasts_once_and_skips_originator() {
        let peers = Arc::new(PeerSet::new(Peer::from("me"), None, 0));
        peers.merge(["origin", "x", "broken"].map(Peer::from));
        let transport = Arc::new(Recorder::default());
        let events = EventStream::new(8);
        let mut sub = events.subscribe();
        let relay = Arc::new(Relay::<Transaction>::new(
            Peer::from("me"),
            4,
            16,
            peers,
            transport.clone(),
            events.clone(),
        ));
        let cancel = CancellationToken::new();
        let hub = tokio::spawn(events.clone().run(cancel.clone()));
        let task = tokio::spawn(relay.clone().run(cancel.clone()));

        let tx = Transaction::new(crate::types::Address([1; 32]), crate::types::Address([2; 32]), 1, 1);
        assert!(relay.submit(tx.clone(), Some(Peer::from("origin"))).await.unwrap());
        assert!(!relay.submit(tx.clone(), Some(Peer::from("x"))).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();
        hub.await.unwrap();

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![(Peer::from("x"), Some(Peer::from("me")))]);
        assert_eq!(sub.try_recv(), Some(Event::NewPendingTx(tx)));
        assert_eq!(sub.try_recv(), None);
    }

    fn relay_with(capacity: usize) -> (Arc<Relay<Transaction>>, Arc<Recorder>) {
        let peers = Arc::new(PeerSet::new(Peer::from("me"), None, 0));
        peers.merge([Peer::from("x")]);
        let transport = Arc::new(Recorder::default());
        let relay = Arc::new(Relay::<Transaction>::new(
            Peer::from("me"),
            capacity,
            16,
            peers,
            transport.clone(),
            EventStream::new(8),
        ));
        (relay, transport)
    }

    fn tx(nonce: u64) -> Transaction {
        Transaction::new(crate::types::Address([1; 32]), crate::types::Address([2; 32]), 1, nonce)
    }

    #[tokio::test]
    async fn full_queue_holds_broadcast_until_drained() {
        let (relay, transport) = relay_with(1);
        relay.broadcast(tx(1), None).await.unwrap();

        let second = tokio::spawn({
            let relay = relay.clone();
            async move { relay.broadcast(tx(2), None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished(), "second broadcast should wait on a full queue");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay.clone().run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(2), second).await.unwrap().unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.sent.lock().unwrap().len(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_fails_once_relay_has_stopped() {
        let (relay, _) = relay_with(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay.clone().run(cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
        assert!(relay.is_stopped());

        for nonce in 1..=3 {
            let res = tokio::time::timeout(Duration::from_secs(2), relay.submit(tx(nonce), None))
                .await
                .expect("broadcast after shutdown must not wait");
            assert_eq!(res, Err(RelayError::Closed("tx")));
        }
    }

    #[tokio::test]
    async fn blocked_broadcast_is_released_by_shutdown() {
        let (relay, _) = relay_with(1);
        relay.broadcast(tx(1), None).await.unwrap();
        let blocked = tokio::spawn({
            let relay = relay.clone();
            async move { relay.broadcast(tx(2), None).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        relay.clone().run(cancel).await;
        // the run loop may take tx(2) before it sees cancellation
        let res = tokio::time::timeout(Duration::from_secs(2), blocked).await.unwrap().unwrap();
        assert!(matches!(res, Ok(()) | Err(RelayError::Closed("tx"))));
        assert_eq!(relay.broadcast(tx(3), None).await, Err(RelayError::Closed("tx")));
    }

    #[test]
    fn seen_cache_evicts_oldest_first() {
        let mut c = SeenCache::new(2);
        assert!(c.insert([1; 32]));
        assert!(!c.insert([1; 32]));
        assert!(c.insert([2; 32]));
        assert!(c.insert([3; 32]));
        assert!(!c.contains(&[1; 32]));
        assert!(c.contains(&[3; 32]));
        assert_eq!(c.len(), 2);

        c.remove(&[2; 32]);
        assert!(c.insert([2; 32]));
    }
}
