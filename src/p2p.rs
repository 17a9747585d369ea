// src/p2p.rs

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::node::NodeCore;
use crate::rpc;
use crate::types::{Block, Genesis, Peer, Transaction};

/// Gossip wrapper. `originator` is the peer that handed us the payload and
/// never receives it back from us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub payload: M,
    pub originator: Option<Peer>,
}

impl<M> Envelope<M> {
    pub fn new(payload: M, originator: Option<Peer>) -> Self {
        Self { payload, originator }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: Peer, reason: String },
    #[error("peer {peer} rejected request ({status}): {body}")]
    Rejected { peer: Peer, status: u16, body: String },
    #[error("undecodable response from {peer}: {reason}")]
    Decode { peer: Peer, reason: String },
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("listener failed: {0}")]
    Server(String),
}

impl TransportError {
    fn unreachable(peer: &Peer, reason: impl ToString) -> Self {
        Self::Unreachable { peer: peer.clone(), reason: reason.to_string() }
    }
}

/// Everything the node needs from the network, both directions.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn discover(&self, peer: &Peer, known: Vec<Peer>) -> Result<Vec<Peer>, TransportError>;

    async fn send_tx(&self, peer: &Peer, env: Envelope<Transaction>) -> Result<(), TransportError>;

    async fn send_block(&self, peer: &Peer, env: Envelope<Block>) -> Result<(), TransportError>;

    async fn fetch_genesis(&self, peer: &Peer) -> Result<Genesis, TransportError>;

    async fn fetch_blocks(&self, peer: &Peer, from: u64, limit: usize) -> Result<Vec<Block>, TransportError>;

    /// Runs the inbound side for `core` until `cancel` fires.
    async fn serve(&self, local: Peer, core: Arc<NodeCore>, cancel: CancellationToken) -> Result<(), TransportError>;
}

// ---------------- HTTP ----------------

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Server(e.to_string()))?;
        Ok(Self { client })
    }

    fn url(peer: &Peer, path: &str) -> String {
        format!("http://{peer}{path}")
    }

    async fn check(peer: &Peer, resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Rejected { peer: peer.clone(), status: status.as_u16(), body })
    }

    async fn post<B: Serialize + Sync>(&self, peer: &Peer, path: &str, body: &B) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .post(Self::url(peer, path))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::unreachable(peer, e))?;
        Self::check(peer, resp).await
    }

    async fn get(&self, peer: &Peer, path: &str) -> Result<reqwest::Response, TransportError> {
        let resp = self
            .client
            .get(Self::url(peer, path))
            .send()
            .await
            .map_err(|e| TransportError::unreachable(peer, e))?;
        Self::check(peer, resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(peer: &Peer, resp: reqwest::Response) -> Result<T, TransportError> {
        resp.json::<T>()
            .await
            .map_err(|e| TransportError::Decode { peer: peer.clone(), reason: e.to_string() })
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn discover(&self, peer: &Peer, known: Vec<Peer>) -> Result<Vec<Peer>, TransportError> {
        let resp = self.post(peer, "/peers/discover", &known).await?;
        Self::decode(peer, resp).await
    }

    async fn send_tx(&self, peer: &Peer, env: Envelope<Transaction>) -> Result<(), TransportError> {
        self.post(peer, "/relay/tx", &env).await.map(|_| ())
    }

    async fn send_block(&self, peer: &Peer, env: Envelope<Block>) -> Result<(), TransportError> {
        self.post(peer, "/relay/block", &env).await.map(|_| ())
    }

    async fn fetch_genesis(&self, peer: &Peer) -> Result<Genesis, TransportError> {
        let resp = self.get(peer, "/genesis").await?;
        Self::decode(peer, resp).await
    }

    async fn fetch_blocks(&self, peer: &Peer, from: u64, limit: usize) -> Result<Vec<Block>, TransportError> {
        let resp = self.get(peer, &format!("/blocks?from={from}&limit={limit}")).await?;
        Self::decode(peer, resp).await
    }

    async fn serve(&self, local: Peer, core: Arc<NodeCore>, cancel: CancellationToken) -> Result<(), TransportError> {
        let listener = TcpListener::bind(local.as_str())
            .await
            .map_err(|source| TransportError::Bind { addr: local.to_string(), source })?;
        info!(addr = %local, "listening");
        let app = rpc::router(rpc::AppState { core });
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| TransportError::Server(e.to_string()))?;
        info!(addr = %local, "listener closed");
        Ok(())
    }
}

// ---------------- in-memory ----------------

#[derive(Default)]
struct Registry {
    nodes: HashMap<Peer, Weak<NodeCore>>,
    down: HashSet<Peer>,
}

/// In-process network: every node served on it is reachable by its peer
/// name without sockets. Peers can be cut off with [`MemoryNetwork::set_down`].
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, peer: &Peer, down: bool) {
        let mut reg = self.registry.write().unwrap_or_else(|p| p.into_inner());
        if down {
            reg.down.insert(peer.clone());
        } else {
            reg.down.remove(peer);
        }
    }

    pub fn is_registered(&self, peer: &Peer) -> bool {
        let reg = self.registry.read().unwrap_or_else(|p| p.into_inner());
        reg.nodes.get(peer).and_then(Weak::upgrade).is_some()
    }

    fn lookup(&self, peer: &Peer) -> Result<Arc<NodeCore>, TransportError> {
        let reg = self.registry.read().unwrap_or_else(|p| p.into_inner());
        if reg.down.contains(peer) {
            return Err(TransportError::unreachable(peer, "marked down"));
        }
        reg.nodes
            .get(peer)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::unreachable(peer, "no such node"))
    }

    fn rejected(peer: &Peer, e: impl ToString) -> TransportError {
        TransportError::Rejected { peer: peer.clone(), status: 400, body: e.to_string() }
    }
}

#[async_trait]
impl PeerTransport for MemoryNetwork {
    async fn discover(&self, peer: &Peer, known: Vec<Peer>) -> Result<Vec<Peer>, TransportError> {
        Ok(self.lookup(peer)?.discover(known))
    }

    async fn send_tx(&self, peer: &Peer, env: Envelope<Transaction>) -> Result<(), TransportError> {
        let core = self.lookup(peer)?;
        core.receive_tx(env).await.map(|_| ()).map_err(|e| Self::rejected(peer, e))
    }

    async fn send_block(&self, peer: &Peer, env: Envelope<Block>) -> Result<(), TransportError> {
        let core = self.lookup(peer)?;
        core.receive_block(env).await.map(|_| ()).map_err(|e| Self::rejected(peer, e))
    }

    async fn fetch_genesis(&self, peer: &Peer) -> Result<Genesis, TransportError> {
        Ok(self.lookup(peer)?.genesis().clone())
    }

    async fn fetch_blocks(&self, peer: &Peer, from: u64, limit: usize) -> Result<Vec<Block>, TransportError> {
        self.lookup(peer)?
            .blocks_from(from, limit)
            .map_err(|e| Self::rejected(peer, e))
    }

    async fn serve(&self, local: Peer, core: Arc<NodeCore>, cancel: CancellationToken) -> Result<(), TransportError> {
        {
            let mut reg = self.registry.write().unwrap_or_else(|p| p.into_inner());
            if reg.nodes.get(&local).and_then(Weak::upgrade).is_some() {
                return Err(TransportError::Bind {
                    addr: local.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "peer name taken"),
                });
            }
            reg.nodes.insert(local.clone(), Arc::downgrade(&core));
        }
        debug!(peer = %local, "joined memory network");
        drop(core);
        cancel.cancelled().await;
        self.registry
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .nodes
            .remove(&local);
        debug!(peer = %local, "left memory network");
        Ok(())
    }
}
