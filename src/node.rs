// src/node.rs

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use serde::Serialize;
use serde_with::{hex::Hex, serde_as};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{BlockProposer, ProposerConfig, ProposerNode};
use crate::crypto::{address_of, block_hash, sign_block, tx_hash};
use crate::discovery::{PeerDiscovery, PeerSet};
use crate::events::{EventStream, Subscription};
use crate::keys::{KeyError, KeyStore};
use crate::p2p::{Envelope, PeerTransport, TransportError};
use crate::relay::{Relay, RelayError};
use crate::state::{BlockError, Ledger, TxError};
use crate::store::{BlockStore, StoreError};
use crate::sync::{commit_persisted, sync_state, CommitError, SyncError};
use crate::types::{short_hex, AccountView, Address, Block, Genesis, Hash, Peer, Transaction};

pub const AUTHORITY_KEY: &str = "authority";

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("block store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("this node is not the chain authority")]
    NotAuthority,
}

impl From<CommitError> for SubmitError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::Block(b) => SubmitError::Block(b),
            CommitError::Store(s) => SubmitError::Store(s),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("state sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node: Peer,
    pub chain: String,
    pub authority: Address,
    pub is_authority: bool,
    pub height: u64,
    #[serde_as(as = "Hex")]
    pub tip: Hash,
    pub pending: usize,
    pub peers: Vec<Peer>,
}

/// Shared state behind every task and every inbound request.
///
/// The ledger sits behind one `RwLock`: submissions, block commits and
/// proposals take it for writing, queries for reading, so a query always
/// sees a view between two mutations.
pub struct NodeCore {
    local: Peer,
    genesis: Genesis,
    key: Option<SigningKey>,
    ledger: RwLock<Ledger>,
    store: BlockStore,
    peers: Arc<PeerSet>,
    tx_relay: Arc<Relay<Transaction>>,
    block_relay: Arc<Relay<Block>>,
    events: EventStream,
}

impl NodeCore {
    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn is_authority(&self) -> bool {
        self.key.is_some()
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Client submission.
    pub async fn submit_tx(&self, tx: Transaction) -> Result<Hash, SubmitError> {
        self.accept_tx(tx, None).await
    }

    /// Gossip from a peer.
    pub async fn receive_tx(&self, env: Envelope<Transaction>) -> Result<Hash, SubmitError> {
        self.accept_tx(env.payload, env.originator).await
    }

    pub async fn submit_block(&self, block: Block) -> Result<Hash, SubmitError> {
        self.accept_block(block, None).await
    }

    pub async fn receive_block(&self, env: Envelope<Block>) -> Result<Hash, SubmitError> {
        self.accept_block(env.payload, env.originator).await
    }

    // Seen-marking and validation happen under the same write lock, so two
    // copies racing in from different peers cannot both pass.
    async fn accept_tx(&self, tx: Transaction, origin: Option<Peer>) -> Result<Hash, SubmitError> {
        let hash = tx_hash(&tx);
        {
            let mut ledger = self.ledger.write().await;
            if !self.tx_relay.admit(hash) {
                return Ok(hash);
            }
            if let Err(e) = ledger.pending_mut().apply_tx(&tx) {
                self.tx_relay.forget(&hash);
                debug!(tx = %short_hex(&hash), error = %e, "rejected tx");
                return Err(e.into());
            }
        }
        debug!(tx = %short_hex(&hash), from = %tx.from.short(), nonce = tx.nonce, "accepted pending tx");
        self.tx_relay.broadcast(tx, origin).await?;
        Ok(hash)
    }

    async fn accept_block(&self, block: Block, origin: Option<Peer>) -> Result<Hash, SubmitError> {
        let hash = block_hash(&block);
        {
            let mut ledger = self.ledger.write().await;
            if !self.block_relay.admit(hash) {
                return Ok(hash);
            }
            if let Err(e) = commit_persisted(&mut ledger, &self.store, &block) {
                self.block_relay.forget(&hash);
                warn!(number = block.number, block = %short_hex(&hash), error = %e, "rejected block");
                return Err(e.into());
            }
        }
        info!(number = block.number, block = %short_hex(&hash), txs = block.transactions.len(), "committed block");
        self.block_relay.broadcast(block, origin).await?;
        Ok(hash)
    }

    /// Authority only: seals the pending pool into a signed block, commits it
    /// and hands it to the block relay. `None` when no transaction survives.
    pub async fn propose_block(&self) -> Result<Option<Block>, SubmitError> {
        let key = self.key.as_ref().ok_or(SubmitError::NotAuthority)?;
        let block = {
            let mut ledger = self.ledger.write().await;
            let created = ledger.create_block();
            if created.block.transactions.is_empty() {
                if !created.dropped.is_empty() {
                    // nothing in the pool can ever apply again
                    ledger.reset_pending();
                }
                return Ok(None);
            }
            let block = sign_block(key, created.block);
            let hash = block_hash(&block);
            self.block_relay.admit(hash);
            if let Err(e) = commit_persisted(&mut ledger, &self.store, &block) {
                self.block_relay.forget(&hash);
                return Err(e.into());
            }
            info!(number = block.number, block = %short_hex(&hash), txs = block.transactions.len(), "sealed block");
            block
        };
        self.block_relay.broadcast(block.clone(), None).await?;
        Ok(Some(block))
    }

    pub async fn query_account(&self, who: &Address, pending: bool) -> AccountView {
        let ledger = self.ledger.read().await;
        if pending {
            ledger.pending().account(who)
        } else {
            ledger.account(who)
        }
    }

    pub fn discover(&self, known: Vec<Peer>) -> Vec<Peer> {
        self.peers.handle_discover(known)
    }

    pub fn blocks_from(&self, from: u64, limit: usize) -> Result<Vec<Block>, StoreError> {
        self.store.blocks_from(from, limit)
    }

    pub async fn height(&self) -> u64 {
        self.ledger.read().await.last_block().number
    }

    pub async fn pending_txs(&self) -> Vec<Transaction> {
        self.ledger.read().await.pending().txs().cloned().collect()
    }

    /// Read-only access to the whole ledger under the read lock.
    pub async fn with_ledger<R>(&self, f: impl FnOnce(&Ledger) -> R) -> R {
        let ledger = self.ledger.read().await;
        f(&ledger)
    }

    pub async fn status(&self) -> NodeStatus {
        let ledger = self.ledger.read().await;
        NodeStatus {
            node: self.local.clone(),
            chain: self.genesis.chain.clone(),
            authority: self.genesis.authority,
            is_authority: self.is_authority(),
            height: ledger.last_block().number,
            tip: ledger.last_hash(),
            pending: ledger.pending().len(),
            peers: self.peers.snapshot(),
        }
    }
}

#[async_trait::async_trait]
impl ProposerNode for NodeCore {
    async fn height(&self) -> u64 {
        NodeCore::height(self).await
    }

    async fn propose_block(&self) -> Result<Option<Block>, SubmitError> {
        NodeCore::propose_block(self).await
    }
}

/// Owns the cancellation token and every long-running task.
pub struct Node {
    cfg: NodeConfig,
    core: Arc<NodeCore>,
    transport: Arc<dyn PeerTransport>,
    cancel: CancellationToken,
}

impl Node {
    /// Loads keys and rebuilds state. Any error here means the node must not start.
    pub async fn open(cfg: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Self, NodeError> {
        cfg.validate()?;
        let store = BlockStore::open(&cfg.block_store_dir)?;
        let key = if cfg.bootstrap {
            let ks = KeyStore::open(&cfg.key_store_dir)?.with_kdf_memory(cfg.key_kdf_memory_kib);
            Some(ks.load_or_create(AUTHORITY_KEY, &cfg.auth_pass)?)
        } else {
            None
        };
        let authority = key.as_ref().map(address_of);

        let (genesis, ledger) = sync_state(&cfg, &store, authority, transport.as_ref()).await?;
        info!(
            node = %cfg.node_addr,
            chain = %genesis.chain,
            height = ledger.last_block().number,
            authority = key.is_some(),
            "state ready"
        );

        let local = cfg.local_peer();
        let peers = Arc::new(PeerSet::new(local.clone(), cfg.seed_peer(), cfg.max_peer_failures));
        let events = EventStream::new(cfg.event_capacity);
        let tx_relay = Arc::new(Relay::new(
            local.clone(),
            cfg.tx_relay_capacity,
            cfg.seen_capacity,
            peers.clone(),
            transport.clone(),
            events.clone(),
        ));
        let block_relay = Arc::new(Relay::new(
            local.clone(),
            cfg.block_relay_capacity,
            cfg.seen_capacity,
            peers.clone(),
            transport.clone(),
            events.clone(),
        ));

        let core = Arc::new(NodeCore {
            local,
            genesis,
            key,
            ledger: RwLock::new(ledger),
            store,
            peers,
            tx_relay,
            block_relay,
            events,
        });
        Ok(Self { cfg, core, transport, cancel: CancellationToken::new() })
    }

    pub fn core(&self) -> Arc<NodeCore> {
        self.core.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every loop until cancellation, Ctrl-C or a fatal listener error,
    /// then waits for all of them to exit.
    pub async fn run(self) -> Result<(), NodeError> {
        let Node { cfg, core, transport, cancel } = self;
        let (err_tx, mut err_rx) = mpsc::channel::<NodeError>(1);
        let mut tasks = JoinSet::new();

        tasks.spawn(core.events.clone().run(cancel.clone()));

        {
            let (transport, core, cancel) = (transport.clone(), core.clone(), cancel.clone());
            let local = core.local.clone();
            tasks.spawn(async move {
                if let Err(e) = transport.serve(local, core, cancel).await {
                    error!(error = %e, "listener failed");
                    let _ = err_tx.send(e.into()).await;
                }
            });
        }

        let discovery = PeerDiscovery::new(core.peers.clone(), transport.clone(), cfg.discovery_interval());
        tasks.spawn(discovery.run(cancel.clone()));
        tasks.spawn(core.tx_relay.clone().run(cancel.clone()));
        tasks.spawn(core.block_relay.clone().run(cancel.clone()));

        if core.is_authority() {
            let proposer = BlockProposer::new(core.clone(), ProposerConfig { interval_ms: cfg.proposal_interval_ms });
            tasks.spawn(proposer.run(cancel.clone()));
        }
        info!(node = %core.local, tasks = tasks.len(), "node running");

        let mut fatal = None;
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "signal handler failed");
                }
                info!("shutdown requested");
            }
            Some(e) = err_rx.recv() => fatal = Some(e),
        }

        cancel.cancel();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "task ended abnormally");
            }
        }
        info!(node = %core.local, "node stopped");

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
