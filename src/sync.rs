// src/sync.rs

use std::time::Duration;

use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::p2p::{PeerTransport, TransportError};
use crate::state::{BlockError, Ledger, ReplayError};
use crate::store::{BlockStore, StoreError};
use crate::types::{Address, Block, Genesis, Peer};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("history replay failed: {0}")]
    Replay(#[from] ReplayError),
    #[error("bootstrap node has no authority key")]
    MissingAuthority,
    #[error("stored genesis names authority {stored}, but this node's key is {local}")]
    AuthorityMismatch { stored: Address, local: Address },
    #[error("seed serves chain {remote:?}, expected {local:?}")]
    ChainMismatch { local: String, remote: String },
    #[error("no seed peer configured and no local history")]
    NoSeed,
    #[error("seed {peer} unavailable: {source}")]
    Seed { peer: Peer, source: TransportError },
    #[error("block {number} from seed rejected: {source}")]
    Block { number: u64, source: CommitError },
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Clone, apply, persist, commit, reset pending. Nothing is persisted or
/// committed unless the block applies cleanly.
pub fn commit_persisted(ledger: &mut Ledger, store: &BlockStore, block: &Block) -> Result<(), CommitError> {
    let mut next = ledger.clone();
    next.apply_block(block)?;
    store.write_block(block)?;
    ledger.apply(next);
    ledger.reset_pending();
    Ok(())
}

/// Rebuilds the ledger before any loop starts. `authority` is this node's
/// key address when it is the bootstrap (authority) node.
pub async fn sync_state(
    cfg: &NodeConfig,
    store: &BlockStore,
    authority: Option<Address>,
    transport: &dyn PeerTransport,
) -> Result<(Genesis, Ledger), SyncError> {
    let had_history = store.has_history()?;

    let genesis = match store.read_genesis()? {
        Some(g) => g,
        None if cfg.bootstrap => {
            let auth = authority.ok_or(SyncError::MissingAuthority)?;
            let g = Genesis::new(cfg.chain.clone(), auth).with_balance(auth, cfg.balance);
            store.write_genesis(&g)?;
            info!(chain = %g.chain, authority = %auth.short(), balance = cfg.balance, "created genesis");
            g
        }
        None => {
            let seed = cfg.seed_peer().ok_or(SyncError::NoSeed)?;
            let g = fetch_genesis(cfg, &seed, transport).await?;
            if g.chain != cfg.chain {
                return Err(SyncError::ChainMismatch { local: cfg.chain.clone(), remote: g.chain });
            }
            store.write_genesis(&g)?;
            info!(chain = %g.chain, %seed, "fetched genesis from seed");
            g
        }
    };

    if cfg.bootstrap {
        let local = authority.ok_or(SyncError::MissingAuthority)?;
        if genesis.authority != local {
            return Err(SyncError::AuthorityMismatch { stored: genesis.authority, local });
        }
    }

    let mut ledger = Ledger::new(&genesis);
    let replayed = ledger.read_blocks(store.read_blocks()?)?;
    if replayed > 0 {
        info!(blocks = replayed, tip = ledger.last_block().number, "replayed local history");
    }

    if !cfg.bootstrap {
        if let Some(seed) = cfg.seed_peer() {
            match catch_up(&mut ledger, store, &seed, transport, cfg.sync_batch).await {
                Ok(n) if n > 0 => info!(blocks = n, tip = ledger.last_block().number, %seed, "caught up with seed"),
                Ok(_) => {}
                Err(SyncError::Seed { peer, source }) if had_history => {
                    warn!(%peer, error = %source, "seed unreachable, continuing from local history");
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok((genesis, ledger))
}

async fn fetch_genesis(cfg: &NodeConfig, seed: &Peer, transport: &dyn PeerTransport) -> Result<Genesis, SyncError> {
    let attempts = cfg.sync_retries.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match transport.fetch_genesis(seed).await {
            Ok(g) => return Ok(g),
            Err(e) => {
                warn!(%seed, attempt, error = %e, "genesis fetch failed");
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
            }
        }
    }
    match last {
        Some(source) => Err(SyncError::Seed { peer: seed.clone(), source }),
        None => Err(SyncError::NoSeed),
    }
}

/// Pulls blocks after the local tip from `seed` until it has no more.
pub async fn catch_up(
    ledger: &mut Ledger,
    store: &BlockStore,
    seed: &Peer,
    transport: &dyn PeerTransport,
    batch: usize,
) -> Result<u64, SyncError> {
    let mut applied = 0;
    loop {
        let from = ledger.last_block().number + 1;
        let blocks = transport
            .fetch_blocks(seed, from, batch.max(1))
            .await
            .map_err(|source| SyncError::Seed { peer: seed.clone(), source })?;
        if blocks.is_empty() {
            return Ok(applied);
        }
        for block in &blocks {
            commit_persisted(ledger, store, block)
                .map_err(|source| SyncError::Block { number: block.number, source })?;
            applied += 1;
        }
    }
}
