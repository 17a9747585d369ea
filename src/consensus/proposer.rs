// src/consensus/proposer.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::node::SubmitError;
use crate::types::Block;

pub const DEFAULT_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct ProposerConfig {
    pub interval_ms: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self { interval_ms: DEFAULT_INTERVAL_MS }
    }
}

// Generic over the node so tests can drive the loop with a fake
#[async_trait]
pub trait ProposerNode: Send + Sync {
    async fn height(&self) -> u64;

    /// Builds, signs, commits and relays a block; `None` when nothing is pending.
    async fn propose_block(&self) -> Result<Option<Block>, SubmitError>;
}

#[async_trait]
impl<N: ProposerNode + ?Sized> ProposerNode for Arc<N> {
    async fn height(&self) -> u64 {
        (**self).height().await
    }

    async fn propose_block(&self) -> Result<Option<Block>, SubmitError> {
        (**self).propose_block().await
    }
}

pub struct BlockProposer<N> {
    pub node: N,
    cfg: ProposerConfig,
}

impl<N: ProposerNode> BlockProposer<N> {
    pub fn new(node: N, cfg: ProposerConfig) -> Self {
        let cfg = ProposerConfig { interval_ms: cfg.interval_ms.max(1) };
        Self { node, cfg }
    }

    /// One proposal attempt. True if the chain advanced.
    pub async fn tick_once(&self) -> bool {
        let before = self.node.height().await;
        match self.node.propose_block().await {
            Ok(Some(block)) => {
                info!(number = block.number, txs = block.transactions.len(), "proposed block");
            }
            Ok(None) => debug!(height = before, "nothing pending, no block"),
            Err(e) => warn!(height = before, error = %e, "block proposal failed"),
        }
        self.node.height().await > before
    }

    pub async fn run_for_ticks(&self, n: u64) {
        for _ in 0..n {
            self.tick_once().await;
        }
    }

    pub async fn run_until_height(&self, h: u64, cancel: &CancellationToken) {
        let mut ticker = self.ticker();
        while self.node.height().await < h {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => { self.tick_once().await; }
            }
        }
    }

    fn ticker(&self) -> tokio::time::Interval {
        let period = Duration::from_millis(self.cfg.interval_ms);
        // first proposal one full interval after start
        let mut t = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = self.ticker();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => { self.tick_once().await; }
            }
        }
        info!("block proposer stopped");
    }
}
