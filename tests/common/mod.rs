#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use authority_chain::config::NodeConfig;
use authority_chain::keys::KeyStore;
use authority_chain::node::{Node, NodeCore, NodeError, AUTHORITY_KEY};
use authority_chain::p2p::MemoryNetwork;
use authority_chain::types::Peer;

pub const PASS: &str = "test-pass";

pub struct TestNode {
    pub core: Arc<NodeCore>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), NodeError>>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn peer(&self) -> Peer {
        self.core.local().clone()
    }

    pub fn authority_key(&self) -> SigningKey {
        KeyStore::open(self.dir.path().join("keys"))
            .unwrap()
            .load(AUTHORITY_KEY, PASS)
            .unwrap()
    }

    pub async fn stop(self) -> TempDir {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
        self.dir
    }
}

pub fn config(dir: &Path, name: &str, seed: Option<&str>) -> NodeConfig {
    NodeConfig {
        node_addr: name.to_string(),
        bootstrap: seed.is_none(),
        seed_addr: seed.map(str::to_string),
        key_store_dir: dir.join("keys"),
        block_store_dir: dir.join("blocks"),
        chain: "test".to_string(),
        auth_pass: PASS.to_string(),
        balance: 1_000,
        discovery_interval_ms: 50,
        proposal_interval_ms: 100,
        request_timeout_ms: 500,
        sync_retries: 2,
        key_kdf_memory_kib: 64,
        ..NodeConfig::default()
    }
}

pub async fn start_with(net: &MemoryNetwork, cfg: NodeConfig, dir: TempDir) -> TestNode {
    let peer = cfg.local_peer();
    let node = Node::open(cfg, Arc::new(net.clone())).await.unwrap();
    let core = node.core();
    let cancel = node.cancel_token();
    let handle = tokio::spawn(node.run());
    let n = net.clone();
    eventually("node registered", || {
        let n = n.clone();
        let peer = peer.clone();
        async move { n.is_registered(&peer) }
    })
    .await;
    TestNode { core, cancel, handle, dir }
}

pub async fn start(net: &MemoryNetwork, name: &str, seed: Option<&str>) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), name, seed);
    start_with(net, cfg, dir).await
}

/// Polls `check` every 20ms for up to 5s.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}
