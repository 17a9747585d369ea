// src/bin/localnet.rs
//
// Three nodes on loopback over real HTTP: an authority on :9000 and two
// joiners seeded from it. The authority key pays a fixed account every
// couple of seconds; Ctrl-C stops everything.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use authority_chain::config::NodeConfig;
use authority_chain::crypto::{address_of, sign_tx, test_keys::key_from_seed};
use authority_chain::keys::KeyStore;
use authority_chain::node::{Node, AUTHORITY_KEY};
use authority_chain::p2p::HttpTransport;
use authority_chain::types::Transaction;

const PASS: &str = "localnet";

fn node_config(root: &Path, port: u16, bootstrap: bool) -> NodeConfig {
    let dir = root.join(format!("node-{port}"));
    NodeConfig {
        node_addr: format!("127.0.0.1:{port}"),
        bootstrap,
        seed_addr: (!bootstrap).then(|| "127.0.0.1:9000".to_string()),
        key_store_dir: dir.join("keys"),
        block_store_dir: dir.join("blocks"),
        chain: "localnet".to_string(),
        auth_pass: PASS.to_string(),
        balance: 1_000_000,
        discovery_interval_ms: 2_000,
        proposal_interval_ms: 3_000,
        ..NodeConfig::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = std::env::temp_dir().join("authority-chain-localnet");
    let transport = Arc::new(HttpTransport::new(Duration::from_secs(3))?);

    // --- authority first: joiners fetch genesis from it ---
    let authority_cfg = node_config(&root, 9000, true);
    let key_dir = authority_cfg.key_store_dir.clone();
    let authority = Node::open(authority_cfg, transport.clone()).await?;
    let core = authority.core();
    let mut handles = vec![tokio::spawn(authority.run())];
    sleep(Duration::from_millis(300)).await;

    for port in [9001, 9002] {
        let node = Node::open(node_config(&root, port, false), transport.clone()).await?;
        handles.push(tokio::spawn(node.run()));
    }

    // --- traffic: authority key pays a fixed account ---
    let payer = KeyStore::open(&key_dir)?.load(AUTHORITY_KEY, PASS)?;
    let payee = address_of(&key_from_seed(42));
    info!(payer = %address_of(&payer).short(), payee = %payee.short(), "sending transfers");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(Duration::from_secs(2)) => {
                let from = address_of(&payer);
                let nonce = core.query_account(&from, true).await.nonce + 1;
                let tx = sign_tx(&payer, Transaction::new(from, payee, 10, nonce));
                if let Err(e) = core.submit_tx(tx).await {
                    info!(error = %e, "transfer rejected");
                }
                let status = core.status().await;
                let paid = core.query_account(&payee, false).await;
                info!(height = status.height, pending = status.pending, peers = status.peers.len(), payee_balance = paid.balance, "tick");
            }
        }
    }

    for h in handles {
        h.await??;
    }
    Ok(())
}
