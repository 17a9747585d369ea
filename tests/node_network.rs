//! Multi-node flows over the in-memory transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use authority_chain::crypto::test_keys::key_from_seed;
use authority_chain::crypto::{address_of, sign_tx};
use authority_chain::discovery::{PeerDiscovery, PeerSet};
use authority_chain::node::{Node, NodeError, SubmitError};
use authority_chain::p2p::{Envelope, MemoryNetwork};
use authority_chain::state::TxError;
use authority_chain::sync::SyncError;
use authority_chain::types::{Event, Peer, Transaction};

use common::{config, eventually, start, start_with};

#[tokio::test]
async fn same_tx_from_two_peers_yields_one_pending_event() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;
    let b = start(&net, "b", Some("a")).await;
    let c = start(&net, "c", Some("a")).await;

    let payer = a.authority_key();
    let tx = sign_tx(&payer, Transaction::new(address_of(&payer), address_of(&key_from_seed(9)), 5, 1));

    let mut sub = c.core.subscribe();
    let (r1, r2) = tokio::join!(
        c.core.receive_tx(Envelope::new(tx.clone(), Some(a.peer()))),
        c.core.receive_tx(Envelope::new(tx.clone(), Some(b.peer()))),
    );
    assert_eq!(r1.unwrap(), r2.unwrap());

    let first = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
    assert_eq!(first, Some(Event::NewPendingTx(tx.clone())));

    // gossip echoes from a and b must not raise a second event
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Some(ev) = sub.try_recv() {
        assert!(!matches!(ev, Event::NewPendingTx(_)), "duplicate pending event: {ev:?}");
    }

    for n in [c, b, a] {
        n.stop().await;
    }
}

#[tokio::test]
async fn tx_from_joiner_is_sealed_and_reaches_every_node() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;
    let b = start(&net, "b", Some("a")).await;
    let c = start(&net, "c", Some("a")).await;

    let payer = a.authority_key();
    let payee = address_of(&key_from_seed(9));
    let tx = sign_tx(&payer, Transaction::new(address_of(&payer), payee, 40, 1));
    let mut events = c.core.subscribe();
    b.core.submit_tx(tx).await.unwrap();

    for node in [&a, &b, &c] {
        let core = node.core.clone();
        eventually("block 1 everywhere", || {
            let core = core.clone();
            async move { core.height().await >= 1 }
        })
        .await;
        assert_eq!(node.core.query_account(&payee, false).await.balance, 40);
        assert_eq!(node.core.query_account(&address_of(&payer), false).await.nonce, 1);
    }

    let mut saw_block = false;
    while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        if let Event::NewBlock(b) = ev {
            assert_eq!(b.number, 1);
            saw_block = true;
        }
    }
    assert!(saw_block);

    for n in [c, b, a] {
        n.stop().await;
    }
}

#[tokio::test]
async fn invalid_tx_is_rejected_and_not_remembered() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;
    let payer = a.authority_key();
    let from = address_of(&payer);

    let too_much = sign_tx(&payer, Transaction::new(from, from, 5_000, 1));
    let err = a.core.submit_tx(too_much.clone()).await.unwrap_err();
    assert!(matches!(err, SubmitError::Tx(TxError::InsufficientFunds { .. })));
    // a rejected id is forgotten, so it is validated (and rejected) again
    assert!(a.core.submit_tx(too_much).await.is_err());

    let gap = sign_tx(&payer, Transaction::new(from, from, 1, 3));
    assert!(matches!(
        a.core.submit_tx(gap).await,
        Err(SubmitError::Tx(TxError::InvalidNonce { expected: 1, got: 3 }))
    ));
    a.stop().await;
}

#[tokio::test]
async fn late_joiner_catches_up_before_running() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;
    let payer = a.authority_key();
    let from = address_of(&payer);
    for nonce in 1..=3 {
        let tx = sign_tx(&payer, Transaction::new(from, address_of(&key_from_seed(9)), 1, nonce));
        a.core.submit_tx(tx).await.unwrap();
        let core = a.core.clone();
        eventually("sealed", || {
            let core = core.clone();
            async move { core.height().await >= nonce }
        })
        .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), "late", Some("a"));
    let late = Node::open(cfg, Arc::new(net.clone())).await.unwrap();
    assert_eq!(late.core().height().await, 3);
    assert_eq!(late.core().query_account(&from, false).await.nonce, 3);
    assert_eq!(late.core().genesis(), a.core.genesis());
    a.stop().await;
}

#[tokio::test]
async fn restart_replays_history_and_checks_authority() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;
    let payer = a.authority_key();
    let tx = sign_tx(&payer, Transaction::new(address_of(&payer), address_of(&key_from_seed(9)), 7, 1));
    a.core.submit_tx(tx).await.unwrap();
    let core = a.core.clone();
    eventually("sealed", || {
        let core = core.clone();
        async move { core.height().await >= 1 }
    })
    .await;
    let tip = a.core.status().await.tip;
    let dir = a.stop().await;

    let cfg = config(dir.path(), "a", None);
    let reopened = start_with(&net, cfg, dir).await;
    assert_eq!(reopened.core.height().await, 1);
    assert_eq!(reopened.core.status().await.tip, tip);
    let dir = reopened.stop().await;

    let mut foreign = config(dir.path(), "a", None);
    foreign.key_store_dir = dir.path().join("other-keys");
    let err = Node::open(foreign, Arc::new(net.clone())).await.err().unwrap();
    assert!(matches!(err, NodeError::Sync(SyncError::AuthorityMismatch { .. })));
}

#[tokio::test]
async fn joiner_without_reachable_seed_fails_to_start() {
    let net = MemoryNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path(), "lonely", Some("missing"));
    let err = Node::open(cfg, Arc::new(net)).await.err().unwrap();
    assert!(matches!(err, NodeError::Sync(SyncError::Seed { .. })));
}

#[tokio::test]
async fn joiners_discover_each_other_through_the_seed() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;
    let b = start(&net, "b", Some("a")).await;
    let c = start(&net, "c", Some("a")).await;

    let (bc, cc) = (b.core.clone(), c.core.clone());
    eventually("b knows c", || {
        let bc = bc.clone();
        async move { bc.peers().contains(&Peer::from("c")) }
    })
    .await;
    eventually("c knows b", || {
        let cc = cc.clone();
        async move { cc.peers().contains(&Peer::from("b")) }
    })
    .await;
    assert!(a.core.peers().contains(&Peer::from("b")));

    for n in [c, b, a] {
        n.stop().await;
    }
}

#[tokio::test]
async fn unreachable_peer_is_dropped_after_repeated_failures() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;

    let peers = Arc::new(PeerSet::new(Peer::from("probe"), Some(Peer::from("a")), 2));
    peers.merge([Peer::from("ghost")]);
    let discovery = PeerDiscovery::new(peers.clone(), Arc::new(net.clone()), Duration::from_secs(60));

    discovery.discover_once().await;
    assert!(peers.contains(&Peer::from("ghost")));
    discovery.discover_once().await;
    assert!(!peers.contains(&Peer::from("ghost")));

    net.set_down(&Peer::from("a"), true);
    for _ in 0..4 {
        discovery.discover_once().await;
    }
    assert!(peers.contains(&Peer::from("a")), "seed is never dropped");
    net.set_down(&Peer::from("a"), false);
    a.stop().await;
}

#[tokio::test]
async fn stopped_node_refuses_work_instead_of_hanging() {
    let net = MemoryNetwork::new();
    let a = start(&net, "a", None).await;
    let payer = a.authority_key();
    let from = address_of(&payer);
    let core = a.core.clone();
    a.stop().await;

    for nonce in 1..=3 {
        let tx = sign_tx(&payer, Transaction::new(from, address_of(&key_from_seed(9)), 1, nonce));
        let res = tokio::time::timeout(Duration::from_secs(2), core.submit_tx(tx))
            .await
            .expect("submit after shutdown must return");
        assert!(matches!(res, Err(SubmitError::Relay(_))), "got {res:?}");
    }

    let mut late = core.subscribe();
    let next = tokio::time::timeout(Duration::from_secs(2), late.recv()).await.unwrap();
    assert_eq!(next, None);
}

/// Pending-view reads take the ledger read lock, so a reader never sees a
/// transfer half-applied, even while the proposer keeps sealing blocks.
#[tokio::test]
async fn pending_queries_see_consistent_snapshots_during_proposals() {
    let net = MemoryNetwork::new();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "a", None);
    cfg.proposal_interval_ms = 5;
    let a = start_with(&net, cfg, dir).await;

    let payer = a.authority_key();
    let from = address_of(&payer);
    let to = address_of(&key_from_seed(9));

    let writer = {
        let core = a.core.clone();
        tokio::spawn(async move {
            for _ in 0..60 {
                let nonce = core.query_account(&from, true).await.nonce + 1;
                let tx = sign_tx(&payer, Transaction::new(from, to, 1, nonce));
                // a proposal may land between nonce lookup and submit
                let _ = core.submit_tx(tx).await;
                tokio::task::yield_now().await;
            }
        })
    };

    let reader = {
        let core = a.core.clone();
        tokio::spawn(async move {
            let mut checks = 0;
            while checks < 500 {
                let (pending_sum, committed_sum) = core
                    .with_ledger(|l| {
                        let p = l.pending();
                        (p.balance(&from) + p.balance(&to), l.balance(&from) + l.balance(&to))
                    })
                    .await;
                assert_eq!(pending_sum, 1_000);
                assert_eq!(committed_sum, 1_000);
                checks += 1;
                tokio::task::yield_now().await;
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
    assert!(a.core.height().await >= 1);
    a.stop().await;
}
