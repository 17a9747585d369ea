use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use authority_chain::consensus::{BlockProposer, ProposerConfig, ProposerNode};
use authority_chain::node::SubmitError;
use authority_chain::types::{Block, ZERO_HASH};

#[derive(Default)]
struct FakeState {
    height: u64,
    ticks: u64,
    // heights at which a tick finds nothing pending
    idle_at: Vec<u64>,
    fail_next: bool,
}

struct FakeNode {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl ProposerNode for FakeNode {
    async fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    async fn propose_block(&self) -> Result<Option<Block>, SubmitError> {
        let mut st = self.state.lock().unwrap();
        st.ticks += 1;
        if std::mem::take(&mut st.fail_next) {
            return Err(SubmitError::NotAuthority);
        }
        if st.idle_at.contains(&st.height) {
            return Ok(None);
        }
        st.height += 1;
        Ok(Some(Block::new(st.height, ZERO_HASH, vec![])))
    }
}

fn proposer(state: &Arc<Mutex<FakeState>>, interval_ms: u64) -> BlockProposer<FakeNode> {
    BlockProposer::new(FakeNode { state: state.clone() }, ProposerConfig { interval_ms })
}

#[tokio::test]
async fn run_for_ticks_proposes_once_per_tick() {
    let state = Arc::new(Mutex::new(FakeState::default()));
    proposer(&state, 1).run_for_ticks(5).await;
    let st = state.lock().unwrap();
    assert_eq!(st.height, 5);
    assert_eq!(st.ticks, 5);
}

#[tokio::test]
async fn idle_and_failed_ticks_do_not_advance() {
    let state = Arc::new(Mutex::new(FakeState { idle_at: vec![1], ..Default::default() }));
    let p = proposer(&state, 1);
    assert!(p.tick_once().await);
    assert!(!p.tick_once().await);

    {
        let mut st = state.lock().unwrap();
        st.idle_at.clear();
        st.fail_next = true;
    }
    assert!(!p.tick_once().await);
    assert!(p.tick_once().await);
    assert_eq!(state.lock().unwrap().height, 2);
}

#[tokio::test]
async fn run_until_height_stops_exactly() {
    let state = Arc::new(Mutex::new(FakeState::default()));
    let cancel = CancellationToken::new();
    proposer(&state, 1).run_until_height(7, &cancel).await;
    let st = state.lock().unwrap();
    assert_eq!(st.height, 7);
    assert_eq!(st.ticks, 7);
}

#[tokio::test]
async fn run_ticks_on_interval_until_cancelled() {
    let state = Arc::new(Mutex::new(FakeState::default()));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(proposer(&state, 100).run(cancel.clone()));

    // first proposal comes one interval after start
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.lock().unwrap().ticks, 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    cancel.cancel();
    task.await.unwrap();
    let ticks = state.lock().unwrap().ticks;
    assert!((3..=5).contains(&ticks), "ticks={ticks} outside 3-5");
}
