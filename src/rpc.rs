// src/rpc.rs
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};

use crate::node::{NodeCore, NodeStatus, SubmitError};
use crate::p2p::Envelope;
use crate::types::{AccountView, Address, Block, Event, Genesis, Peer, Transaction};

pub const MAX_BLOCKS_PER_REQUEST: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<NodeCore>,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResp {
    pub hash: String,
}

#[derive(Deserialize)]
struct AccountQuery {
    #[serde(default)]
    pending: bool,
}

#[derive(Deserialize)]
struct BlocksQuery {
    #[serde(default)]
    from: u64,
    limit: Option<usize>,
}

pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let status = match &e {
            SubmitError::Tx(_) | SubmitError::Block(_) => StatusCode::BAD_REQUEST,
            SubmitError::Relay(_) => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::NotAuthority => StatusCode::FORBIDDEN,
            SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/accounts/:address", get(account))
        .route("/tx", post(submit_tx))
        .route("/block", post(submit_block))
        .route("/relay/tx", post(relay_tx))
        .route("/relay/block", post(relay_block))
        .route("/peers/discover", post(discover))
        .route("/events", get(events))
        .route("/genesis", get(genesis))
        .route("/blocks", get(blocks))
        .with_state(state)
}

async fn health() -> &'static str { "ok" }

async fn status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.core.status().await)
}

async fn account(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Query(q): Query<AccountQuery>,
) -> Result<Json<AccountView>, ApiError> {
    let who: Address = addr
        .parse()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("bad address: {e}")))?;
    Ok(Json(state.core.query_account(&who, q.pending).await))
}

fn submitted(hash: [u8; 32]) -> Json<SubmitResp> {
    Json(SubmitResp { hash: hex::encode(hash) })
}

async fn submit_tx(State(state): State<AppState>, Json(tx): Json<Transaction>) -> Result<Json<SubmitResp>, ApiError> {
    Ok(submitted(state.core.submit_tx(tx).await?))
}

async fn submit_block(State(state): State<AppState>, Json(b): Json<Block>) -> Result<Json<SubmitResp>, ApiError> {
    Ok(submitted(state.core.submit_block(b).await?))
}

async fn relay_tx(
    State(state): State<AppState>,
    Json(env): Json<Envelope<Transaction>>,
) -> Result<Json<SubmitResp>, ApiError> {
    Ok(submitted(state.core.receive_tx(env).await?))
}

async fn relay_block(
    State(state): State<AppState>,
    Json(env): Json<Envelope<Block>>,
) -> Result<Json<SubmitResp>, ApiError> {
    Ok(submitted(state.core.receive_block(env).await?))
}

async fn discover(State(state): State<AppState>, Json(known): Json<Vec<Peer>>) -> Json<Vec<Peer>> {
    Json(state.core.discover(known))
}

async fn genesis(State(state): State<AppState>) -> Json<Genesis> {
    Json(state.core.genesis().clone())
}

async fn blocks(State(state): State<AppState>, Query(q): Query<BlocksQuery>) -> Result<Json<Vec<Block>>, ApiError> {
    let limit = q.limit.unwrap_or(MAX_BLOCKS_PER_REQUEST).min(MAX_BLOCKS_PER_REQUEST);
    state
        .core
        .blocks_from(q.from, limit)
        .map(Json)
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn event_name(ev: &Event) -> &'static str {
    match ev {
        Event::NewPendingTx(_) => "new_pending_tx",
        Event::NewBlock(_) => "new_block",
    }
}

// one SSE message per event; the stream ends when the node shuts down
async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<SseEvent, axum::Error>>> {
    let sub = state.core.subscribe();
    let stream = stream::unfold(sub, |mut sub| async move {
        let ev = sub.recv().await?;
        let msg = SseEvent::default().event(event_name(&ev)).json_data(&ev);
        Some((msg, sub))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
