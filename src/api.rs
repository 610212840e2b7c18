//! REST surface of a node.
//!
//! The same routes serve clients and peers; peer requests identify their
//! sender with the `x-peer-origin` header.

use axum::{
    extract::{Path, Request, State},
    http::{self, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

use crate::blockchain::Block;
use crate::consensus::{IgnoreReason, Reconciliation};
use crate::error::{ChainError, Result};
use crate::network::ORIGIN_HEADER;
use crate::node::{Node, NodeState};
use crate::peers::{normalize_url, Peer};
use crate::transaction::{Transaction, TransactionData};

#[derive(Debug)]
pub enum ApiError {
    Chain(ChainError),
    InvalidInput(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Chain(e) => (
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                e.to_string(),
            ),
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Body of `POST /transaction/:id`. The id may be omitted; the path wins.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(default)]
    pub transaction_id: Option<u64>,
    pub data: TransactionData,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub tip: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationsResponse {
    pub transaction_id: u64,
    pub confirmations: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub node_state: String,
    pub self_url: String,
    pub height: u64,
    pub peers: usize,
    pub timestamp: String,
}

fn origin_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ORIGIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(normalize_url)
        .filter(|url| !url.is_empty())
}

// ============================================================================
// Middleware
// ============================================================================

async fn logging_middleware(
    State(node): State<Arc<Node>>,
    req: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        node_state = ?node.state(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

pub fn build_api_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![
            http::header::CONTENT_TYPE,
            http::HeaderName::from_static(ORIGIN_HEADER),
        ]);

    Router::new()
        // Blocks
        .route("/block", get(get_chain).post(add_block))
        .route("/block/last", get(get_last_block).put(offer_block))
        .route("/block/index/:index", get(get_block_by_index))
        .route("/block/blocks/transaction/:id", get(get_transaction_block))
        .route("/block/:hash", get(get_block))
        // Transactions
        .route("/transaction", get(get_mempool))
        .route(
            "/transaction/:id",
            get(get_transaction).post(add_transaction),
        )
        // Mining
        .route("/miner/mine/:address", post(mine_block))
        // Peers
        .route("/node/peers", get(get_peers).post(announce_peer))
        .route(
            "/node/transactions/:id/confirmations",
            get(get_confirmations),
        )
        .route("/health", get(health_check))
        .layer(middleware::from_fn_with_state(
            node.clone(),
            logging_middleware,
        ))
        .with_state(node)
        .layer(cors)
}

/// Bind `listen_addr` and serve until the listener fails.
pub async fn serve(node: Arc<Node>, listen_addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(addr = %listen_addr, self_url = %node.self_url(), "api listening");
    axum::serve(listener, build_api_router(node)).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn get_chain(State(node): State<Arc<Node>>) -> ApiResult<Json<Vec<Block>>> {
    Ok(Json(node.get_chain()?))
}

async fn add_block(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(block): Json<Block>,
) -> ApiResult<Json<Block>> {
    let origin = origin_of(&headers);
    Ok(Json(node.submit_block(block, true, origin.as_deref()).await?))
}

async fn get_last_block(State(node): State<Arc<Node>>) -> ApiResult<Json<Block>> {
    Ok(Json(node.get_last_block()?))
}

async fn offer_block(
    State(node): State<Arc<Node>>,
    headers: HeaderMap,
    Json(block): Json<Block>,
) -> ApiResult<Json<ReconcileResponse>> {
    let origin = origin_of(&headers);
    let outcome = node.receive_blocks(vec![block], origin.as_deref()).await;

    let (label, reason) = match outcome {
        Reconciliation::Ignored(IgnoreReason::NoCandidates) => ("ignored", Some("no candidates".to_string())),
        Reconciliation::Ignored(IgnoreReason::Stale) => ("ignored", Some("stale".to_string())),
        Reconciliation::Appended(_) => ("appended", None),
        Reconciliation::Replaced(_) => ("replaced", None),
        Reconciliation::Rejected(reason) => ("rejected", Some(reason)),
    };
    Ok(Json(ReconcileResponse {
        outcome: label.to_string(),
        reason,
        tip: node.get_last_block()?.index,
    }))
}

async fn get_block(
    State(node): State<Arc<Node>>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Block>> {
    Ok(Json(node.get_block(&hash)?))
}

async fn get_block_by_index(
    State(node): State<Arc<Node>>,
    Path(index): Path<u64>,
) -> ApiResult<Json<Block>> {
    Ok(Json(node.get_block_by_index(index)?))
}

async fn get_transaction_block(
    State(node): State<Arc<Node>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Block>> {
    Ok(Json(node.find_transaction_block(id)?))
}

async fn get_mempool(State(node): State<Arc<Node>>) -> ApiResult<Json<Vec<Transaction>>> {
    Ok(Json(node.get_mempool()?))
}

async fn get_transaction(
    State(node): State<Arc<Node>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Transaction>> {
    Ok(Json(node.get_transaction(id)?))
}

async fn add_transaction(
    State(node): State<Arc<Node>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(request): Json<TransactionRequest>,
) -> ApiResult<Json<Transaction>> {
    if let Some(body_id) = request.transaction_id {
        if body_id != id {
            return Err(ApiError::InvalidInput(format!(
                "transaction id {} in body does not match path id {}",
                body_id, id
            )));
        }
    }
    let origin = origin_of(&headers);
    let tx = Transaction::new(id, request.data);
    Ok(Json(
        node.submit_transaction(tx, true, origin.as_deref()).await?,
    ))
}

async fn mine_block(
    State(node): State<Arc<Node>>,
    Path(address): Path<String>,
) -> ApiResult<Json<Block>> {
    Ok(Json(node.mine_and_commit(&address).await?))
}

async fn get_peers(State(node): State<Arc<Node>>) -> ApiResult<Json<Vec<Peer>>> {
    Ok(Json(node.list_peers()?))
}

async fn announce_peer(
    State(node): State<Arc<Node>>,
    Json(peer): Json<Peer>,
) -> ApiResult<Json<Peer>> {
    Ok(Json(node.accept_peer(&peer.url)?))
}

async fn get_confirmations(
    State(node): State<Arc<Node>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ConfirmationsResponse>> {
    Ok(Json(ConfirmationsResponse {
        transaction_id: id,
        confirmations: node.count_confirmations(id).await?,
    }))
}

async fn health_check(State(node): State<Arc<Node>>) -> Response {
    let state = node.state();
    let body = HealthResponse {
        status: if state == NodeState::Ready { "healthy" } else { "starting" }.to_string(),
        node_state: format!("{:?}", state).to_lowercase(),
        self_url: node.self_url().to_string(),
        height: node.get_last_block().map(|b| b.index).unwrap_or(0),
        peers: node.list_peers().map(|p| p.len()).unwrap_or(0),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let status = match state {
        NodeState::Ready => StatusCode::OK,
        NodeState::Booting => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(body)).into_response()
}
