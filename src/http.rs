//! HTTP API: a thin REST surface over the store and the flood engine.
//!
//! Two generations of routes coexist: the original whiteboard API under
//! `/messages/...` (poll-style reads with per-listener cursors) and the
//! newer `/message` read/write pair that reports store identity and
//! sequence bounds with every response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::net::types::MAX_GET_COUNT;
use crate::net::wire::{Record, RelayMessage};
use crate::node::Node;
use crate::store::StoreState;
use crate::util::{hexdump, is_jpeg};

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/uuid", get(uuid))
        .route("/connected", get(connected))
        .route("/allneighborsnonempty", get(all_neighbors_nonempty))
        .route("/seeds", get(seeds))
        .route("/flush", get(flush))
        .route("/neighbor/{address}", delete(delete_neighbor))
        .route("/messages/nextsequence", get(next_sequence))
        .route("/messages/write/", post(write))
        .route(
            "/messages/writeWithTimeout/{timeout_mins}/",
            post(write_with_timeout),
        )
        .route("/messages/readone/{sequence_number}", get(read_one))
        .route("/messages/read/", get(read))
        .route("/messages/read/{listener_id}", get(read_from))
        .route("/messages/explain/{sequence_number}", get(explain))
        .route("/message", get(new_read).post(new_write))
        .with_state(node)
}

pub async fn serve(node: Arc<Node>, listener: TcpListener, token: CancellationToken) {
    let app = router(node).into_make_service_with_connect_info::<SocketAddr>();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
    {
        error!("http server failed: {e}");
    }
}

fn kind(payload: &[u8]) -> &'static str {
    if is_jpeg(payload) {
        "JPEG image"
    } else {
        "unknown"
    }
}

async fn index_page(State(node): State<Arc<Node>>) -> String {
    let db = node.store().lock().await;
    let mut page = format!(
        "bebo {} on {}\nstore {} next sequence {}\n",
        env!("CARGO_PKG_VERSION"),
        node.config.host,
        db.uuid(),
        db.next_sequence_number(),
    );
    if db.next_sequence_number() > 1 {
        let first = db.next_sequence_number().saturating_sub(50).max(1);
        for (seq, message) in db.get_range(first, 50) {
            page.push_str(&format!("{seq} {}\n", kind(message.payload())));
        }
    }
    page
}

async fn uuid(State(node): State<Arc<Node>>) -> Json<serde_json::Value> {
    let db = node.store().lock().await;
    Json(json!({ "uuid": db.uuid() }))
}

async fn connected(State(node): State<Arc<Node>>) -> String {
    format!("{}", node.connected_neighbors())
}

async fn all_neighbors_nonempty(State(node): State<Arc<Node>>) -> &'static str {
    let neighbors = node.neighbors().read().await;
    if neighbors.values().all(|n| !n.neighbors.is_empty()) {
        "1"
    } else {
        "0"
    }
}

async fn seeds(State(node): State<Arc<Node>>) -> Json<serde_json::Value> {
    let seeds: Vec<&String> = node.seeds.all_seeds.iter().collect();
    Json(json!({ "seeds": seeds }))
}

async fn flush(State(node): State<Arc<Node>>) -> Redirect {
    node.store().lock().await.flush();
    Redirect::to("/")
}

async fn delete_neighbor(
    State(node): State<Arc<Node>>,
    Path(address): Path<String>,
) -> StatusCode {
    let address = match address.parse() {
        Ok(address) => address,
        Err(_) => return StatusCode::NOT_FOUND,
    };
    if node.delete_neighbor(address).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn next_sequence(State(node): State<Arc<Node>>) -> String {
    format!("{}", node.store().lock().await.next_sequence_number())
}

// -----------------------------------------------------------------------------
// Whiteboard API
// -----------------------------------------------------------------------------

async fn write(State(node): State<Arc<Node>>, body: Bytes) -> impl IntoResponse {
    let (seqno, _) = node
        .inject(Record::Relay(RelayMessage::new(body, true)), None)
        .await;
    (StatusCode::CREATED, Json(json!({ "messageId": seqno })))
}

async fn write_with_timeout(
    State(node): State<Arc<Node>>,
    Path(timeout_mins): Path<f64>,
    body: Bytes,
) -> impl IntoResponse {
    // the store does its own age-based expiration; the timeout is accepted
    // for API compatibility and echoed back
    let (seqno, _) = node
        .inject(Record::Relay(RelayMessage::new(body, true)), None)
        .await;
    let timeout_secs = (timeout_mins * 60.0) as i64;
    (
        StatusCode::CREATED,
        Json(json!({ "messageId": seqno, "timeoutSecs": timeout_secs })),
    )
}

async fn read_one(
    State(node): State<Arc<Node>>,
    Path(sequence_number): Path<u64>,
) -> Response {
    let db = node.store().lock().await;
    match db.get_by_sequence_number(sequence_number) {
        Some(message) => (
            [(header::CONTENT_TYPE, message.mime_type())],
            message.payload().clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn read(
    State(node): State<Arc<Node>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    read_messages(&node, &addr.to_string()).await
}

async fn read_from(
    State(node): State<Arc<Node>>,
    Path(listener_id): Path<String>,
) -> Response {
    read_messages(&node, &listener_id).await
}

async fn read_messages(node: &Node, listener_id: &str) -> Response {
    let rows: Vec<(String, String, String)> = node
        .store()
        .lock()
        .await
        .messages_for_id(listener_id)
        .iter()
        .map(|m| (m.mime_type().to_string(), m.to_json(), String::new()))
        .collect();
    let status = if rows.is_empty() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::OK
    };
    (status, Json(rows)).into_response()
}

async fn explain(
    State(node): State<Arc<Node>>,
    Path(sequence_number): Path<u64>,
) -> Response {
    let db = node.store().lock().await;
    let message = match db.get_by_sequence_number(sequence_number) {
        Some(message) => message,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    if !node.config.hex_mode && is_jpeg(message.payload()) {
        return (
            [(header::CONTENT_TYPE, "image/jpeg")],
            message.payload().clone(),
        )
            .into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain")],
        hexdump(message.payload()),
    )
        .into_response()
}

// -----------------------------------------------------------------------------
// New REST API
// -----------------------------------------------------------------------------

fn default_count() -> u64 {
    1
}

#[derive(Deserialize)]
struct RangeQuery {
    #[serde(default)]
    first: u64,
    #[serde(default = "default_count")]
    count: u64,
}

#[derive(Serialize)]
struct RangeItem {
    id: u64,
    message: String,
}

#[derive(Serialize)]
struct RangeResponse {
    #[serde(flatten)]
    state: StoreState,
    messages: Vec<RangeItem>,
}

#[derive(Serialize)]
struct WriteResponse {
    #[serde(flatten)]
    state: StoreState,
    id: u64,
}

async fn new_read(
    State(node): State<Arc<Node>>,
    Query(query): Query<RangeQuery>,
) -> Json<RangeResponse> {
    let count = query.count.min(MAX_GET_COUNT);
    let db = node.store().lock().await;
    let messages = db
        .get_range(query.first, count)
        .iter()
        .map(|(seq, message)| RangeItem {
            id: *seq,
            message: message.to_json(),
        })
        .collect();
    Json(RangeResponse {
        state: db.state(),
        messages,
    })
}

async fn new_write(State(node): State<Arc<Node>>, body: Bytes) -> impl IntoResponse {
    let (seqno, created) = node
        .inject(Record::Relay(RelayMessage::new(body, true)), None)
        .await;
    let state = node.store().lock().await.state();
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(WriteResponse { state, id: seqno }))
}
