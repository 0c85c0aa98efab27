//! An in-process storage node used by tests across the workspace.
//!
//! The stub implements the node HTTP surface (`HEAD /ping`, `GET /health`,
//! `HEAD|GET|PUT /chunk/{id}`) over an in-memory chunk map, with knobs for
//! fault injection: forced response statuses, busy signalling, dropped
//! pings, artificial latency, and concurrency tracking.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct StoredChunk {
    bytes: bytes::Bytes,
    checksum: String,
}

/// Shared, inspectable state of a [`StubNode`].
#[derive(Default)]
pub struct NodeState {
    chunks: Mutex<HashMap<String, StoredChunk>>,
    // Highest ballot seen per chunk id, across prepare probes and commits.
    ballots: Mutex<HashMap<String, u64>>,

    // Fault injection.
    chunk_get_status: AtomicU64, // 0 = serve normally
    busy: AtomicBool,
    drop_pings: AtomicBool,
    response_delay_ms: AtomicU64,

    // Instrumentation.
    ping_count: AtomicUsize,
    get_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl NodeState {
    /// Store chunk bytes directly, as an upload would.
    pub fn put_chunk(&self, chunk_id: &str, bytes: impl Into<bytes::Bytes>) {
        let bytes = bytes.into();
        let checksum = models::content_checksum(&bytes);
        self.chunks
            .lock()
            .unwrap()
            .insert(chunk_id.to_string(), StoredChunk { bytes, checksum });
    }

    pub fn remove_chunk(&self, chunk_id: &str) {
        self.chunks.lock().unwrap().remove(chunk_id);
    }

    pub fn has_chunk(&self, chunk_id: &str) -> bool {
        self.chunks.lock().unwrap().contains_key(chunk_id)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }

    pub fn ballot_of(&self, chunk_id: &str) -> u64 {
        self.ballots.lock().unwrap().get(chunk_id).copied().unwrap_or(0)
    }

    /// Respond to every `GET /chunk/{id}` with `status` instead of bytes.
    /// Pass `None` to restore normal service.
    pub fn fail_chunk_gets(&self, status: Option<StatusCode>) {
        self.chunk_get_status
            .store(status.map(|s| s.as_u16() as u64).unwrap_or(0), Ordering::SeqCst);
    }

    /// Answer `HEAD /chunk/{id}` with 409, as a node mid-consensus would.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Fail liveness probes with a 503.
    pub fn drop_pings(&self, drop: bool) {
        self.drop_pings.store(drop, Ordering::SeqCst);
    }

    /// Delay every chunk/ping response by `ms` milliseconds.
    pub fn set_response_delay_ms(&self, ms: u64) {
        self.response_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn ping_count(&self) -> usize {
        self.ping_count.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.get_count.load(Ordering::SeqCst)
    }

    /// Highest number of chunk downloads this node served at one instant.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let ms = self.response_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
    }
}

/// A running stub node bound to an ephemeral localhost port.
pub struct StubNode {
    pub url: String,
    state: Arc<NodeState>,
    server: tokio::task::JoinHandle<()>,
}

impl StubNode {
    pub async fn spawn() -> StubNode {
        let state = Arc::new(NodeState::default());

        let app = Router::new()
            .route("/ping", get(ping))
            .route("/health", get(health))
            .route("/chunk/:id", get(get_chunk).head(head_chunk).put(put_chunk))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub node");
        let addr = listener.local_addr().expect("stub node address");

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        StubNode {
            url: format!("http://{addr}"),
            state,
            server,
        }
    }

    /// Spawn `n` stub nodes.
    pub async fn spawn_many(n: usize) -> Vec<StubNode> {
        let mut nodes = Vec::with_capacity(n);
        for _ in 0..n {
            nodes.push(StubNode::spawn().await);
        }
        nodes
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }
}

impl Drop for StubNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn ping(State(state): State<Arc<NodeState>>) -> StatusCode {
    state.ping_count.fetch_add(1, Ordering::SeqCst);
    state.delay().await;
    if state.drop_pings.load(Ordering::SeqCst) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn health(State(state): State<Arc<NodeState>>) -> Response {
    let body = serde_json::json!({
        "status": "healthy",
        "chunk_count": state.chunk_count(),
        "disk_usage": 0.0,
    });
    axum::Json(body).into_response()
}

async fn head_chunk(
    State(state): State<Arc<NodeState>>,
    Path(chunk_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if state.busy.load(Ordering::SeqCst) {
        return StatusCode::CONFLICT.into_response();
    }

    // A prepare probe carries the proposer's ballot; remember the highest.
    if let Some(ballot) = headers
        .get(models::headers::BALLOT_NUMBER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        let mut ballots = state.ballots.lock().unwrap();
        let entry = ballots.entry(chunk_id.clone()).or_insert(0);
        *entry = (*entry).max(ballot);
    }

    let chunks = state.chunks.lock().unwrap();
    match chunks.get(&chunk_id) {
        None => StatusCode::NOT_FOUND.into_response(),
        Some(chunk) => {
            let ballot = state
                .ballots
                .lock()
                .unwrap()
                .get(&chunk_id)
                .copied()
                .unwrap_or(0);
            (
                StatusCode::OK,
                [
                    ("etag", format!("\"{}\"", chunk.checksum)),
                    (models::headers::BALLOT_NUMBER, ballot.to_string()),
                ],
            )
                .into_response()
        }
    }
}

async fn get_chunk(
    State(state): State<Arc<NodeState>>,
    Path(chunk_id): Path<String>,
) -> Response {
    state.get_count.fetch_add(1, Ordering::SeqCst);

    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);

    state.delay().await;

    let response = {
        let forced = state.chunk_get_status.load(Ordering::SeqCst);
        if forced != 0 {
            StatusCode::from_u16(forced as u16)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        } else {
            let chunks = state.chunks.lock().unwrap();
            match chunks.get(&chunk_id) {
                None => StatusCode::NOT_FOUND.into_response(),
                Some(chunk) => chunk.bytes.clone().into_response(),
            }
        }
    };

    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    response
}

async fn put_chunk(
    State(state): State<Arc<NodeState>>,
    Path(chunk_id): Path<String>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let checksum = models::content_checksum(&body);
    if let Some(expected) = headers
        .get(models::headers::CHECKSUM)
        .and_then(|v| v.to_str().ok())
    {
        if expected != checksum {
            return (StatusCode::BAD_REQUEST, "checksum mismatch").into_response();
        }
    }

    state.chunks.lock().unwrap().insert(
        chunk_id,
        StoredChunk {
            bytes: body,
            checksum,
        },
    );
    StatusCode::CREATED.into_response()
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn stores_and_serves_chunks() {
        let node = StubNode::spawn().await;
        node.state().put_chunk("c1", &b"hello"[..]);

        let http = reqwest::Client::new();
        let bytes = http
            .get(format!("{}/chunk/c1", node.url))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");

        let missing = http
            .get(format!("{}/chunk/absent", node.url))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn head_records_and_reports_ballots() {
        let node = StubNode::spawn().await;
        node.state().put_chunk("c1", &b"hello"[..]);

        let http = reqwest::Client::new();
        let response = http
            .head(format!("{}/chunk/c1", node.url))
            .header(models::headers::BALLOT_NUMBER, "17")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        // A later probe with a lower ballot still sees the highest promise.
        let response = http
            .head(format!("{}/chunk/c1", node.url))
            .header(models::headers::BALLOT_NUMBER, "5")
            .send()
            .await
            .unwrap();
        let ballot: u64 = response
            .headers()
            .get(models::headers::BALLOT_NUMBER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(ballot, 17);
        assert_eq!(node.state().ballot_of("c1"), 17);
    }
}
