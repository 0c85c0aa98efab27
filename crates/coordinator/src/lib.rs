//! The V-Stack coordinator: owner of video, chunk, and node metadata.
//!
//! Exposes the manifest and commit surface over HTTP, runs ChunkPaxos for
//! every placement commit, tracks node liveness, and chooses redundancy
//! modes by popularity.

pub mod handlers;
pub mod monitor;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors;
use tower_http::trace::TraceLayer;

/// Coordinator-wide settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Heartbeats older than this force a node to `down`.
    pub heartbeat_ttl: Duration,
    /// Chunk duration recorded on newly created videos.
    pub chunk_duration_sec: i64,
    /// Chunk size target recorded on newly created videos.
    pub chunk_size_bytes: i64,
    /// `(internal, external)` address pairs applied to every node URL a
    /// manifest hands out, so replica addresses are reachable by consumers
    /// outside the cluster network.
    pub rewrites: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(60),
            chunk_duration_sec: 10,
            chunk_size_bytes: 2 * 1024 * 1024,
            rewrites: Vec::new(),
        }
    }
}

/// Shared state behind every handler.
pub struct App {
    pub store: Arc<metadata::Store>,
    pub proposer: consensus::Proposer,
    pub policy: redundancy::Policy,
    pub cfg: Config,
}

impl App {
    pub fn new(
        store: Arc<metadata::Store>,
        http: reqwest::Client,
        policy: redundancy::Policy,
        consensus_cfg: consensus::ProposerConfig,
        cfg: Config,
    ) -> Arc<Self> {
        let proposer = consensus::Proposer::new(store.clone(), http, consensus_cfg);
        Arc::new(Self {
            store,
            proposer,
            policy,
            cfg,
        })
    }

    /// Apply the configured address rewrites to a node URL on its way out.
    pub fn rewrite_node_url(&self, url: &str) -> String {
        for (internal, external) in &self.cfg.rewrites {
            if url.contains(internal.as_str()) {
                return url.replace(internal.as_str(), external);
            }
        }
        url.to_string()
    }
}

/// Build the coordinator's HTTP surface.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/video", post(handlers::create_video))
        .route("/video/:video_id/status", patch(handlers::update_video_status))
        .route("/video/:video_id/popularity", get(handlers::video_popularity))
        .route("/video/:video_id/view", post(handlers::record_view))
        .route("/videos", get(handlers::list_videos))
        .route("/manifest/:video_id", get(handlers::manifest))
        .route("/chunk/:chunk_id/commit", post(handlers::commit_chunk))
        .route("/chunk/:chunk_id/fragments", get(handlers::chunk_fragments))
        .route("/consensus/:chunk_id", get(handlers::consensus_record))
        .route("/nodes/register", post(handlers::register_node))
        .route("/nodes/:node_id/heartbeat", post(handlers::heartbeat))
        .route("/nodes/healthy", get(handlers::healthy_nodes))
        .route("/nodes/all", get(handlers::all_nodes))
        .route("/nodes/health-summary", get(handlers::health_summary))
        .route("/stats", get(handlers::service_stats))
        .route("/storage/overhead", get(handlers::storage_overhead))
        .route(
            "/redundancy/recommend/:video_id",
            get(handlers::recommend_redundancy),
        )
        .route(
            "/redundancy/override/:video_id",
            post(handlers::set_redundancy_override).delete(handlers::clear_redundancy_override),
        )
        .route("/redundancy/efficiency", get(handlers::redundancy_efficiency))
        .route("/redundancy/config", get(handlers::redundancy_config))
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// Failures a handler can surface, mapped onto stable status codes: 400
/// for input shape, 404 for a missing entity, 409 for ballot conflicts,
/// 503 when the service cannot answer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Store(#[from] metadata::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(
                metadata::Error::VideoNotFound(_) | metadata::Error::NodeNotFound(_),
            ) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
