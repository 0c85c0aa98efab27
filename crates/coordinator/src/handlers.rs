use crate::{ApiError, App};
use axum::extract::{Path, Query, State};
use axum::Json;
use models::{
    CommitRequest, CommitResponse, ConsensusRecord, CreateVideoRequest, CreateVideoResponse,
    HeartbeatRequest, Placement, RedundancyMode, RegisterNodeRequest, StorageNode,
    UpdateVideoStatusRequest, VideoManifest,
};
use serde_json::json;
use std::sync::Arc;

type Result<T> = std::result::Result<T, ApiError>;

pub async fn health(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>> {
    let summary = app
        .store
        .node_health_summary()
        .map_err(|err| ApiError::Unavailable(err.to_string()))?;
    let healthy = summary.get("healthy").copied().unwrap_or(0);
    let total: i64 = summary.values().sum();

    Ok(Json(json!({
        "status": "healthy",
        "service": "coordinator",
        "healthy_nodes": healthy,
        "total_nodes": total,
        "database_status": "healthy",
    })))
}

pub async fn create_video(
    State(app): State<Arc<App>>,
    Json(req): Json<CreateVideoRequest>,
) -> Result<Json<CreateVideoResponse>> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".to_string()));
    }
    if req.duration_sec <= 0 {
        return Err(ApiError::BadRequest(
            "duration_sec must be positive".to_string(),
        ));
    }

    let video_id = uuid::Uuid::new_v4().to_string();
    app.store.create_video(
        &video_id,
        &req.title,
        req.duration_sec,
        app.cfg.chunk_duration_sec,
        app.cfg.chunk_size_bytes,
    )?;
    tracing::info!(video_id, title = req.title, "video created");

    Ok(Json(CreateVideoResponse {
        upload_url: format!("/upload/{video_id}"),
        video_id,
    }))
}

pub async fn update_video_status(
    State(app): State<Arc<App>>,
    Path(video_id): Path<String>,
    Json(req): Json<UpdateVideoStatusRequest>,
) -> Result<Json<serde_json::Value>> {
    app.store.update_video_status(&video_id, req.status)?;
    Ok(Json(json!({
        "status": "ok",
        "video_id": video_id,
        "message": format!("video status updated to {}", req.status.as_str()),
    })))
}

#[derive(serde::Deserialize)]
pub struct ListParams {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list_videos(
    State(app): State<Arc<App>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<metadata::VideoRow>>> {
    let limit = params.limit.unwrap_or(100);
    let offset = params.offset.unwrap_or(0);
    if !(1..=1000).contains(&limit) {
        return Err(ApiError::BadRequest(
            "limit must be between 1 and 1000".to_string(),
        ));
    }
    if offset < 0 {
        return Err(ApiError::BadRequest(
            "offset must be non-negative".to_string(),
        ));
    }
    Ok(Json(app.store.list_videos(limit, offset)?))
}

pub async fn manifest(
    State(app): State<Arc<App>>,
    Path(video_id): Path<String>,
) -> Result<Json<VideoManifest>> {
    let mut manifest = app
        .store
        .video_manifest(&video_id)?
        .ok_or_else(|| ApiError::NotFound(format!("video '{video_id}'")))?;

    // Replica addresses handed to a consumer must be reachable from
    // outside the cluster network.
    for chunk in &mut manifest.chunks {
        for replica in &mut chunk.replicas {
            *replica = app.rewrite_node_url(replica);
        }
        if let Some(fragments) = &mut chunk.fragments {
            for fragment in fragments {
                fragment.node_url = app.rewrite_node_url(&fragment.node_url);
            }
        }
    }

    Ok(Json(manifest))
}

pub async fn commit_chunk(
    State(app): State<Arc<App>>,
    Path(chunk_id): Path<String>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<CommitResponse>> {
    if !models::is_well_formed_checksum(&req.checksum) {
        return Err(ApiError::BadRequest(format!(
            "checksum must be {} hex characters",
            models::CHECKSUM_HEX_LEN
        )));
    }
    let placement =
        Placement::try_from(&req).map_err(|msg| ApiError::BadRequest(msg.to_string()))?;
    if app.store.video(&req.video_id)?.is_none() {
        return Err(ApiError::NotFound(format!("video '{}'", req.video_id)));
    }

    let proposal = consensus::Proposal {
        chunk_id: chunk_id.clone(),
        video_id: req.video_id.clone(),
        sequence_num: req.sequence_num,
        size_bytes: req.size_bytes,
        checksum: req.checksum.clone(),
        placement,
    };

    match app.proposer.propose(&proposal).await {
        Ok(nodes) => Ok(Json(CommitResponse {
            success: true,
            message: format!("chunk {chunk_id} committed to {} nodes", nodes.len()),
            committed_nodes: nodes,
        })),
        Err(err @ consensus::Error::BallotConflict { .. }) => {
            Err(ApiError::Conflict(err.to_string()))
        }
        Err(consensus::Error::EmptyNodeSet) => Err(ApiError::BadRequest(
            "commit requires at least one node".to_string(),
        )),
        Err(consensus::Error::Store(err)) => Err(ApiError::Store(err)),
        Err(err) => Ok(Json(CommitResponse {
            success: false,
            committed_nodes: Vec::new(),
            message: format!("consensus failed for chunk {chunk_id}: {err}"),
        })),
    }
}

pub async fn chunk_fragments(
    State(app): State<Arc<App>>,
    Path(chunk_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let mut fragments = app.store.chunk_fragments(&chunk_id)?;
    for fragment in &mut fragments {
        fragment.node_url = app.rewrite_node_url(&fragment.node_url);
    }
    Ok(Json(json!({ "chunk_id": chunk_id, "fragments": fragments })))
}

pub async fn consensus_record(
    State(app): State<Arc<App>>,
    Path(chunk_id): Path<String>,
) -> Result<Json<ConsensusRecord>> {
    let record = app
        .store
        .consensus_record(&chunk_id)?
        .ok_or_else(|| ApiError::NotFound(format!("consensus record for '{chunk_id}'")))?;
    Ok(Json(record))
}

pub async fn register_node(
    State(app): State<Arc<App>>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<Json<serde_json::Value>> {
    if !req.node_url.starts_with("http://") && !req.node_url.starts_with("https://") {
        return Err(ApiError::BadRequest(
            "node_url must start with http:// or https://".to_string(),
        ));
    }
    app.store
        .register_node(&req.node_url, &req.node_id, &req.version)?;
    tracing::info!(node_id = req.node_id, node_url = req.node_url, "node registered");

    Ok(Json(json!({
        "status": "registered",
        "node_id": req.node_id,
        "node_url": req.node_url,
    })))
}

pub async fn heartbeat(
    State(app): State<Arc<App>>,
    Path(node_id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<serde_json::Value>> {
    app.store
        .record_heartbeat(&node_id, req.disk_usage_percent, req.chunk_count)?;
    Ok(Json(json!({
        "status": "ok",
        "message": format!("heartbeat recorded for node {node_id}"),
    })))
}

pub async fn healthy_nodes(State(app): State<Arc<App>>) -> Result<Json<Vec<StorageNode>>> {
    let mut nodes = app.store.healthy_nodes(app.cfg.heartbeat_ttl)?;
    for node in &mut nodes {
        node.node_url = app.rewrite_node_url(&node.node_url);
    }
    Ok(Json(nodes))
}

pub async fn all_nodes(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>> {
    let nodes = app.store.all_nodes()?;
    Ok(Json(json!({ "nodes": nodes })))
}

pub async fn health_summary(
    State(app): State<Arc<App>>,
) -> Result<Json<std::collections::BTreeMap<String, i64>>> {
    Ok(Json(app.store.node_health_summary()?))
}

pub async fn service_stats(State(app): State<Arc<App>>) -> Result<Json<serde_json::Value>> {
    let stats = app.store.service_stats()?;
    let healthy = app.store.healthy_nodes(app.cfg.heartbeat_ttl)?.len();
    Ok(Json(json!({
        "total_videos": stats.total_videos,
        "total_chunks": stats.total_chunks,
        "total_replicas": stats.total_replicas,
        "total_fragments": stats.total_fragments,
        "healthy_nodes": healthy,
    })))
}

pub async fn storage_overhead(
    State(app): State<Arc<App>>,
) -> Result<Json<metadata::StorageOverhead>> {
    let replication = app
        .policy
        .mode_config(RedundancyMode::Replication)
        .storage_overhead_factor;
    let erasure = app
        .policy
        .mode_config(RedundancyMode::ErasureCoding)
        .storage_overhead_factor;
    Ok(Json(app.store.storage_overhead(replication, erasure)?))
}

pub async fn video_popularity(
    State(app): State<Arc<App>>,
    Path(video_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if app.store.video(&video_id)?.is_none() {
        return Err(ApiError::NotFound(format!("video '{video_id}'")));
    }
    let view_count = app.store.view_count(&video_id)?;
    Ok(Json(json!({ "video_id": video_id, "view_count": view_count })))
}

pub async fn record_view(
    State(app): State<Arc<App>>,
    Path(video_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if app.store.video(&video_id)?.is_none() {
        return Err(ApiError::NotFound(format!("video '{video_id}'")));
    }
    app.store.record_view(&video_id)?;
    Ok(Json(json!({ "status": "ok", "video_id": video_id })))
}

pub async fn recommend_redundancy(
    State(app): State<Arc<App>>,
    Path(video_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if app.store.video(&video_id)?.is_none() {
        return Err(ApiError::NotFound(format!("video '{video_id}'")));
    }
    let view_count = app.store.view_count(&video_id)?;
    let (mode, config) = app.policy.decide(&video_id, view_count, None);
    Ok(Json(json!({
        "video_id": video_id,
        "view_count": view_count,
        "recommended_mode": mode,
        "config": config,
    })))
}

#[derive(serde::Deserialize)]
pub struct OverrideParams {
    mode: RedundancyMode,
}

pub async fn set_redundancy_override(
    State(app): State<Arc<App>>,
    Path(video_id): Path<String>,
    Query(params): Query<OverrideParams>,
) -> Result<Json<serde_json::Value>> {
    app.policy.set_override(&video_id, params.mode);
    Ok(Json(json!({
        "status": "ok",
        "video_id": video_id,
        "override_mode": params.mode,
    })))
}

pub async fn clear_redundancy_override(
    State(app): State<Arc<App>>,
    Path(video_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    app.policy.clear_override(&video_id);
    Ok(Json(json!({
        "status": "ok",
        "video_id": video_id,
        "message": "manual override cleared",
    })))
}

pub async fn redundancy_efficiency(
    State(app): State<Arc<App>>,
) -> Result<Json<serde_json::Value>> {
    let chunk_size = app.cfg.chunk_size_bytes as u64;
    let replication = app.policy.mode_config(RedundancyMode::Replication);
    let erasure = app.policy.mode_config(RedundancyMode::ErasureCoding);

    Ok(Json(json!({
        "efficiency": app.policy.storage_efficiency(),
        "mode_comparison": {
            "replication": {
                "config": replication,
                "storage_per_chunk_bytes": replication.storage_cost(chunk_size),
            },
            "erasure_coding": {
                "config": erasure,
                "storage_per_chunk_bytes": erasure.storage_cost(chunk_size),
            },
        },
    })))
}

pub async fn redundancy_config(
    State(app): State<Arc<App>>,
) -> Result<Json<redundancy::PolicyConfig>> {
    Ok(Json(app.policy.config()))
}
