use crate::{ConsensusPhase, FragmentSpec, RedundancyMode, VideoStatus};

/// `POST /video` request body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CreateVideoRequest {
    pub title: String,
    pub duration_sec: i64,
}

/// `POST /video` response: the coordinator-assigned identifier is the
/// authoritative `video_id` for all downstream commits.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CreateVideoResponse {
    pub video_id: String,
    pub upload_url: String,
}

/// `PATCH /video/{video_id}/status` request body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UpdateVideoStatusRequest {
    pub status: VideoStatus,
}

/// `POST /nodes/{node_id}/heartbeat` request body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HeartbeatRequest {
    pub disk_usage_percent: f64,
    pub chunk_count: i64,
}

/// `POST /nodes/register` request body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegisterNodeRequest {
    pub node_url: String,
    pub node_id: String,
    #[serde(default = "RegisterNodeRequest::default_version")]
    pub version: String,
}

impl RegisterNodeRequest {
    fn default_version() -> String {
        "1.0.0".to_string()
    }
}

/// `POST /chunk/{chunk_id}/commit` request body: propose that `node_urls`
/// own the chunk. Erasure-coded proposals also carry per-fragment metadata.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommitRequest {
    pub node_urls: Vec<String>,
    pub checksum: String,
    pub size_bytes: u64,
    pub video_id: String,
    pub sequence_num: u32,
    pub redundancy_mode: RedundancyMode,
    #[serde(default)]
    pub fragments_metadata: Option<Vec<FragmentSpec>>,
}

/// `POST /chunk/{chunk_id}/commit` response.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommitResponse {
    pub success: bool,
    pub committed_nodes: Vec<String>,
    pub message: String,
}

/// A chunk's consensus record, surfaced for introspection. Never part of
/// the manifest.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConsensusRecord {
    pub chunk_id: String,
    pub promised_ballot: u64,
    pub accepted_ballot: u64,
    #[serde(default)]
    pub accepted_value: Option<Vec<String>>,
    pub phase: ConsensusPhase,
}
