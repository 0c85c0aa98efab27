use crate::{RedundancyMode, VideoStatus};

/// The coordinator's per-video view: metadata plus an ordered list of
/// chunks and each chunk's placement. This is the authoritative wire shape
/// consumed by streaming clients.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VideoManifest {
    pub video_id: String,
    pub title: String,
    pub duration_sec: i64,
    pub total_chunks: i64,
    pub chunk_duration_sec: i64,
    pub chunk_size_bytes: i64,
    pub status: VideoStatus,
    pub chunks: Vec<ManifestChunk>,
}

/// One chunk's entry within a manifest.
///
/// `replicas` is always present for replicated chunks and may be empty for
/// erasure-coded ones; `fragments` is present only for erasure-coded chunks.
/// Clients must tolerate both absences.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ManifestChunk {
    pub chunk_id: String,
    pub sequence_num: u32,
    pub size_bytes: u64,
    pub checksum: String,
    pub redundancy_mode: RedundancyMode,
    #[serde(default)]
    pub replicas: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragments: Option<Vec<FragmentSpec>>,
}

/// Placement record of a single erasure fragment.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FragmentSpec {
    pub fragment_id: String,
    pub chunk_id: String,
    pub fragment_index: u32,
    pub node_url: String,
    pub size_bytes: u64,
    pub checksum: String,
}
