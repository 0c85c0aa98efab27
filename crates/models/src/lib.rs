mod api;
mod manifest;
mod nodes;
mod placement;

pub use api::{
    CommitRequest, CommitResponse, ConsensusRecord, CreateVideoRequest, CreateVideoResponse,
    HeartbeatRequest, RegisterNodeRequest, UpdateVideoStatusRequest,
};
pub use manifest::{FragmentSpec, ManifestChunk, VideoManifest};
pub use nodes::{NodeStatus, StorageNode};
pub use placement::Placement;

use sha2::Digest;

/// HTTP header names shared between the coordinator, the ingest worker,
/// and storage nodes.
pub mod headers {
    /// Carries the ballot of a consensus attempt (prepare probes) or the
    /// ballot under which a stored chunk was last committed (responses).
    pub const BALLOT_NUMBER: &str = "x-ballot-number";
    /// Expected payload size of an uploaded chunk or fragment, in bytes.
    pub const CHUNK_SIZE: &str = "x-chunk-size";
    /// Expected content checksum of an uploaded chunk or fragment.
    pub const CHECKSUM: &str = "x-checksum";
}

/// How a chunk's bytes are made durable across the node pool.
/// A chunk is in exactly one mode at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedundancyMode {
    /// Full copies of the chunk on N distinct nodes.
    Replication,
    /// (K, M) Reed-Solomon fragments, any K of which reconstruct the chunk.
    ErasureCoding,
}

impl RedundancyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedundancyMode::Replication => "replication",
            RedundancyMode::ErasureCoding => "erasure_coding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replication" => Some(RedundancyMode::Replication),
            "erasure_coding" => Some(RedundancyMode::ErasureCoding),
            _ => None,
        }
    }
}

impl std::fmt::Display for RedundancyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a video record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    Uploading,
    Active,
    Deleted,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::Uploading => "uploading",
            VideoStatus::Active => "active",
            VideoStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(VideoStatus::Uploading),
            "active" => Some(VideoStatus::Active),
            "deleted" => Some(VideoStatus::Deleted),
            _ => None,
        }
    }
}

/// Phase of a chunk's consensus record. Monotone forward, except that
/// cleanup of a proven-failed attempt resets it to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusPhase {
    None,
    Prepare,
    Accept,
    Committed,
}

impl ConsensusPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusPhase::None => "none",
            ConsensusPhase::Prepare => "prepare",
            ConsensusPhase::Accept => "accept",
            ConsensusPhase::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ConsensusPhase::None),
            "prepare" => Some(ConsensusPhase::Prepare),
            "accept" => Some(ConsensusPhase::Accept),
            "committed" => Some(ConsensusPhase::Committed),
            _ => None,
        }
    }
}

/// Width of a rendered content checksum: SHA-256 as lowercase hex.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Digest `data` into the canonical checksum representation.
pub fn content_checksum(data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(data))
}

/// Whether `s` is shaped like a canonical checksum. The coordinator rejects
/// commits whose checksum fails this test.
pub fn is_well_formed_checksum(s: &str) -> bool {
    s.len() == CHECKSUM_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Canonical chunk identifier: `"{video_id}-chunk-{NNN}"` with a
/// zero-padded 3-digit sequence number.
pub fn chunk_id(video_id: &str, sequence_num: u32) -> String {
    format!("{video_id}-chunk-{sequence_num:03}")
}

/// Identifier of fragment `index` of an erasure-coded chunk.
pub fn fragment_id(chunk_id: &str, index: u32) -> String {
    format!("{chunk_id}-frag-{index}")
}

/// Recover the sequence number from a canonical chunk identifier.
/// Returns `None` when the suffix cannot be parsed; callers must then fall
/// back to consulting the manifest.
pub fn chunk_sequence(chunk_id: &str) -> Option<u32> {
    let (_, suffix) = chunk_id.rsplit_once("-chunk-")?;
    suffix.parse().ok()
}
