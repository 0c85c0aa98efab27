//! The V-Stack ingest worker.
//!
//! Drives a segmenter, fans chunk (or fragment) uploads out to healthy
//! storage nodes, and asks the coordinator to commit each placement
//! through consensus. The coordinator-assigned `video_id` is the
//! authoritative identifier for every downstream commit.

pub mod segmenter;
pub mod worker;

pub use segmenter::{FileSegmenter, SegmentedChunk, Segmenter};
pub use worker::{IngestConfig, IngestWorker, UploadReport};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("segmenter produced no chunks")]
    EmptySource,
    #[error("failed to read video source")]
    Io(#[from] std::io::Error),
    #[error("insufficient healthy nodes: need {need}, have {have}")]
    InsufficientNodes { need: usize, have: usize },
    #[error("coordinator request failed")]
    Coordinator(#[source] reqwest::Error),
    #[error("coordinator returned HTTP {status} during {context}")]
    CoordinatorStatus { status: u16, context: String },
    #[error("upload of chunk {chunk_id} failed: {reason}")]
    ChunkUpload { chunk_id: String, reason: String },
    #[error("consensus rejected chunk {chunk_id}: {message}")]
    CommitRejected { chunk_id: String, message: String },
    #[error("uploaded video failed verification: {0}")]
    Verification(String),
    #[error("erasure encoding failed")]
    Erasure(#[from] erasure::Error),
}
