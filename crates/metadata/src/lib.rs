//! SQLite-backed metadata store for the coordinator: videos, chunks,
//! replica and fragment placements, storage nodes, per-chunk consensus
//! records, and view statistics.
//!
//! All mutation funnels through [`Store`], which serializes access to a
//! single connection. Placement commits are a single transaction so that
//! chunk rows, placement rows, `videos.total_chunks` and the consensus
//! phase move together.

mod store;

pub use store::{PlacementCommit, ServiceStats, StorageOverhead, Store, VideoRow};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("video '{0}' not found")]
    VideoNotFound(String),
    #[error("node '{0}' not found")]
    NodeNotFound(String),
    #[error("database failure")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}
