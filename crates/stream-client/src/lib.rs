//! The V-Stack streaming client.
//!
//! Playback is a feedback loop between three parts: a [`probe::NodeProbe`]
//! that continuously measures per-node latency, bandwidth, and success
//! rate; a [`scheduler::Scheduler`] that downloads chunks in parallel from
//! the best-scoring nodes with bounded concurrency and failover; and a
//! [`buffer::PlaybackBuffer`] that serializes chunks for the consumer and
//! signals the scheduler to refill through watermarks. A
//! [`session::Session`] wires them to a manifest.

pub mod buffer;
pub mod probe;
pub mod scheduler;
pub mod session;

pub use buffer::{BufferConfig, PlaybackBuffer, PlayedChunk};
pub use probe::{NodeProbe, ProbeConfig};
pub use scheduler::{ChunkRequest, Scheduler, SchedulerConfig};
pub use session::{Session, SessionConfig};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch manifest")]
    Manifest(#[source] reqwest::Error),
    #[error("failed to decode manifest")]
    ManifestDecode(#[source] reqwest::Error),
    #[error("video '{0}' not found")]
    VideoNotFound(String),
    #[error("failed to spill chunk to disk")]
    Spill(#[source] std::io::Error),
    #[error("failed to read spilled chunk")]
    SpillRead(#[source] std::io::Error),
    #[error("invalid erasure codec configuration")]
    Codec(#[source] erasure::Error),
}
