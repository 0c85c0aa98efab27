//! ChunkPaxos: per-chunk placement consensus.
//!
//! Writing different chunks never conflicts, so each chunk runs its own
//! single-decree instance and instances run fully in parallel. A single
//! coordinator acts as proposer, acceptor, and learner for its own
//! metadata; storage nodes participate passively through idempotent HEAD
//! probes against the chunk (or fragment) they hold.

mod ballot;
mod proposer;

pub use ballot::{Ballot, BallotGenerator};
pub use proposer::{Proposal, Proposer, ProposerConfig};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("proposal requires at least one node")]
    EmptyNodeSet,
    #[error("{phase} phase reached {got} of {need} required nodes")]
    QuorumNotReached {
        phase: &'static str,
        got: usize,
        need: usize,
    },
    #[error("ballot conflict: {node} carries ballot {theirs}, ours is {ours}")]
    BallotConflict { node: String, theirs: u64, ours: u64 },
    #[error("checksum mismatch on {node} for '{resource}'")]
    ChecksumMismatch { node: String, resource: String },
    #[error("metadata store failure")]
    Store(#[from] metadata::Error),
}

impl Error {
    /// Whether a fresh ballot and another attempt could still succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QuorumNotReached { .. }
                | Error::BallotConflict { .. }
                | Error::ChecksumMismatch { .. }
        )
    }
}
