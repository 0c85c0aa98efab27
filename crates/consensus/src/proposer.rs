use crate::{Ballot, BallotGenerator, Error, Result};
use exponential_backoff::Backoff;
use futures::future::join_all;
use metadata::{PlacementCommit, Store};
use models::{ConsensusPhase, Placement};
use std::sync::Arc;
use std::time::Duration;

/// Consensus tunables.
#[derive(Debug, Clone)]
pub struct ProposerConfig {
    /// Hard deadline of each prepare/accept probe.
    pub rpc_timeout: Duration,
    /// Attempts before the proposal is abandoned; each uses a fresh ballot.
    pub max_attempts: u32,
    /// Base of the exponential backoff between attempts.
    pub backoff_base: Duration,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// One chunk placement to be decided.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub chunk_id: String,
    pub video_id: String,
    pub sequence_num: u32,
    pub size_bytes: u64,
    pub checksum: String,
    pub placement: Placement,
}

/// One node's share of a proposal: the resource probed on that node and
/// the checksum it must report. For replicated chunks every node carries
/// the chunk itself; for erasure-coded chunks each node carries one
/// fragment.
#[derive(Debug, Clone)]
struct ProbeTarget {
    node_url: String,
    resource: String,
    checksum: String,
}

impl Proposal {
    fn probe_targets(&self) -> Vec<ProbeTarget> {
        match &self.placement {
            Placement::Replicated { nodes } => nodes
                .iter()
                .map(|node_url| ProbeTarget {
                    node_url: node_url.clone(),
                    resource: self.chunk_id.clone(),
                    checksum: self.checksum.clone(),
                })
                .collect(),
            Placement::Erasure { fragments } => fragments
                .iter()
                .map(|fragment| ProbeTarget {
                    node_url: fragment.node_url.clone(),
                    resource: fragment.fragment_id.clone(),
                    checksum: fragment.checksum.clone(),
                })
                .collect(),
        }
    }
}

enum PrepareReply {
    /// Node is free (404) or carries a ballot ours supersedes.
    Promised,
    /// Node carries a strictly higher ballot.
    Conflict(u64),
    /// Busy, errored, or timed out; counts as silence for this attempt.
    NoResponse,
}

enum AcceptReply {
    Confirmed,
    Conflict(u64),
    Mismatch,
    NoResponse,
}

/// Runs ChunkPaxos for one coordinator. Proposals for distinct chunks may
/// run concurrently through the same proposer.
pub struct Proposer {
    store: Arc<Store>,
    http: reqwest::Client,
    ballots: BallotGenerator,
    cfg: ProposerConfig,
}

impl Proposer {
    pub fn new(store: Arc<Store>, http: reqwest::Client, cfg: ProposerConfig) -> Self {
        Self {
            store,
            http,
            ballots: BallotGenerator::new(),
            cfg,
        }
    }

    /// Decide where `proposal.chunk_id` lives. On success returns the node
    /// set the chunk was committed to; once exhausted, cleans up any
    /// partial rows and surfaces the final attempt's error.
    pub async fn propose(&self, proposal: &Proposal) -> Result<Vec<String>> {
        let targets = proposal.probe_targets();
        if targets.is_empty() {
            return Err(Error::EmptyNodeSet);
        }
        let quorum = targets.len() / 2 + 1;
        let backoff = Backoff::new(self.cfg.max_attempts, self.cfg.backoff_base, None);

        let mut ballot = self.ballots.next();
        let mut attempt = 1u32;
        loop {
            tracing::debug!(
                chunk_id = proposal.chunk_id,
                %ballot,
                attempt,
                nodes = targets.len(),
                quorum,
                "starting consensus attempt"
            );

            match self.attempt(proposal, &targets, ballot, quorum).await {
                Ok(nodes) => {
                    tracing::info!(
                        chunk_id = proposal.chunk_id,
                        %ballot,
                        committed = nodes.len(),
                        "consensus committed"
                    );
                    return Ok(nodes);
                }
                Err(err) if err.is_retryable() && attempt < self.cfg.max_attempts => {
                    let delay = backoff
                        .next(attempt)
                        .unwrap_or(self.cfg.backoff_base);
                    tracing::warn!(
                        chunk_id = proposal.chunk_id,
                        %ballot,
                        attempt,
                        %err,
                        ?delay,
                        "consensus attempt failed, retrying with a fresh ballot"
                    );
                    tokio::time::sleep(delay).await;
                    ballot = self.ballots.next();
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(
                        chunk_id = proposal.chunk_id,
                        %ballot,
                        attempt,
                        %err,
                        "consensus failed"
                    );
                    self.store
                        .cleanup_failed_attempt(&proposal.chunk_id, ballot.as_u64())?;
                    return Err(err);
                }
            }
        }
    }

    async fn attempt(
        &self,
        proposal: &Proposal,
        targets: &[ProbeTarget],
        ballot: Ballot,
        quorum: usize,
    ) -> Result<Vec<String>> {
        // Phase 1 — prepare. Persist the phase before any probe goes out.
        self.store.set_consensus_phase(
            &proposal.chunk_id,
            ballot.as_u64(),
            None,
            ConsensusPhase::Prepare,
        )?;

        let replies = join_all(
            targets
                .iter()
                .map(|target| self.prepare_probe(target, ballot)),
        )
        .await;

        let mut prepared: Vec<&ProbeTarget> = Vec::new();
        for (target, reply) in targets.iter().zip(replies) {
            match reply {
                PrepareReply::Promised => prepared.push(target),
                PrepareReply::Conflict(theirs) => {
                    // No point probing further against a higher promise.
                    return Err(Error::BallotConflict {
                        node: target.node_url.clone(),
                        theirs,
                        ours: ballot.as_u64(),
                    });
                }
                PrepareReply::NoResponse => {}
            }
        }
        if prepared.len() < quorum {
            return Err(Error::QuorumNotReached {
                phase: "prepare",
                got: prepared.len(),
                need: quorum,
            });
        }

        // Phase 2 — accept. Verify every prepared node actually holds the
        // expected content.
        let node_set: Vec<String> = prepared
            .iter()
            .map(|target| target.node_url.clone())
            .collect();
        self.store.set_consensus_phase(
            &proposal.chunk_id,
            ballot.as_u64(),
            Some(&node_set),
            ConsensusPhase::Accept,
        )?;

        let replies = join_all(
            prepared
                .iter()
                .map(|target| self.accept_probe(target, ballot)),
        )
        .await;

        let mut accepted: Vec<String> = Vec::new();
        for (target, reply) in prepared.iter().zip(replies) {
            match reply {
                AcceptReply::Confirmed => accepted.push(target.node_url.clone()),
                AcceptReply::Conflict(theirs) => {
                    return Err(Error::BallotConflict {
                        node: target.node_url.clone(),
                        theirs,
                        ours: ballot.as_u64(),
                    });
                }
                AcceptReply::Mismatch => {
                    return Err(Error::ChecksumMismatch {
                        node: target.node_url.clone(),
                        resource: target.resource.clone(),
                    });
                }
                AcceptReply::NoResponse => {}
            }
        }
        if accepted.len() < quorum {
            return Err(Error::QuorumNotReached {
                phase: "accept",
                got: accepted.len(),
                need: quorum,
            });
        }

        // Phase 3 — commit, in one metadata transaction. Replicated chunks
        // keep only the nodes that confirmed; an erasure-coded chunk
        // commits its full fragment layout.
        let placement = match &proposal.placement {
            Placement::Replicated { .. } => Placement::Replicated {
                nodes: accepted.clone(),
            },
            Placement::Erasure { fragments } => Placement::Erasure {
                fragments: fragments.clone(),
            },
        };
        self.store.commit_placement(&PlacementCommit {
            chunk_id: proposal.chunk_id.clone(),
            video_id: proposal.video_id.clone(),
            sequence_num: proposal.sequence_num,
            size_bytes: proposal.size_bytes,
            checksum: proposal.checksum.clone(),
            ballot: ballot.as_u64(),
            placement,
        })?;

        Ok(accepted)
    }

    async fn prepare_probe(&self, target: &ProbeTarget, ballot: Ballot) -> PrepareReply {
        let url = format!("{}/chunk/{}", target.node_url, target.resource);
        let response = self
            .http
            .head(&url)
            .header(models::headers::BALLOT_NUMBER, ballot.to_string())
            .timeout(self.cfg.rpc_timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(node = target.node_url, %err, "prepare probe failed");
                return PrepareReply::NoResponse;
            }
        };

        match response.status().as_u16() {
            // Not present: the node is free to accept this chunk.
            404 => PrepareReply::Promised,
            200 => {
                let theirs = ballot_header(&response);
                if ballot.as_u64() >= theirs {
                    PrepareReply::Promised
                } else {
                    PrepareReply::Conflict(theirs)
                }
            }
            409 => {
                tracing::debug!(node = target.node_url, "node busy during prepare");
                PrepareReply::NoResponse
            }
            status => {
                tracing::debug!(node = target.node_url, status, "unexpected prepare status");
                PrepareReply::NoResponse
            }
        }
    }

    async fn accept_probe(&self, target: &ProbeTarget, ballot: Ballot) -> AcceptReply {
        let url = format!("{}/chunk/{}", target.node_url, target.resource);
        let response = match self.http.head(&url).timeout(self.cfg.rpc_timeout).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(node = target.node_url, %err, "accept probe failed");
                return AcceptReply::NoResponse;
            }
        };

        if response.status().as_u16() != 200 {
            tracing::debug!(
                node = target.node_url,
                status = response.status().as_u16(),
                "expected content missing during accept"
            );
            return AcceptReply::NoResponse;
        }

        // A higher ballot recorded since our prepare means another
        // proposer got between the phases.
        let theirs = ballot_header(&response);
        if theirs > ballot.as_u64() {
            return AcceptReply::Conflict(theirs);
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string())
            .unwrap_or_default();
        if etag == target.checksum {
            AcceptReply::Confirmed
        } else {
            AcceptReply::Mismatch
        }
    }
}

fn ballot_header(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(models::headers::BALLOT_NUMBER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}
