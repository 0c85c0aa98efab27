use consensus::{Error, Proposal, Proposer, ProposerConfig};
use metadata::Store;
use models::{ConsensusPhase, Placement, RedundancyMode};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use test_support::StubNode;

fn test_config() -> ProposerConfig {
    ProposerConfig {
        rpc_timeout: Duration::from_secs(2),
        max_attempts: 3,
        backoff_base: Duration::from_millis(10),
    }
}

fn store_with_video() -> Arc<Store> {
    let store = Store::open_in_memory().unwrap();
    store
        .create_video("v1", "a title", 120, 10, 2_097_152)
        .unwrap();
    Arc::new(store)
}

fn replicated_proposal(seq: u32, payload: &[u8], nodes: &[StubNode]) -> Proposal {
    Proposal {
        chunk_id: models::chunk_id("v1", seq),
        video_id: "v1".to_string(),
        sequence_num: seq,
        size_bytes: payload.len() as u64,
        checksum: models::content_checksum(payload),
        placement: Placement::Replicated {
            nodes: nodes.iter().map(|node| node.url.clone()).collect(),
        },
    }
}

#[tokio::test]
async fn happy_path_replication_across_three_nodes() {
    let store = store_with_video();
    let nodes = StubNode::spawn_many(3).await;

    let payload = b"chunk zero payload".to_vec();
    let chunk_id = models::chunk_id("v1", 0);
    for node in &nodes {
        node.state().put_chunk(&chunk_id, payload.clone());
    }

    let proposer = Proposer::new(store.clone(), reqwest::Client::new(), test_config());
    let committed = proposer
        .propose(&replicated_proposal(0, &payload, &nodes))
        .await
        .unwrap();

    let expected: Vec<String> = nodes.iter().map(|node| node.url.clone()).collect();
    assert_eq!(committed, expected);

    let manifest = store.video_manifest("v1").unwrap().unwrap();
    assert_eq!(manifest.total_chunks, 1);
    assert_eq!(manifest.chunks[0].replicas.len(), 3);
    assert_eq!(manifest.chunks[0].redundancy_mode, RedundancyMode::Replication);

    let record = store.consensus_record(&chunk_id).unwrap().unwrap();
    assert_eq!(record.phase, ConsensusPhase::Committed);
}

#[tokio::test]
async fn single_node_replica_set_has_quorum_one() {
    let store = store_with_video();
    let nodes = StubNode::spawn_many(1).await;

    let payload = b"lonely chunk".to_vec();
    nodes[0]
        .state()
        .put_chunk(&models::chunk_id("v1", 0), payload.clone());

    let proposer = Proposer::new(store.clone(), reqwest::Client::new(), test_config());

    // The one node passes prepare and accept: commit succeeds.
    let committed = proposer
        .propose(&replicated_proposal(0, &payload, &nodes))
        .await
        .unwrap();
    assert_eq!(committed, vec![nodes[0].url.clone()]);

    // For the next chunk the node has no bytes: accept cannot confirm, and
    // the proposal fails after its attempts are exhausted.
    let err = proposer
        .propose(&replicated_proposal(1, b"missing", &nodes))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuorumNotReached { phase: "accept", .. }));

    let record = store
        .consensus_record(&models::chunk_id("v1", 1))
        .unwrap()
        .unwrap();
    assert_eq!(record.phase, ConsensusPhase::None);
}

#[tokio::test]
async fn busy_node_counts_as_silence() {
    let store = store_with_video();
    let nodes = StubNode::spawn_many(3).await;

    let payload = b"busy test".to_vec();
    let chunk_id = models::chunk_id("v1", 0);
    for node in &nodes {
        node.state().put_chunk(&chunk_id, payload.clone());
    }
    nodes[2].state().set_busy(true);

    let proposer = Proposer::new(store.clone(), reqwest::Client::new(), test_config());
    let committed = proposer
        .propose(&replicated_proposal(0, &payload, &nodes))
        .await
        .unwrap();

    // Quorum of 2 out of 3 is enough; the busy node is left out.
    assert_eq!(committed, vec![nodes[0].url.clone(), nodes[1].url.clone()]);
    let manifest = store.video_manifest("v1").unwrap().unwrap();
    assert_eq!(manifest.chunks[0].replicas.len(), 2);
}

#[tokio::test]
async fn majority_unreachable_fails_with_cleanup() {
    let store = store_with_video();
    let mut nodes = StubNode::spawn_many(3).await;

    let payload = b"doomed chunk".to_vec();
    let chunk_id = models::chunk_id("v1", 0);
    for node in &nodes {
        node.state().put_chunk(&chunk_id, payload.clone());
    }
    let proposal = replicated_proposal(0, &payload, &nodes);

    // Two of three nodes vanish; prepare can never reach quorum.
    nodes.truncate(1);

    let proposer = Proposer::new(store.clone(), reqwest::Client::new(), test_config());
    let err = proposer.propose(&proposal).await.unwrap_err();
    assert!(matches!(err, Error::QuorumNotReached { phase: "prepare", .. }));

    let record = store.consensus_record(&chunk_id).unwrap().unwrap();
    assert_eq!(record.phase, ConsensusPhase::None);
    assert!(store.video_manifest("v1").unwrap().unwrap().chunks.is_empty());
}

#[tokio::test]
async fn checksum_mismatch_aborts() {
    let store = store_with_video();
    let nodes = StubNode::spawn_many(3).await;

    let payload = b"the real bytes".to_vec();
    let chunk_id = models::chunk_id("v1", 0);
    nodes[0].state().put_chunk(&chunk_id, payload.clone());
    nodes[1].state().put_chunk(&chunk_id, payload.clone());
    // One node stored something else entirely.
    nodes[2].state().put_chunk(&chunk_id, b"corrupted".to_vec());

    let proposer = Proposer::new(store.clone(), reqwest::Client::new(), test_config());
    let err = proposer
        .propose(&replicated_proposal(0, &payload, &nodes))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));
}

#[tokio::test]
async fn higher_ballot_aborts_then_fresh_ballot_wins() {
    let store = store_with_video();
    let nodes = StubNode::spawn_many(3).await;

    let payload = b"contended chunk".to_vec();
    let chunk_id = models::chunk_id("v1", 0);
    for node in &nodes {
        node.state().put_chunk(&chunk_id, payload.clone());
    }

    // A rival proposer promises a ballot slightly in our future: our first
    // attempt must abort on the conflict, and the post-backoff retry must
    // supersede it.
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let rival = (now_ms + 200) << 16;
    let http = reqwest::Client::new();
    for node in &nodes {
        http.head(format!("{}/chunk/{chunk_id}", node.url))
            .header(models::headers::BALLOT_NUMBER, rival.to_string())
            .send()
            .await
            .unwrap();
    }

    let proposer = Proposer::new(
        store.clone(),
        reqwest::Client::new(),
        ProposerConfig {
            backoff_base: Duration::from_millis(800),
            ..test_config()
        },
    );
    let committed = proposer
        .propose(&replicated_proposal(0, &payload, &nodes))
        .await
        .unwrap();
    assert_eq!(committed.len(), 3);

    // The winning ballot strictly supersedes the rival's, and exactly one
    // chunk row exists.
    assert!(nodes[0].state().ballot_of(&chunk_id) > rival);
    let manifest = store.video_manifest("v1").unwrap().unwrap();
    assert_eq!(manifest.chunks.len(), 1);
    assert_eq!(
        store.consensus_record(&chunk_id).unwrap().unwrap().phase,
        ConsensusPhase::Committed
    );
}

#[tokio::test]
async fn unreachably_high_rival_exhausts_attempts() {
    let store = store_with_video();
    let nodes = StubNode::spawn_many(3).await;

    let payload = b"hopeless".to_vec();
    let chunk_id = models::chunk_id("v1", 0);
    for node in &nodes {
        node.state().put_chunk(&chunk_id, payload.clone());
    }

    let http = reqwest::Client::new();
    for node in &nodes {
        http.head(format!("{}/chunk/{chunk_id}", node.url))
            .header(models::headers::BALLOT_NUMBER, (u64::MAX >> 1).to_string())
            .send()
            .await
            .unwrap();
    }

    let proposer = Proposer::new(store.clone(), reqwest::Client::new(), test_config());
    let err = proposer
        .propose(&replicated_proposal(0, &payload, &nodes))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BallotConflict { .. }));

    let record = store.consensus_record(&chunk_id).unwrap().unwrap();
    assert_eq!(record.phase, ConsensusPhase::None);
}

#[tokio::test]
async fn erasure_placement_commits_all_fragments() {
    let store = store_with_video();
    let nodes = StubNode::spawn_many(5).await;

    let chunk_id = models::chunk_id("v1", 0);
    let fragments: Vec<models::FragmentSpec> = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let payload = format!("fragment {index} bytes").into_bytes();
            let fragment_id = models::fragment_id(&chunk_id, index as u32);
            node.state().put_chunk(&fragment_id, payload.clone());
            models::FragmentSpec {
                fragment_id,
                chunk_id: chunk_id.clone(),
                fragment_index: index as u32,
                node_url: node.url.clone(),
                size_bytes: payload.len() as u64,
                checksum: models::content_checksum(&payload),
            }
        })
        .collect();

    let proposer = Proposer::new(store.clone(), reqwest::Client::new(), test_config());
    let committed = proposer
        .propose(&Proposal {
            chunk_id: chunk_id.clone(),
            video_id: "v1".to_string(),
            sequence_num: 0,
            size_bytes: 2_097_152,
            checksum: "ab".repeat(32),
            placement: Placement::Erasure { fragments },
        })
        .await
        .unwrap();
    assert_eq!(committed.len(), 5);

    let manifest = store.video_manifest("v1").unwrap().unwrap();
    let chunk = &manifest.chunks[0];
    assert_eq!(chunk.redundancy_mode, RedundancyMode::ErasureCoding);
    assert!(chunk.replicas.is_empty());
    assert_eq!(chunk.fragments.as_ref().unwrap().len(), 5);
}
