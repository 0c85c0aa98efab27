use ingest::{FileSegmenter, IngestConfig, IngestWorker};
use metadata::Store;
use models::RedundancyMode;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use test_support::StubNode;

async fn spawn_coordinator() -> (String, Arc<Store>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let app = coordinator::App::new(
        store.clone(),
        reqwest::Client::new(),
        redundancy::Policy::new(redundancy::PolicyConfig::default()),
        consensus::ProposerConfig {
            rpc_timeout: Duration::from_secs(2),
            max_attempts: 2,
            backoff_base: Duration::from_millis(10),
        },
        coordinator::Config::default(),
    );
    let router = coordinator::router(app);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), store)
}

async fn register_nodes(coordinator_url: &str, nodes: &[StubNode]) {
    let http = reqwest::Client::new();
    for (index, node) in nodes.iter().enumerate() {
        let response = http
            .post(format!("{coordinator_url}/nodes/register"))
            .json(&serde_json::json!({
                "node_url": node.url,
                "node_id": format!("n{index}"),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }
}

fn source_file(len: usize, seed: u64) -> (tempfile::NamedTempFile, Vec<u8>) {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    (file, data)
}

fn fast_ingest_config(coordinator_url: &str) -> IngestConfig {
    let mut cfg = IngestConfig::new(coordinator_url);
    cfg.retry_backoff = Duration::from_millis(10);
    cfg
}

async fn stream_back(coordinator_url: &str, video_id: &str) -> Vec<u8> {
    let mut cfg = stream_client::SessionConfig::new(coordinator_url);
    cfg.probe.ping_interval = Duration::from_millis(50);
    cfg.scheduler.retry_backoff = Duration::from_millis(1);
    cfg.refill_wait = Duration::from_millis(50);

    let session = stream_client::Session::start(reqwest::Client::new(), cfg, video_id)
        .await
        .unwrap();
    let mut played = Vec::new();
    let mut expected_seq = 0;
    while let Some(chunk) = session.next_chunk().await {
        assert_eq!(chunk.sequence_num, expected_seq);
        expected_seq += 1;
        played.extend_from_slice(&chunk.bytes);
    }
    session.stop().await;
    played
}

#[tokio::test]
async fn replicated_ingest_then_stream_round_trip() {
    let (coordinator_url, store) = spawn_coordinator().await;
    let nodes = StubNode::spawn_many(3).await;
    register_nodes(&coordinator_url, &nodes).await;

    // Five chunks of 1000 bytes, the last one short.
    let (file, data) = source_file(4_500, 1);
    let mut cfg = fast_ingest_config(&coordinator_url);
    cfg.mode_override = Some(RedundancyMode::Replication);

    let worker = IngestWorker::new(reqwest::Client::new(), cfg).unwrap();
    let mut segmenter = FileSegmenter::new(file.path(), 1_000, 10);
    let report = worker.ingest("round trip", &mut segmenter).await.unwrap();

    assert_eq!(report.chunk_count, 5);
    assert_eq!(report.manifest.total_chunks, 5);
    assert_eq!(report.manifest.status, models::VideoStatus::Active);
    for chunk in &report.manifest.chunks {
        assert_eq!(chunk.redundancy_mode, RedundancyMode::Replication);
        assert_eq!(chunk.replicas.len(), 3);
    }

    // Every chunk's consensus record reached COMMITTED.
    for seq in 0..5 {
        let record = store
            .consensus_record(&models::chunk_id(&report.video_id, seq))
            .unwrap()
            .unwrap();
        assert_eq!(record.phase, models::ConsensusPhase::Committed);
    }

    // A streaming client plays back exactly the ingested bytes.
    let played = stream_back(&coordinator_url, &report.video_id).await;
    assert_eq!(played, data);
}

#[tokio::test]
async fn cold_video_is_erasure_coded_and_recoverable() {
    let (coordinator_url, _store) = spawn_coordinator().await;
    let nodes = StubNode::spawn_many(5).await;
    register_nodes(&coordinator_url, &nodes).await;

    let (file, data) = source_file(20_000, 2);
    // No override: zero views keeps the video below the popularity
    // threshold, so the coordinator recommends erasure coding.
    let worker =
        IngestWorker::new(reqwest::Client::new(), fast_ingest_config(&coordinator_url)).unwrap();
    let mut segmenter = FileSegmenter::new(file.path(), 7_000, 10);
    let report = worker.ingest("cold video", &mut segmenter).await.unwrap();

    assert_eq!(report.mode, RedundancyMode::ErasureCoding);
    assert_eq!(report.chunk_count, 3);
    for chunk in &report.manifest.chunks {
        assert_eq!(chunk.redundancy_mode, RedundancyMode::ErasureCoding);
        assert_eq!(chunk.fragments.as_ref().unwrap().len(), 5);
    }

    let played = stream_back(&coordinator_url, &report.video_id).await;
    assert_eq!(played, data);
}

#[tokio::test]
async fn ingest_refuses_without_enough_nodes() {
    let (coordinator_url, _store) = spawn_coordinator().await;
    let nodes = StubNode::spawn_many(2).await;
    register_nodes(&coordinator_url, &nodes).await;

    let (file, _) = source_file(1_000, 3);
    let mut cfg = fast_ingest_config(&coordinator_url);
    cfg.mode_override = Some(RedundancyMode::Replication);

    let worker = IngestWorker::new(reqwest::Client::new(), cfg).unwrap();
    let mut segmenter = FileSegmenter::new(file.path(), 1_000, 10);
    let err = worker
        .ingest("undersized pool", &mut segmenter)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ingest::Error::InsufficientNodes { need: 3, have: 2 }
    ));

    // Nothing was registered beyond the empty video record.
    let http = reqwest::Client::new();
    let videos: Vec<serde_json::Value> = http
        .get(format!("{coordinator_url}/videos"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0]["total_chunks"], 0);
}

#[tokio::test]
async fn failed_node_uploads_still_commit_on_a_quorum() {
    let (coordinator_url, _store) = spawn_coordinator().await;
    let mut nodes = StubNode::spawn_many(3).await;
    register_nodes(&coordinator_url, &nodes).await;

    // One registered node dies before the upload starts. Its PUTs fail,
    // but two of three copies are enough to commit.
    let dead = nodes.pop().unwrap();
    drop(dead);

    let (file, data) = source_file(2_000, 4);
    let mut cfg = fast_ingest_config(&coordinator_url);
    cfg.mode_override = Some(RedundancyMode::Replication);

    let worker = IngestWorker::new(reqwest::Client::new(), cfg).unwrap();
    let mut segmenter = FileSegmenter::new(file.path(), 1_000, 10);
    let report = worker.ingest("degraded pool", &mut segmenter).await.unwrap();

    assert_eq!(report.chunk_count, 2);
    for chunk in &report.manifest.chunks {
        assert_eq!(chunk.replicas.len(), 2);
    }
    let played = stream_back(&coordinator_url, &report.video_id).await;
    assert_eq!(played, data);
}
