use metadata::{PlacementCommit, Store};
use models::Placement;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream_client::{
    ChunkRequest, NodeProbe, ProbeConfig, Scheduler, SchedulerConfig, Session, SessionConfig,
};
use test_support::StubNode;

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Serve a coordinator over an in-memory store, for sessions to fetch
/// manifests from.
async fn spawn_coordinator(store: Arc<Store>) -> String {
    let app = coordinator::App::new(
        store,
        reqwest::Client::new(),
        redundancy::Policy::new(redundancy::PolicyConfig::default()),
        consensus::ProposerConfig::default(),
        coordinator::Config::default(),
    );
    let router = coordinator::router(app);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn fast_session_config(coordinator: &str) -> SessionConfig {
    let mut cfg = SessionConfig::new(coordinator);
    cfg.probe.ping_interval = Duration::from_millis(50);
    cfg.scheduler.retry_backoff = Duration::from_millis(1);
    cfg.refill_wait = Duration::from_millis(50);
    cfg
}

#[tokio::test]
async fn scheduler_fails_over_after_exhausting_retries() {
    let nodes = StubNode::spawn_many(3).await;
    let payload = b"failover payload".to_vec();
    let chunk_id = "v1-chunk-000";

    // Every node claims the chunk; the fastest-looking one serves only
    // errors.
    for node in &nodes {
        node.state().put_chunk(chunk_id, payload.clone());
    }
    nodes[2]
        .state()
        .fail_chunk_gets(Some(axum::http::StatusCode::SERVICE_UNAVAILABLE));

    let probe = NodeProbe::new(reqwest::Client::new(), ProbeConfig::default());
    probe.record_success(&nodes[0].url, 20.0);
    probe.update_bandwidth(&nodes[0].url, 50.0);
    probe.record_success(&nodes[1].url, 80.0);
    probe.update_bandwidth(&nodes[1].url, 30.0);
    probe.record_success(&nodes[2].url, 5.0);
    probe.update_bandwidth(&nodes[2].url, 200.0);

    let scheduler = Scheduler::new(
        probe,
        reqwest::Client::new(),
        SchedulerConfig {
            max_retries: 3,
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        },
    );

    let request = ChunkRequest {
        chunk_id: chunk_id.to_string(),
        replicas: nodes.iter().map(|node| node.url.clone()).collect(),
    };
    let bytes = scheduler.download_chunk(&request).await.unwrap();
    assert_eq!(&bytes[..], &payload[..]);

    // Three attempts against the failing node, then exactly one failover
    // to the next-best node.
    assert_eq!(nodes[2].state().get_count(), 3);
    assert_eq!(scheduler.chunk_source(chunk_id), Some(nodes[0].url.clone()));
    let stats = scheduler.statistics();
    assert_eq!(stats.failover_count, 1);
    assert_eq!(stats.failed_downloads, 0);
    assert_eq!(stats.total_downloads, 1);
}

#[tokio::test]
async fn download_never_exceeds_the_concurrency_bound() {
    let node = StubNode::spawn().await;
    node.state().set_response_delay_ms(30);

    let probe = NodeProbe::new(reqwest::Client::new(), ProbeConfig::default());
    probe.record_success(&node.url, 10.0);

    let requests: Vec<ChunkRequest> = (0..12)
        .map(|seq| {
            let chunk_id = format!("v1-chunk-{seq:03}");
            node.state().put_chunk(&chunk_id, vec![seq as u8; 1024]);
            ChunkRequest {
                chunk_id,
                replicas: vec![node.url.clone()],
            }
        })
        .collect();

    let scheduler = Scheduler::new(
        probe,
        reqwest::Client::new(),
        SchedulerConfig {
            max_concurrent: 4,
            ..Default::default()
        },
    );
    let results = scheduler.download(requests).await;

    assert_eq!(results.len(), 12);
    assert!(results.values().all(|bytes| bytes.is_some()));
    let peak = node.state().max_in_flight();
    assert!(peak <= 4, "peak concurrency {peak} exceeded the bound");
    assert!(peak >= 2, "downloads never overlapped");
}

#[tokio::test]
async fn session_streams_a_replicated_video_in_order() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.create_video("v1", "e2e", 50, 10, 2_097_152).unwrap();

    let nodes = StubNode::spawn_many(3).await;
    let mut payloads: HashMap<u32, Vec<u8>> = HashMap::new();
    for seq in 0..5u32 {
        let payload = random_bytes(10_000, seq as u64);
        let chunk_id = models::chunk_id("v1", seq);
        for node in &nodes {
            node.state().put_chunk(&chunk_id, payload.clone());
        }
        store
            .commit_placement(&PlacementCommit {
                chunk_id,
                video_id: "v1".to_string(),
                sequence_num: seq,
                size_bytes: payload.len() as u64,
                checksum: models::content_checksum(&payload),
                ballot: seq as u64 + 1,
                placement: Placement::Replicated {
                    nodes: nodes.iter().map(|node| node.url.clone()).collect(),
                },
            })
            .unwrap();
        payloads.insert(seq, payload);
    }

    let coordinator_url = spawn_coordinator(store).await;
    let session = Session::start(
        reqwest::Client::new(),
        fast_session_config(&coordinator_url),
        "v1",
    )
    .await
    .unwrap();

    let mut played = Vec::new();
    while let Some(chunk) = session.next_chunk().await {
        assert_eq!(&chunk.bytes[..], &payloads[&chunk.sequence_num][..]);
        played.push(chunk.sequence_num);
    }
    assert_eq!(played, vec![0, 1, 2, 3, 4]);

    assert!(session.startup_latency().is_some());
    let stats = session.stats();
    assert_eq!(stats.scheduler.total_downloads, 5);
    assert_eq!(stats.scheduler.failed_downloads, 0);
    assert_eq!(stats.buffer.played_total, 5);
    assert_eq!(stats.integrity_failures, 0);

    // Every chunk's serving node is on record.
    for seq in 0..5u32 {
        assert!(session.chunk_source(&models::chunk_id("v1", seq)).is_some());
    }
    session.stop().await;
}

#[tokio::test]
async fn session_reconstructs_an_erasure_coded_chunk() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.create_video("v1", "erasure", 10, 10, 2_097_152).unwrap();

    let payload = random_bytes(100_000, 7);
    let chunk_id = models::chunk_id("v1", 0);
    let codec = erasure::Codec::new(erasure::CodecConfig::default()).unwrap();
    let fragments = codec.encode(&payload).unwrap();
    let fragment_meta = codec.fragment_metadata(&chunk_id, &fragments);

    let nodes = StubNode::spawn_many(5).await;
    let mut specs = Vec::new();
    for (index, (node, meta)) in nodes.iter().zip(fragment_meta).enumerate() {
        // One node lost its fragment; three of the remaining four suffice.
        if index != 1 {
            node.state().put_chunk(&meta.fragment_id, fragments[index].clone());
        }
        specs.push(meta.with_node(&node.url));
    }

    store
        .commit_placement(&PlacementCommit {
            chunk_id: chunk_id.clone(),
            video_id: "v1".to_string(),
            sequence_num: 0,
            size_bytes: payload.len() as u64,
            checksum: models::content_checksum(&payload),
            ballot: 1,
            placement: Placement::Erasure { fragments: specs },
        })
        .unwrap();

    let coordinator_url = spawn_coordinator(store).await;
    let mut cfg = fast_session_config(&coordinator_url);
    cfg.scheduler.max_retries = 1;

    let session = Session::start(reqwest::Client::new(), cfg, "v1").await.unwrap();
    let chunk = session.next_chunk().await.unwrap();
    assert_eq!(chunk.sequence_num, 0);
    assert_eq!(&chunk.bytes[..], &payload[..]);
    assert!(session.next_chunk().await.is_none());

    let stats = session.stats();
    assert_eq!(stats.integrity_failures, 0);
    // The lost fragment shows up as a failed download, nothing more.
    assert_eq!(stats.scheduler.failed_downloads, 1);
    session.stop().await;
}

#[tokio::test]
async fn session_surfaces_missing_videos() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let coordinator_url = spawn_coordinator(store).await;

    let err = Session::start(
        reqwest::Client::new(),
        fast_session_config(&coordinator_url),
        "missing",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, stream_client::Error::VideoNotFound(_)));
}
