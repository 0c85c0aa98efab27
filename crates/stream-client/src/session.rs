//! A streaming session: manifest in, ordered chunk bytes out.
//!
//! The session owns two cooperating halves. A background download loop
//! watches the buffer's low-water mark, resolves the next sequence
//! numbers against the manifest, and feeds scheduler results back into
//! the buffer (reconstructing erasure-coded chunks from fragments on the
//! way). The consumer half is [`Session::next_chunk`], which hands back
//! chunks in strict sequence order at whatever rate the caller reads.
//! Both halves are children of the session and stop when it does.

use crate::buffer::{BufferConfig, BufferStatus, PlaybackBuffer, PlayedChunk};
use crate::probe::{NodeProbe, NodeStats, ProbeConfig};
use crate::scheduler::{ChunkRequest, Scheduler, SchedulerConfig, SchedulerStats};
use crate::{Error, Result};
use models::{ManifestChunk, RedundancyMode, VideoManifest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub coordinator_url: String,
    pub probe: ProbeConfig,
    pub scheduler: SchedulerConfig,
    pub buffer: BufferConfig,
    pub codec: erasure::CodecConfig,
    /// Bounded wait on `buffer-changed` before either loop re-checks.
    pub refill_wait: Duration,
}

impl SessionConfig {
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            probe: ProbeConfig::default(),
            scheduler: SchedulerConfig::default(),
            buffer: BufferConfig::default(),
            codec: erasure::CodecConfig::default(),
            refill_wait: Duration::from_millis(500),
        }
    }
}

/// Point-in-time session report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub video_id: String,
    pub startup_latency_secs: Option<f64>,
    pub buffer: BufferStatus,
    pub scheduler: SchedulerStats,
    pub nodes: Vec<NodeStats>,
    pub integrity_failures: u64,
}

#[derive(Debug)]
pub struct Session {
    manifest: VideoManifest,
    probe: NodeProbe,
    scheduler: Arc<Scheduler>,
    buffer: Arc<PlaybackBuffer>,
    cancel: CancellationToken,
    download_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    refill_wait: Duration,
    opened_at: Instant,
    startup_latency: Mutex<Option<Duration>>,
    integrity_failures: Arc<AtomicU64>,
}

impl Session {
    /// Fetch the manifest for `video_id`, start probing the nodes it
    /// names, and begin filling the buffer.
    pub async fn start(
        http: reqwest::Client,
        mut cfg: SessionConfig,
        video_id: &str,
    ) -> Result<Session> {
        let manifest = fetch_manifest(&http, &cfg.coordinator_url, video_id).await?;
        let opened_at = Instant::now();
        tracing::info!(
            video_id,
            total_chunks = manifest.total_chunks,
            "manifest fetched"
        );

        // The manifest's chunk duration is authoritative for watermark
        // arithmetic.
        cfg.buffer.chunk_duration_secs = manifest.chunk_duration_sec as f64;

        let probe = NodeProbe::new(http.clone(), cfg.probe.clone());
        probe.start(collect_nodes(&manifest));

        let buffer = Arc::new(PlaybackBuffer::new(cfg.buffer.clone()));
        let scheduler = Arc::new(Scheduler::new(
            probe.clone(),
            http.clone(),
            cfg.scheduler.clone(),
        ));
        let integrity_failures = Arc::new(AtomicU64::new(0));

        let cancel = CancellationToken::new();
        let downloader = Arc::new(Downloader {
            scheduler: scheduler.clone(),
            buffer: buffer.clone(),
            chunks_by_seq: manifest
                .chunks
                .iter()
                .map(|chunk| (chunk.sequence_num, chunk.clone()))
                .collect(),
            codec: erasure::Codec::new(cfg.codec).map_err(Error::Codec)?,
            total_chunks: manifest.total_chunks,
            refill_wait: cfg.refill_wait,
            integrity_failures: integrity_failures.clone(),
        });
        let download_task = tokio::spawn(downloader.run(cancel.clone()));

        Ok(Session {
            manifest,
            probe,
            scheduler,
            buffer,
            cancel,
            download_task: Mutex::new(Some(download_task)),
            refill_wait: cfg.refill_wait,
            opened_at,
            startup_latency: Mutex::new(None),
            integrity_failures,
        })
    }

    pub fn manifest(&self) -> &VideoManifest {
        &self.manifest
    }

    pub fn buffer(&self) -> &PlaybackBuffer {
        &self.buffer
    }

    /// Which node served a chunk, for the audit trail.
    pub fn chunk_source(&self, chunk_id: &str) -> Option<String> {
        self.scheduler.chunk_source(chunk_id)
    }

    /// Time from manifest fetch until the start-playback watermark was
    /// first satisfied.
    pub fn startup_latency(&self) -> Option<Duration> {
        *self.startup_latency.lock().unwrap()
    }

    /// The consumer loop: the next chunk in strict sequence order.
    ///
    /// Blocks (with bounded waits) through initial buffering, gaps, and
    /// underruns. Returns `None` once the last chunk has been played or
    /// the session was stopped.
    pub async fn next_chunk(&self) -> Option<PlayedChunk> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if self.buffer.position() as i64 >= self.manifest.total_chunks {
                return None;
            }

            // Hold playback until the startup watermark is satisfied. A
            // short tail (or a short video) can never reach it, so a fully
            // buffered remainder also unblocks.
            if !self.buffer.status().playback_started {
                let status = self.buffer.status();
                let tail_buffered = status.current_position as i64 + status.level_chunks as i64
                    >= self.manifest.total_chunks;
                if !status.can_start && !tail_buffered {
                    self.buffer.wait_for_change(self.refill_wait).await;
                    continue;
                }
                let mut startup = self.startup_latency.lock().unwrap();
                if startup.is_none() {
                    let latency = self.opened_at.elapsed();
                    *startup = Some(latency);
                    tracing::info!(latency_secs = latency.as_secs_f64(), "playback ready");
                }
            }

            match self.buffer.take() {
                Ok(Some(chunk)) => return Some(chunk),
                // Gap or underrun: wait for the download loop to refill.
                Ok(None) => {
                    self.buffer.wait_for_change(self.refill_wait).await;
                }
                Err(err) => {
                    tracing::error!(%err, "failed to take chunk from buffer");
                    self.buffer.wait_for_change(self.refill_wait).await;
                }
            }
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            video_id: self.manifest.video_id.clone(),
            startup_latency_secs: self.startup_latency().map(|d| d.as_secs_f64()),
            buffer: self.buffer.status(),
            scheduler: self.scheduler.statistics(),
            nodes: self.probe.stats(),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
        }
    }

    /// Cancel both loops, await their exit, stop probing, and drop all
    /// buffered data (including spilled temp files).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.download_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.probe.stop().await;
        self.buffer.reset();
        tracing::info!("session stopped");
    }
}

fn collect_nodes(manifest: &VideoManifest) -> Vec<String> {
    let mut nodes: Vec<String> = Vec::new();
    let mut push = |url: &str| {
        if !url.is_empty() && !nodes.iter().any(|known| known == url) {
            nodes.push(url.to_string());
        }
    };
    for chunk in &manifest.chunks {
        for replica in &chunk.replicas {
            push(replica);
        }
        for fragment in chunk.fragments.iter().flatten() {
            push(&fragment.node_url);
        }
    }
    nodes
}

async fn fetch_manifest(
    http: &reqwest::Client,
    coordinator_url: &str,
    video_id: &str,
) -> Result<VideoManifest> {
    let response = http
        .get(format!("{coordinator_url}/manifest/{video_id}"))
        .send()
        .await
        .map_err(Error::Manifest)?;
    if response.status().as_u16() == 404 {
        return Err(Error::VideoNotFound(video_id.to_string()));
    }
    let response = response.error_for_status().map_err(Error::Manifest)?;
    response.json().await.map_err(Error::ManifestDecode)
}

/// The background download loop.
struct Downloader {
    scheduler: Arc<Scheduler>,
    buffer: Arc<PlaybackBuffer>,
    chunks_by_seq: HashMap<u32, ManifestChunk>,
    codec: erasure::Codec,
    total_chunks: i64,
    refill_wait: Duration,
    integrity_failures: Arc<AtomicU64>,
}

impl Downloader {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::debug!("download loop started");
        while !cancel.is_cancelled() {
            if self.buffer.needs_more() {
                let fetched = self.fill_once(&cancel).await;
                if !fetched {
                    if self.buffer.position() as i64 >= self.total_chunks {
                        break;
                    }
                    self.buffer.wait_for_change(self.refill_wait).await;
                }
            } else {
                self.buffer.wait_for_change(self.refill_wait).await;
            }
        }
        tracing::debug!("download loop stopped");
    }

    /// One refill round. Returns whether any download was issued.
    async fn fill_once(&self, cancel: &CancellationToken) -> bool {
        let cfg = self.buffer.config();
        let deficit = (cfg.target_buffer_secs - self.buffer.level_secs())
            / cfg.chunk_duration_secs;
        let want = (deficit.ceil() as i64 + 2).max(1) as usize;

        // Fetch holes behind the buffered tail first (a chunk whose every
        // replica failed earlier), then extend past the tail.
        let mut sequences = self.buffer.gap_sequences();
        sequences.extend(self.buffer.next_sequences(want));
        sequences.retain(|&seq| (seq as i64) < self.total_chunks);

        let mut requests: Vec<ChunkRequest> = Vec::new();
        let mut replicated: Vec<&ManifestChunk> = Vec::new();
        let mut erasure: Vec<&ManifestChunk> = Vec::new();
        for seq in &sequences {
            let Some(chunk) = self.chunks_by_seq.get(seq) else {
                tracing::warn!(sequence_num = seq, "manifest has no chunk for sequence");
                continue;
            };
            match chunk.redundancy_mode {
                RedundancyMode::Replication => {
                    requests.push(ChunkRequest {
                        chunk_id: chunk.chunk_id.clone(),
                        replicas: chunk.replicas.clone(),
                    });
                    replicated.push(chunk);
                }
                RedundancyMode::ErasureCoding => {
                    // Each fragment downloads independently from its node.
                    for fragment in chunk.fragments.iter().flatten() {
                        requests.push(ChunkRequest {
                            chunk_id: fragment.fragment_id.clone(),
                            replicas: vec![fragment.node_url.clone()],
                        });
                    }
                    erasure.push(chunk);
                }
            }
        }
        if requests.is_empty() {
            return false;
        }

        let results = self.scheduler.download(requests).await;
        if cancel.is_cancelled() {
            // Drop in-flight results on the floor.
            return true;
        }

        for chunk in replicated {
            if let Some(Some(bytes)) = results.get(&chunk.chunk_id) {
                self.add_to_buffer(chunk, bytes.clone());
            }
        }
        for chunk in erasure {
            self.reassemble(chunk, &results);
        }
        true
    }

    /// Rebuild an erasure-coded chunk from whichever fragments arrived.
    fn reassemble(
        &self,
        chunk: &ManifestChunk,
        results: &HashMap<String, Option<bytes::Bytes>>,
    ) {
        let available: Vec<(usize, Vec<u8>)> = chunk
            .fragments
            .iter()
            .flatten()
            .filter_map(|fragment| {
                results
                    .get(&fragment.fragment_id)
                    .and_then(|bytes| bytes.as_ref())
                    .map(|bytes| (fragment.fragment_index as usize, bytes.to_vec()))
            })
            .collect();

        if available.len() < self.codec.data_shards() {
            tracing::warn!(
                chunk_id = chunk.chunk_id,
                available = available.len(),
                needed = self.codec.data_shards(),
                "not enough fragments to reconstruct chunk"
            );
            return;
        }

        match self.codec.decode(available, chunk.size_bytes as usize) {
            Ok(bytes) => {
                // A recovered chunk must hash back to the manifest
                // checksum; anything else is discarded as a failed
                // download and failover proceeds on the next round.
                if models::content_checksum(&bytes) != chunk.checksum {
                    self.integrity_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        chunk_id = chunk.chunk_id,
                        "reconstructed chunk failed checksum verification"
                    );
                    return;
                }
                self.add_to_buffer(chunk, bytes::Bytes::from(bytes));
            }
            Err(err) => {
                self.integrity_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(chunk_id = chunk.chunk_id, %err, "fragment decode failed");
            }
        }
    }

    fn add_to_buffer(&self, chunk: &ManifestChunk, bytes: bytes::Bytes) {
        match self
            .buffer
            .add(&chunk.chunk_id, chunk.sequence_num, bytes)
        {
            Ok(_) => {}
            Err(err) => {
                tracing::error!(chunk_id = chunk.chunk_id, %err, "failed to buffer chunk");
            }
        }
    }
}
