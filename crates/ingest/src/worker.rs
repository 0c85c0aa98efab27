use crate::{Error, Result, SegmentedChunk, Segmenter};
use bytes::Bytes;
use futures::future::join_all;
use models::{
    CommitRequest, CommitResponse, CreateVideoResponse, FragmentSpec, RedundancyMode,
    StorageNode, VideoManifest, VideoStatus,
};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub coordinator_url: String,
    /// Full copies per chunk in replication mode.
    pub replicas_per_chunk: usize,
    /// Chunks uploaded concurrently.
    pub max_concurrent_uploads: usize,
    /// Placement attempts per chunk (upload + commit together).
    pub max_retries: u32,
    /// First retry delay; doubles per retry.
    pub retry_backoff: Duration,
    /// Deadline of each node upload and coordinator request.
    pub request_timeout: Duration,
    pub codec: erasure::CodecConfig,
    /// Skip the coordinator's recommendation and force a mode.
    pub mode_override: Option<RedundancyMode>,
}

impl IngestConfig {
    pub fn new(coordinator_url: impl Into<String>) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            replicas_per_chunk: 3,
            max_concurrent_uploads: 5,
            max_retries: 3,
            retry_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            codec: erasure::CodecConfig::default(),
            mode_override: None,
        }
    }
}

/// Outcome of a completed ingest.
#[derive(Debug)]
pub struct UploadReport {
    pub video_id: String,
    pub chunk_count: usize,
    pub mode: RedundancyMode,
    pub manifest: VideoManifest,
}

pub struct IngestWorker {
    http: reqwest::Client,
    cfg: IngestConfig,
    codec: erasure::Codec,
}

impl IngestWorker {
    pub fn new(http: reqwest::Client, cfg: IngestConfig) -> Result<Self> {
        let codec = erasure::Codec::new(cfg.codec)?;
        Ok(Self { http, cfg, codec })
    }

    /// Ingest one video: segment, register, fan uploads out, commit every
    /// placement, and finalize. Fails without side effects visible in a
    /// manifest if any chunk cannot be placed.
    pub async fn ingest(
        &self,
        title: &str,
        segmenter: &mut dyn Segmenter,
    ) -> Result<UploadReport> {
        let chunks = segmenter.segments()?;
        if chunks.is_empty() {
            return Err(Error::EmptySource);
        }
        let duration_sec = chunks.len() as i64 * segmenter.chunk_duration_sec();

        // The identifier the coordinator assigns here is the one every
        // commit below references.
        let video = self.register_video(title, duration_sec).await?;
        let video_id = video.video_id;
        tracing::info!(video_id, title, chunks = chunks.len(), "video registered");

        let mode = match self.cfg.mode_override {
            Some(mode) => mode,
            None => self.recommended_mode(&video_id).await?,
        };
        let required = match mode {
            RedundancyMode::Replication => self.cfg.replicas_per_chunk,
            RedundancyMode::ErasureCoding => self.codec.total_shards(),
        };

        let nodes = self.healthy_nodes().await?;
        if nodes.len() < required {
            return Err(Error::InsufficientNodes {
                need: required,
                have: nodes.len(),
            });
        }
        tracing::info!(video_id, %mode, nodes = nodes.len(), "starting upload");

        let semaphore = tokio::sync::Semaphore::new(self.cfg.max_concurrent_uploads);
        let completed = AtomicUsize::new(0);
        let total = chunks.len();

        let uploads = chunks.iter().map(|chunk| {
            let (video_id, nodes, semaphore, completed) =
                (&video_id, &nodes, &semaphore, &completed);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = self.upload_chunk(video_id, chunk, nodes, mode).await;
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(
                    video_id,
                    sequence_num = chunk.sequence_num,
                    done,
                    total,
                    ok = result.is_ok(),
                    "chunk placement finished"
                );
                result
            }
        });
        let results = join_all(uploads).await;
        let failed = results.iter().filter(|result| result.is_err()).count();
        if let Some(err) = results.into_iter().find_map(|result| result.err()) {
            tracing::error!(video_id, failed, total, "ingest failed");
            return Err(err);
        }

        let manifest = self.finalize(&video_id, total).await?;
        Ok(UploadReport {
            video_id,
            chunk_count: total,
            mode,
            manifest,
        })
    }

    /// Place one chunk, retrying the whole upload-and-commit with
    /// exponential backoff.
    async fn upload_chunk(
        &self,
        video_id: &str,
        chunk: &SegmentedChunk,
        nodes: &[String],
        mode: RedundancyMode,
    ) -> Result<()> {
        let chunk_id = models::chunk_id(video_id, chunk.sequence_num);
        let mut last_err = None;
        for attempt in 1..=self.cfg.max_retries {
            let outcome = match mode {
                RedundancyMode::Replication => {
                    self.place_replicated(video_id, &chunk_id, chunk, nodes).await
                }
                RedundancyMode::ErasureCoding => {
                    self.place_erasure(video_id, &chunk_id, chunk, nodes).await
                }
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(chunk_id, attempt, %err, "placement attempt failed");
                    if attempt < self.cfg.max_retries {
                        tokio::time::sleep(self.cfg.retry_backoff * 2u32.pow(attempt - 1))
                            .await;
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("at least one attempt ran"))
    }

    async fn place_replicated(
        &self,
        video_id: &str,
        chunk_id: &str,
        chunk: &SegmentedChunk,
        nodes: &[String],
    ) -> Result<()> {
        let targets = sample_nodes(nodes, self.cfg.replicas_per_chunk);

        let results = join_all(targets.iter().map(|node_url| {
            self.put_blob(node_url, chunk_id, chunk.data.clone(), &chunk.checksum)
        }))
        .await;
        let successful: Vec<String> = targets
            .iter()
            .zip(&results)
            .filter(|(_, result)| result.is_ok())
            .map(|(node_url, _)| node_url.clone())
            .collect();

        // Enough copies must land for consensus to have a chance at its
        // quorum; a degraded pool may still commit on two of three.
        let minimum = self.cfg.replicas_per_chunk.min(2);
        if successful.len() < minimum {
            return Err(Error::ChunkUpload {
                chunk_id: chunk_id.to_string(),
                reason: format!(
                    "only {}/{} node uploads succeeded",
                    successful.len(),
                    targets.len()
                ),
            });
        }

        self.commit(
            chunk_id,
            CommitRequest {
                node_urls: successful,
                checksum: chunk.checksum.clone(),
                size_bytes: chunk.data.len() as u64,
                video_id: video_id.to_string(),
                sequence_num: chunk.sequence_num,
                redundancy_mode: RedundancyMode::Replication,
                fragments_metadata: None,
            },
        )
        .await
    }

    async fn place_erasure(
        &self,
        video_id: &str,
        chunk_id: &str,
        chunk: &SegmentedChunk,
        nodes: &[String],
    ) -> Result<()> {
        let fragments = self.codec.encode(&chunk.data)?;
        let metadata = self.codec.fragment_metadata(chunk_id, &fragments);
        let bodies: Vec<Bytes> = fragments.into_iter().map(Bytes::from).collect();

        let targets = sample_nodes(nodes, self.codec.total_shards());
        let specs: Vec<FragmentSpec> = metadata
            .into_iter()
            .zip(&targets)
            .map(|(meta, node_url)| meta.with_node(node_url))
            .collect();

        let results = join_all(specs.iter().zip(&bodies).map(|(spec, body)| {
            self.put_blob(&spec.node_url, &spec.fragment_id, body.clone(), &spec.checksum)
        }))
        .await;

        // A committed erasure chunk carries its full fragment set, so
        // every fragment must land before the commit goes out.
        if let Some((spec, _)) = specs
            .iter()
            .zip(&results)
            .find(|(_, result)| result.is_err())
        {
            return Err(Error::ChunkUpload {
                chunk_id: chunk_id.to_string(),
                reason: format!("fragment {} failed to upload", spec.fragment_id),
            });
        }

        self.commit(
            chunk_id,
            CommitRequest {
                node_urls: targets,
                checksum: chunk.checksum.clone(),
                size_bytes: chunk.data.len() as u64,
                video_id: video_id.to_string(),
                sequence_num: chunk.sequence_num,
                redundancy_mode: RedundancyMode::ErasureCoding,
                fragments_metadata: Some(specs),
            },
        )
        .await
    }

    async fn put_blob(
        &self,
        node_url: &str,
        blob_id: &str,
        body: Bytes,
        checksum: &str,
    ) -> Result<()> {
        let fail = |reason: String| Error::ChunkUpload {
            chunk_id: blob_id.to_string(),
            reason,
        };

        let response = self
            .http
            .put(format!("{node_url}/chunk/{blob_id}"))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(models::headers::CHUNK_SIZE, body.len())
            .header(models::headers::CHECKSUM, checksum)
            .timeout(self.cfg.request_timeout)
            .body(body)
            .send()
            .await
            .map_err(|err| fail(format!("PUT to {node_url} failed: {err}")))?;

        match response.status().as_u16() {
            200 | 201 => Ok(()),
            status => Err(fail(format!("PUT to {node_url} returned HTTP {status}"))),
        }
    }

    async fn commit(&self, chunk_id: &str, request: CommitRequest) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/chunk/{chunk_id}/commit",
                self.cfg.coordinator_url
            ))
            .json(&request)
            .timeout(self.cfg.request_timeout)
            .send()
            .await
            .map_err(Error::Coordinator)?;
        if !response.status().is_success() {
            return Err(Error::CoordinatorStatus {
                status: response.status().as_u16(),
                context: format!("commit of chunk {chunk_id}"),
            });
        }

        let commit: CommitResponse = response.json().await.map_err(Error::Coordinator)?;
        if !commit.success {
            return Err(Error::CommitRejected {
                chunk_id: chunk_id.to_string(),
                message: commit.message,
            });
        }
        tracing::debug!(
            chunk_id,
            nodes = commit.committed_nodes.len(),
            "placement committed"
        );
        Ok(())
    }

    async fn register_video(&self, title: &str, duration_sec: i64) -> Result<CreateVideoResponse> {
        let response = self
            .http
            .post(format!("{}/video", self.cfg.coordinator_url))
            .json(&serde_json::json!({ "title": title, "duration_sec": duration_sec }))
            .timeout(self.cfg.request_timeout)
            .send()
            .await
            .map_err(Error::Coordinator)?;
        if !response.status().is_success() {
            return Err(Error::CoordinatorStatus {
                status: response.status().as_u16(),
                context: "video registration".to_string(),
            });
        }
        response.json().await.map_err(Error::Coordinator)
    }

    async fn healthy_nodes(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(format!("{}/nodes/healthy", self.cfg.coordinator_url))
            .timeout(self.cfg.request_timeout)
            .send()
            .await
            .map_err(Error::Coordinator)?;
        if !response.status().is_success() {
            return Err(Error::CoordinatorStatus {
                status: response.status().as_u16(),
                context: "healthy node discovery".to_string(),
            });
        }
        let nodes: Vec<StorageNode> = response.json().await.map_err(Error::Coordinator)?;
        Ok(nodes.into_iter().map(|node| node.node_url).collect())
    }

    async fn recommended_mode(&self, video_id: &str) -> Result<RedundancyMode> {
        #[derive(serde::Deserialize)]
        struct Recommendation {
            recommended_mode: RedundancyMode,
        }

        let response = self
            .http
            .get(format!(
                "{}/redundancy/recommend/{video_id}",
                self.cfg.coordinator_url
            ))
            .timeout(self.cfg.request_timeout)
            .send()
            .await
            .map_err(Error::Coordinator)?;
        if !response.status().is_success() {
            return Err(Error::CoordinatorStatus {
                status: response.status().as_u16(),
                context: "redundancy recommendation".to_string(),
            });
        }
        let recommendation: Recommendation =
            response.json().await.map_err(Error::Coordinator)?;
        Ok(recommendation.recommended_mode)
    }

    /// Verify the manifest covers every uploaded chunk with a live
    /// placement, then flip the video to `active`.
    async fn finalize(&self, video_id: &str, expected_chunks: usize) -> Result<VideoManifest> {
        let manifest = self.fetch_manifest(video_id).await?;
        if manifest.total_chunks != expected_chunks as i64 {
            return Err(Error::Verification(format!(
                "expected {expected_chunks} chunks, manifest has {}",
                manifest.total_chunks
            )));
        }
        for chunk in &manifest.chunks {
            let placed = !chunk.replicas.is_empty()
                || chunk
                    .fragments
                    .as_ref()
                    .is_some_and(|fragments| !fragments.is_empty());
            if !placed {
                return Err(Error::Verification(format!(
                    "chunk {} has no replicas or fragments",
                    chunk.chunk_id
                )));
            }
        }

        let response = self
            .http
            .patch(format!("{}/video/{video_id}/status", self.cfg.coordinator_url))
            .json(&serde_json::json!({ "status": VideoStatus::Active }))
            .timeout(self.cfg.request_timeout)
            .send()
            .await
            .map_err(Error::Coordinator)?;
        if !response.status().is_success() {
            return Err(Error::CoordinatorStatus {
                status: response.status().as_u16(),
                context: "video activation".to_string(),
            });
        }
        tracing::info!(video_id, chunks = expected_chunks, "video finalized");

        self.fetch_manifest(video_id).await
    }

    async fn fetch_manifest(&self, video_id: &str) -> Result<VideoManifest> {
        let response = self
            .http
            .get(format!("{}/manifest/{video_id}", self.cfg.coordinator_url))
            .timeout(self.cfg.request_timeout)
            .send()
            .await
            .map_err(Error::Coordinator)?;
        if !response.status().is_success() {
            return Err(Error::CoordinatorStatus {
                status: response.status().as_u16(),
                context: format!("manifest fetch for {video_id}"),
            });
        }
        response.json().await.map_err(Error::Coordinator)
    }
}

fn sample_nodes(nodes: &[String], count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    nodes
        .choose_multiple(&mut rng, count.min(nodes.len()))
        .cloned()
        .collect()
}
