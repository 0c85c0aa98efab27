//! Score-driven chunk download scheduling.
//!
//! A download request fans out over a small worker pool; each worker
//! claims chunks from a FIFO queue, picks the best-scoring healthy node
//! for each, retries with exponential backoff, and fails over across the
//! replica set. A global semaphore (sized to the worker count) bounds the
//! number of chunks in flight at any instant.

use crate::probe::NodeProbe;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Workers, and equally the cap on concurrently downloading chunks.
    pub max_concurrent: usize,
    /// Hard deadline of a single chunk download.
    pub download_timeout: Duration,
    /// Attempts against one node before failing over to the next.
    pub max_retries: u32,
    /// First retry delay; doubles per retry.
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            download_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// One chunk to download and the nodes claimed to hold it, in manifest
/// order.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub chunk_id: String,
    pub replicas: Vec<String>,
}

/// Counters for status reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStats {
    pub total_downloads: u64,
    pub failed_downloads: u64,
    pub failover_count: u64,
    pub node_load: HashMap<String, usize>,
    pub downloads_per_node: HashMap<String, u64>,
}

#[derive(Default, Debug)]
struct SchedState {
    node_load: HashMap<String, usize>,
    chunk_sources: HashMap<String, String>,
    downloads_per_node: HashMap<String, u64>,
    total_downloads: u64,
    failed_downloads: u64,
    failover_count: u64,
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("request failed")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
}

#[derive(Debug)]
pub struct Scheduler {
    probe: NodeProbe,
    http: reqwest::Client,
    cfg: SchedulerConfig,
    semaphore: Arc<tokio::sync::Semaphore>,
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub fn new(probe: NodeProbe, http: reqwest::Client, cfg: SchedulerConfig) -> Self {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(cfg.max_concurrent));
        Self {
            probe,
            http,
            cfg,
            semaphore,
            state: Mutex::new(SchedState::default()),
        }
    }

    /// Download a batch of chunks, in parallel, bounded by
    /// `max_concurrent`. Returns `chunk_id → bytes`, with `None` for
    /// chunks no replica could serve.
    pub async fn download(
        &self,
        requests: Vec<ChunkRequest>,
    ) -> HashMap<String, Option<Bytes>> {
        let queue: Mutex<VecDeque<ChunkRequest>> = Mutex::new(requests.into());
        let results: Mutex<HashMap<String, Option<Bytes>>> = Mutex::new(HashMap::new());

        let workers = self
            .cfg
            .max_concurrent
            .min(queue.lock().unwrap().len())
            .max(1);
        {
            let (queue, results) = (&queue, &results);
            futures::future::join_all((0..workers).map(|_| async move {
                loop {
                    let Some(request) = queue.lock().unwrap().pop_front() else {
                        break;
                    };
                    let bytes = self.download_chunk(&request).await;
                    results.lock().unwrap().insert(request.chunk_id, bytes);
                }
            }))
            .await;
        }

        results.into_inner().unwrap()
    }

    /// Download one chunk with failover: pick the best remaining node,
    /// retry it with backoff, then move on. Holds one semaphore slot for
    /// the whole attempt, success or not.
    pub async fn download_chunk(&self, request: &ChunkRequest) -> Option<Bytes> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("scheduler semaphore closed");

        let mut attempted: HashSet<String> = HashSet::new();
        while attempted.len() < request.replicas.len() {
            let remaining: Vec<&str> = request
                .replicas
                .iter()
                .map(String::as_str)
                .filter(|node| !attempted.contains(*node))
                .collect();
            let Some(node_url) = self.select_best(&remaining) else {
                break;
            };
            attempted.insert(node_url.clone());

            for attempt in 1..=self.cfg.max_retries {
                match self.fetch_from_node(&request.chunk_id, &node_url).await {
                    Ok(bytes) => {
                        let mut state = self.state.lock().unwrap();
                        state.total_downloads += 1;
                        *state
                            .downloads_per_node
                            .entry(node_url.clone())
                            .or_default() += 1;
                        state
                            .chunk_sources
                            .insert(request.chunk_id.clone(), node_url.clone());
                        tracing::debug!(
                            chunk_id = request.chunk_id,
                            node_url,
                            bytes = bytes.len(),
                            "chunk downloaded"
                        );
                        return Some(bytes);
                    }
                    Err(err) => {
                        tracing::debug!(
                            chunk_id = request.chunk_id,
                            node_url,
                            attempt,
                            max = self.cfg.max_retries,
                            %err,
                            "download attempt failed"
                        );
                        if attempt < self.cfg.max_retries {
                            tokio::time::sleep(self.cfg.retry_backoff * 2u32.pow(attempt - 1))
                                .await;
                        }
                    }
                }
            }

            tracing::warn!(
                chunk_id = request.chunk_id,
                node_url,
                "node exhausted its retries, failing over"
            );
            self.state.lock().unwrap().failover_count += 1;
        }

        self.state.lock().unwrap().failed_downloads += 1;
        tracing::error!(chunk_id = request.chunk_id, "no replica could serve the chunk");
        None
    }

    /// The highest-scoring candidate after a soft load penalty
    /// (`score × 1/(1 + 0.2 × active_load)`). Unhealthy nodes are
    /// filtered first, unless that would leave nothing. Ties keep the
    /// earliest node in replica order.
    pub fn select_best(&self, replicas: &[&str]) -> Option<String> {
        if replicas.is_empty() {
            return None;
        }
        let healthy: Vec<&str> = replicas
            .iter()
            .copied()
            .filter(|node| self.probe.is_healthy(node))
            .collect();
        let candidates: &[&str] = if healthy.is_empty() {
            tracing::debug!("no healthy replicas, considering all");
            replicas
        } else {
            &healthy
        };

        let state = self.state.lock().unwrap();
        let mut best: Option<(&str, f64)> = None;
        for node in candidates {
            let load = state.node_load.get(*node).copied().unwrap_or(0);
            let adjusted = self.probe.score(node) / (1.0 + 0.2 * load as f64);
            if best.map_or(true, |(_, top)| adjusted > top) {
                best = Some((node, adjusted));
            }
        }
        best.map(|(node, _)| node.to_string())
    }

    async fn fetch_from_node(&self, chunk_id: &str, node_url: &str) -> Result<Bytes, FetchError> {
        // Take the node's load slot for the duration of this one request;
        // it is released between retries.
        *self
            .state
            .lock()
            .unwrap()
            .node_load
            .entry(node_url.to_string())
            .or_default() += 1;

        let started = Instant::now();
        let result = async {
            let response = self
                .http
                .get(format!("{node_url}/chunk/{chunk_id}"))
                .timeout(self.cfg.download_timeout)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(FetchError::Status(response.status().as_u16()));
            }
            Ok(response.bytes().await?)
        }
        .await;

        {
            let mut state = self.state.lock().unwrap();
            let load = state.node_load.entry(node_url.to_string()).or_default();
            *load = load.saturating_sub(1);
        }

        if let Ok(bytes) = &result {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                let mbps = (bytes.len() as f64 * 8.0) / (elapsed * 1e6);
                self.probe.update_bandwidth(node_url, mbps);
            }
        }
        result
    }

    /// Which node served a chunk, for the audit trail.
    pub fn chunk_source(&self, chunk_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .chunk_sources
            .get(chunk_id)
            .cloned()
    }

    /// Chunks this scheduler currently has in flight against `node_url`.
    pub fn active_load(&self, node_url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .node_load
            .get(node_url)
            .copied()
            .unwrap_or(0)
    }

    pub fn statistics(&self) -> SchedulerStats {
        let state = self.state.lock().unwrap();
        SchedulerStats {
            total_downloads: state.total_downloads,
            failed_downloads: state.failed_downloads,
            failover_count: state.failover_count,
            node_load: state.node_load.clone(),
            downloads_per_node: state.downloads_per_node.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::ProbeConfig;

    fn scheduler_with_probe() -> Scheduler {
        let probe = NodeProbe::new(reqwest::Client::new(), ProbeConfig::default());
        Scheduler::new(probe, reqwest::Client::new(), SchedulerConfig::default())
    }

    #[test]
    fn equal_scores_prefer_least_loaded_then_insertion_order() {
        let scheduler = scheduler_with_probe();
        for node in ["http://n1", "http://n2", "http://n3"] {
            scheduler.probe.record_success(node, 20.0);
            scheduler.probe.update_bandwidth(node, 50.0);
        }

        // All scores equal and no load: insertion order wins.
        let picked = scheduler
            .select_best(&["http://n1", "http://n2", "http://n3"])
            .unwrap();
        assert_eq!(picked, "http://n1");

        // Three in-flight chunks against n1 push the choice to n2.
        scheduler
            .state
            .lock()
            .unwrap()
            .node_load
            .insert("http://n1".to_string(), 3);
        let picked = scheduler
            .select_best(&["http://n1", "http://n2", "http://n3"])
            .unwrap();
        assert_eq!(picked, "http://n2");
    }

    #[test]
    fn unhealthy_nodes_are_filtered_with_full_set_fallback() {
        let scheduler = scheduler_with_probe();
        scheduler.probe.record_success("http://n1", 10.0);
        // n2 has a much better score but is failing its probes.
        scheduler.probe.record_success("http://n2", 1.0);
        scheduler.probe.update_bandwidth("http://n2", 1000.0);
        for _ in 0..4 {
            scheduler.probe.record_failure("http://n2");
        }

        let picked = scheduler.select_best(&["http://n2", "http://n1"]).unwrap();
        assert_eq!(picked, "http://n1");

        // When nothing is healthy, fall back to the full replica set.
        for _ in 0..4 {
            scheduler.probe.record_failure("http://n1");
        }
        let picked = scheduler.select_best(&["http://n2", "http://n1"]).unwrap();
        assert_eq!(picked, "http://n2");

        assert!(scheduler.select_best(&[]).is_none());
    }
}
