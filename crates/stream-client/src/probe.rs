//! Live per-node performance estimation.
//!
//! A periodic ticker pings every known node in parallel and records
//! latency and success observations into bounded FIFO windows; the
//! scheduler feeds real bandwidth numbers back after each download. The
//! scalar score derives from window means, so the window length controls
//! responsiveness.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Cadence of the liveness ticker.
    pub ping_interval: Duration,
    /// Hard per-node deadline of each ping; a timeout counts as failure.
    pub ping_timeout: Duration,
    /// Latency and bandwidth window length.
    pub history_size: usize,
    /// Success-ratio window length; longer, for a steadier signal.
    pub success_history_size: usize,
    /// A node without a successful probe within this span is unhealthy.
    pub node_health_timeout: Duration,
    /// Assumed bandwidth until a real download is observed.
    pub bandwidth_prior_mbps: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            history_size: 10,
            success_history_size: 20,
            node_health_timeout: Duration::from_secs(30),
            bandwidth_prior_mbps: 50.0,
        }
    }
}

/// A point-in-time view of one node's windows.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeStats {
    pub node_url: String,
    pub latency_ms: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
    pub success_rate: f64,
    pub score: f64,
    pub healthy: bool,
    pub samples: usize,
}

#[derive(Default)]
#[derive(Debug)]
struct Window {
    latencies: VecDeque<f64>,
    bandwidths: VecDeque<f64>,
    successes: VecDeque<f64>,
    last_success: Option<Instant>,
}

impl Window {
    fn push_bounded(queue: &mut VecDeque<f64>, value: f64, cap: usize) {
        if queue.len() == cap {
            queue.pop_front();
        }
        queue.push_back(value);
    }

    fn score(&self, cfg: &ProbeConfig) -> f64 {
        // No latency sample yet means no basis for a score at all.
        let Some(latency) = mean(&self.latencies) else {
            return 0.0;
        };
        let bandwidth = mean(&self.bandwidths).unwrap_or(cfg.bandwidth_prior_mbps);
        let success = mean(&self.successes).unwrap_or(0.0);
        (bandwidth * success) / (1.0 + latency * 0.1)
    }

    fn healthy(&self, cfg: &ProbeConfig) -> bool {
        match self.last_success {
            None => false,
            Some(at) if at.elapsed() > cfg.node_health_timeout => false,
            Some(_) => {
                let (sum, count) = self
                    .successes
                    .iter()
                    .rev()
                    .take(5)
                    .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
                count > 0 && sum / count as f64 > 0.5
            }
        }
    }
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

type NodeWindow = Arc<Mutex<Window>>;

#[derive(Debug)]
struct RunHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Debug)]
struct Inner {
    cfg: ProbeConfig,
    http: reqwest::Client,
    // One lock per node; the outer map lock is never held across awaits.
    windows: Mutex<HashMap<String, NodeWindow>>,
    nodes: Mutex<Vec<String>>,
    run: Mutex<Option<RunHandle>>,
}

/// Measures node performance in the background and answers score and
/// health queries. Cheap to clone and share.
#[derive(Clone, Debug)]
pub struct NodeProbe {
    inner: Arc<Inner>,
}

impl NodeProbe {
    pub fn new(http: reqwest::Client, cfg: ProbeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                http,
                windows: Mutex::new(HashMap::new()),
                nodes: Mutex::new(Vec::new()),
                run: Mutex::new(None),
            }),
        }
    }

    /// Begin probing `nodes`. A second start while running is a no-op.
    pub fn start(&self, nodes: Vec<String>) {
        let mut run = self.inner.run.lock().unwrap();
        if run.is_some() {
            tracing::warn!("probe already started");
            return;
        }

        {
            let mut windows = self.inner.windows.lock().unwrap();
            for node in &nodes {
                windows.entry(node.clone()).or_default();
            }
        }
        *self.inner.nodes.lock().unwrap() = nodes.clone();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(ping_loop(self.clone(), nodes, cancel.clone()));
        *run = Some(RunHandle { cancel, task });
        tracing::debug!("probe started");
    }

    /// Stop probing, cancel scheduled work, and clear all windows.
    pub async fn stop(&self) {
        let run = self.inner.run.lock().unwrap().take();
        let Some(run) = run else {
            return;
        };
        run.cancel.cancel();
        let _ = run.task.await;

        self.inner.windows.lock().unwrap().clear();
        self.inner.nodes.lock().unwrap().clear();
        tracing::debug!("probe stopped");
    }

    fn window(&self, node_url: &str) -> NodeWindow {
        let mut windows = self.inner.windows.lock().unwrap();
        windows.entry(node_url.to_string()).or_default().clone()
    }

    /// Record a successful liveness probe and its round-trip latency.
    pub fn record_success(&self, node_url: &str, latency_ms: f64) {
        let cfg = &self.inner.cfg;
        let window = self.window(node_url);
        let mut window = window.lock().unwrap();
        Window::push_bounded(&mut window.latencies, latency_ms, cfg.history_size);
        Window::push_bounded(&mut window.successes, 1.0, cfg.success_history_size);
        window.last_success = Some(Instant::now());
    }

    /// Record a failed or timed-out probe. No latency is recorded.
    pub fn record_failure(&self, node_url: &str) {
        let cfg = &self.inner.cfg;
        let window = self.window(node_url);
        let mut window = window.lock().unwrap();
        Window::push_bounded(&mut window.successes, 0.0, cfg.success_history_size);
    }

    /// Feed an observed download bandwidth. The scheduler calls this after
    /// every successful chunk download; it is the only source of real
    /// bandwidth numbers.
    pub fn update_bandwidth(&self, node_url: &str, mbps: f64) {
        let cfg = &self.inner.cfg;
        let window = self.window(node_url);
        let mut window = window.lock().unwrap();
        Window::push_bounded(&mut window.bandwidths, mbps, cfg.history_size);
    }

    /// `(bandwidth_mbps × success_ratio) / (1 + latency_ms × 0.1)`, from
    /// window means. Zero until a latency sample exists.
    pub fn score(&self, node_url: &str) -> f64 {
        let window = self.window(node_url);
        let window = window.lock().unwrap();
        window.score(&self.inner.cfg)
    }

    /// A node is healthy iff its last successful probe is within the TTL
    /// and the mean of its last five success observations exceeds 0.5.
    pub fn is_healthy(&self, node_url: &str) -> bool {
        let window = self.window(node_url);
        let window = window.lock().unwrap();
        window.healthy(&self.inner.cfg)
    }

    /// Currently healthy nodes, in the order they were registered.
    pub fn healthy_nodes(&self) -> Vec<String> {
        let nodes = self.inner.nodes.lock().unwrap().clone();
        nodes
            .into_iter()
            .filter(|node| self.is_healthy(node))
            .collect()
    }

    /// Per-node window snapshots for status reporting.
    pub fn stats(&self) -> Vec<NodeStats> {
        let nodes = self.inner.nodes.lock().unwrap().clone();
        nodes
            .iter()
            .map(|node_url| {
                let window = self.window(node_url);
                let window = window.lock().unwrap();
                let cfg = &self.inner.cfg;
                NodeStats {
                    node_url: node_url.clone(),
                    latency_ms: mean(&window.latencies),
                    bandwidth_mbps: mean(&window.bandwidths),
                    success_rate: mean(&window.successes).unwrap_or(0.0),
                    score: window.score(cfg),
                    healthy: window.healthy(cfg),
                    samples: window.latencies.len(),
                }
            })
            .collect()
    }
}

/// Ticker task: ping every node in parallel each interval. Probe failures
/// only ever move scores; they are never fatal and never retried here.
async fn ping_loop(probe: NodeProbe, nodes: Vec<String>, cancel: CancellationToken) {
    let interval = probe.inner.cfg.ping_interval;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let mut pings = Vec::with_capacity(nodes.len());
        for node in &nodes {
            pings.push(ping_node(&probe, node));
        }
        futures::future::join_all(pings).await;
    }
}

async fn ping_node(probe: &NodeProbe, node_url: &str) {
    let started = Instant::now();
    let response = probe
        .inner
        .http
        .head(format!("{node_url}/ping"))
        .timeout(probe.inner.cfg.ping_timeout)
        .send()
        .await;

    match response {
        Ok(response) if response.status().is_success() => {
            let latency_ms = started.elapsed().as_secs_f64() * 1e3;
            probe.record_success(node_url, latency_ms);
            tracing::trace!(node_url, latency_ms, "ping ok");
        }
        Ok(response) => {
            probe.record_failure(node_url);
            tracing::debug!(node_url, status = response.status().as_u16(), "ping failed");
        }
        Err(err) => {
            probe.record_failure(node_url);
            tracing::debug!(node_url, %err, "ping failed");
        }
    }
}
