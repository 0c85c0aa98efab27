//! Node health monitoring: forces nodes without a recent heartbeat to
//! `down`, and restores down nodes whose liveness probe answers again.

use metadata::Store;
use models::NodeStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the monitor sweeps.
    pub probe_interval: Duration,
    /// Heartbeats older than this mark a node down.
    pub heartbeat_ttl: Duration,
    /// Deadline of each direct liveness probe.
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Run the monitor until `cancel` fires.
pub async fn run(
    store: Arc<Store>,
    http: reqwest::Client,
    cfg: MonitorConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(cfg.probe_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        sweep(&store, &http, &cfg).await;
    }
    tracing::info!("health monitor stopped");
}

/// One monitoring pass, separated out so tests can drive it directly.
pub async fn sweep(store: &Store, http: &reqwest::Client, cfg: &MonitorConfig) {
    match store.mark_stale_nodes_down(cfg.heartbeat_ttl) {
        Ok(marked) if !marked.is_empty() => {
            tracing::warn!(nodes = ?marked, "marked nodes down for missing heartbeats");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::error!(%err, "failed to sweep stale nodes");
            return;
        }
    }

    // Give down nodes a chance to come back: a responsive ping restores
    // the node without waiting on its own heartbeat loop.
    let down = match store.nodes_with_status(NodeStatus::Down) {
        Ok(nodes) => nodes,
        Err(err) => {
            tracing::error!(%err, "failed to list down nodes");
            return;
        }
    };
    for node in down {
        let alive = http
            .head(format!("{}/ping", node.node_url))
            .timeout(cfg.probe_timeout)
            .send()
            .await
            .map(|response| response.status().is_success())
            .unwrap_or(false);
        if alive {
            tracing::info!(node_url = node.node_url, "down node answered probe, restoring");
            if let Err(err) = store.touch_node(&node.node_url) {
                tracing::error!(%err, node_url = node.node_url, "failed to restore node");
            }
        }
    }
}
