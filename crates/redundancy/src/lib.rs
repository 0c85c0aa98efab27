//! Adaptive redundancy selection.
//!
//! Hot videos are replicated in full for cheap reads; cold videos are
//! erasure-coded for cheap storage. The switch point is a view-count
//! threshold, with per-video manual overrides taking precedence.

use models::RedundancyMode;
use std::collections::HashMap;
use std::sync::Mutex;

/// Direction of a video's recent view counts, as tagged by whatever
/// analytics feed the migration advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewTrend {
    Increasing,
    Stable,
    Decreasing,
}

/// Tunables of the redundancy policy.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PolicyConfig {
    /// View count above which a video is considered hot.
    pub popularity_threshold: u64,
    /// Full copies stored per chunk in replication mode.
    pub replication_factor: u32,
    /// Data fragments per chunk in erasure mode.
    pub data_shards: u32,
    /// Parity fragments per chunk in erasure mode.
    pub parity_shards: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            popularity_threshold: 1000,
            replication_factor: 3,
            data_shards: 3,
            parity_shards: 2,
        }
    }
}

/// The concrete requirements implied by a redundancy decision.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ModeConfig {
    pub mode: RedundancyMode,
    /// Distinct storage nodes a chunk placement needs.
    pub required_nodes: u32,
    /// Node losses the chunk survives.
    pub tolerable_failures: u32,
    /// Physical bytes stored per logical byte.
    pub storage_overhead_factor: f64,
}

impl ModeConfig {
    /// Total physical bytes a chunk of `chunk_size_bytes` occupies.
    pub fn storage_cost(&self, chunk_size_bytes: u64) -> u64 {
        (chunk_size_bytes as f64 * self.storage_overhead_factor) as u64
    }
}

/// Storage accounting of the two modes side by side.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EfficiencySummary {
    pub replication_overhead_factor: f64,
    pub erasure_overhead_factor: f64,
    pub storage_savings_percent: f64,
}

/// Chooses a redundancy mode per video and advises on migrations.
pub struct Policy {
    cfg: PolicyConfig,
    overrides: Mutex<HashMap<String, RedundancyMode>>,
}

impl Policy {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self {
            cfg,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> PolicyConfig {
        self.cfg
    }

    /// Decide the redundancy mode for a video.
    ///
    /// A `manual_override` wins and is remembered for subsequent calls; a
    /// previously stored override wins next; otherwise the popularity
    /// threshold decides.
    pub fn decide(
        &self,
        video_id: &str,
        view_count: u64,
        manual_override: Option<RedundancyMode>,
    ) -> (RedundancyMode, ModeConfig) {
        let mode = if let Some(mode) = manual_override {
            self.set_override(video_id, mode);
            mode
        } else if let Some(mode) = self.override_for(video_id) {
            mode
        } else if view_count > self.cfg.popularity_threshold {
            tracing::debug!(video_id, view_count, "hot video, replicating");
            RedundancyMode::Replication
        } else {
            tracing::debug!(video_id, view_count, "cold video, erasure coding");
            RedundancyMode::ErasureCoding
        };

        (mode, self.mode_config(mode))
    }

    pub fn set_override(&self, video_id: &str, mode: RedundancyMode) {
        self.overrides
            .lock()
            .unwrap()
            .insert(video_id.to_string(), mode);
        tracing::info!(video_id, %mode, "manual redundancy override set");
    }

    pub fn clear_override(&self, video_id: &str) {
        if self.overrides.lock().unwrap().remove(video_id).is_some() {
            tracing::info!(video_id, "manual redundancy override cleared");
        }
    }

    pub fn override_for(&self, video_id: &str) -> Option<RedundancyMode> {
        self.overrides.lock().unwrap().get(video_id).copied()
    }

    /// The node and storage requirements of `mode` under this policy.
    pub fn mode_config(&self, mode: RedundancyMode) -> ModeConfig {
        match mode {
            RedundancyMode::Replication => ModeConfig {
                mode,
                required_nodes: self.cfg.replication_factor,
                tolerable_failures: self.cfg.replication_factor - 1,
                storage_overhead_factor: self.cfg.replication_factor as f64,
            },
            RedundancyMode::ErasureCoding => {
                let total = self.cfg.data_shards + self.cfg.parity_shards;
                ModeConfig {
                    mode,
                    required_nodes: total,
                    tolerable_failures: self.cfg.parity_shards,
                    storage_overhead_factor: total as f64 / self.cfg.data_shards as f64,
                }
            }
        }
    }

    /// Recommend a mode migration based on where the view counts are
    /// heading, or `None` when the current mode still fits. This only
    /// returns a recommendation; re-encoding is a separate concern.
    pub fn recommend_migration(
        &self,
        video_id: &str,
        current_mode: RedundancyMode,
        current_views: u64,
        trend: ViewTrend,
    ) -> Option<RedundancyMode> {
        let threshold = self.cfg.popularity_threshold;

        // A cold-encoded video getting popular should replicate.
        if current_mode == RedundancyMode::ErasureCoding
            && current_views > threshold
            && trend == ViewTrend::Increasing
        {
            tracing::info!(video_id, current_views, "recommending migration to replication");
            return Some(RedundancyMode::Replication);
        }

        // A replicated video going cold (below half the threshold) should
        // free up the extra copies.
        if current_mode == RedundancyMode::Replication
            && current_views < threshold / 2
            && trend == ViewTrend::Decreasing
        {
            tracing::info!(video_id, current_views, "recommending migration to erasure coding");
            return Some(RedundancyMode::ErasureCoding);
        }

        None
    }

    pub fn storage_efficiency(&self) -> EfficiencySummary {
        let replication = self.mode_config(RedundancyMode::Replication).storage_overhead_factor;
        let erasure = self.mode_config(RedundancyMode::ErasureCoding).storage_overhead_factor;
        EfficiencySummary {
            replication_overhead_factor: replication,
            erasure_overhead_factor: erasure,
            storage_savings_percent: (replication - erasure) / replication * 100.0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy() -> Policy {
        Policy::new(PolicyConfig::default())
    }

    #[test]
    fn popularity_threshold_selects_mode() {
        let policy = policy();

        let (mode, config) = policy.decide("v1", 1500, None);
        assert_eq!(mode, RedundancyMode::Replication);
        assert_eq!(config.required_nodes, 3);
        assert_eq!(config.tolerable_failures, 2);

        let (mode, config) = policy.decide("v2", 500, None);
        assert_eq!(mode, RedundancyMode::ErasureCoding);
        assert_eq!(config.required_nodes, 5);
        assert_eq!(config.tolerable_failures, 2);

        // Exactly at the threshold is still cold.
        let (mode, _) = policy.decide("v3", 1000, None);
        assert_eq!(mode, RedundancyMode::ErasureCoding);
    }

    #[test]
    fn manual_override_wins_until_cleared() {
        let policy = policy();

        let (mode, _) = policy.decide("v1", 5000, Some(RedundancyMode::ErasureCoding));
        assert_eq!(mode, RedundancyMode::ErasureCoding);

        // The override is remembered on subsequent decisions.
        let (mode, _) = policy.decide("v1", 5000, None);
        assert_eq!(mode, RedundancyMode::ErasureCoding);

        policy.clear_override("v1");
        let (mode, _) = policy.decide("v1", 5000, None);
        assert_eq!(mode, RedundancyMode::Replication);
    }

    #[test]
    fn migration_advice() {
        let policy = policy();

        assert_eq!(
            policy.recommend_migration(
                "v",
                RedundancyMode::ErasureCoding,
                1500,
                ViewTrend::Increasing
            ),
            Some(RedundancyMode::Replication)
        );
        assert_eq!(
            policy.recommend_migration(
                "v",
                RedundancyMode::Replication,
                400,
                ViewTrend::Decreasing
            ),
            Some(RedundancyMode::ErasureCoding)
        );
        // Views under half the threshold but not trending down: hold.
        assert_eq!(
            policy.recommend_migration("v", RedundancyMode::Replication, 400, ViewTrend::Stable),
            None
        );
        // Popular but already replicated: hold.
        assert_eq!(
            policy.recommend_migration(
                "v",
                RedundancyMode::Replication,
                5000,
                ViewTrend::Increasing
            ),
            None
        );
        // Cold and erasure-coded: hold.
        assert_eq!(
            policy.recommend_migration(
                "v",
                RedundancyMode::ErasureCoding,
                100,
                ViewTrend::Decreasing
            ),
            None
        );
    }

    #[test]
    fn storage_costs() {
        let policy = policy();
        let chunk = 2 * 1024 * 1024;

        let replicated = policy.mode_config(RedundancyMode::Replication);
        assert_eq!(replicated.storage_cost(chunk), 3 * chunk);

        let erasure = policy.mode_config(RedundancyMode::ErasureCoding);
        assert_eq!(erasure.storage_cost(chunk), chunk * 5 / 3);

        let summary = policy.storage_efficiency();
        assert!((summary.storage_savings_percent - 44.44).abs() < 0.01);
    }
}
