/// Lifecycle of a registered storage node, as judged by the coordinator's
/// health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Down,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Healthy => "healthy",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(NodeStatus::Healthy),
            "degraded" => Some(NodeStatus::Degraded),
            "down" => Some(NodeStatus::Down),
            _ => None,
        }
    }
}

/// A registered storage node and its last-observed vitals.
/// `last_heartbeat` is the store's timestamp rendering and is informational
/// on the wire; liveness decisions happen inside the coordinator.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StorageNode {
    pub node_url: String,
    pub node_id: String,
    pub last_heartbeat: String,
    pub disk_usage_percent: f64,
    pub chunk_count: i64,
    pub status: NodeStatus,
    #[serde(default)]
    pub version: Option<String>,
}
