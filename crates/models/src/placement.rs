use crate::{CommitRequest, FragmentSpec, RedundancyMode};

/// Where a chunk's bytes physically live: full copies on a node set, or
/// one erasure fragment per node. Carrying this as a tagged variant keeps
/// the mode out of function signatures downstream.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Placement {
    Replicated { nodes: Vec<String> },
    Erasure { fragments: Vec<FragmentSpec> },
}

impl Placement {
    pub fn mode(&self) -> RedundancyMode {
        match self {
            Placement::Replicated { .. } => RedundancyMode::Replication,
            Placement::Erasure { .. } => RedundancyMode::ErasureCoding,
        }
    }

    /// The node set participating in this placement, in proposal order.
    pub fn node_urls(&self) -> Vec<&str> {
        match self {
            Placement::Replicated { nodes } => nodes.iter().map(String::as_str).collect(),
            Placement::Erasure { fragments } => {
                fragments.iter().map(|f| f.node_url.as_str()).collect()
            }
        }
    }
}

impl TryFrom<&CommitRequest> for Placement {
    type Error = &'static str;

    fn try_from(req: &CommitRequest) -> Result<Self, Self::Error> {
        match req.redundancy_mode {
            RedundancyMode::Replication => {
                if req.node_urls.is_empty() {
                    return Err("replicated commit requires at least one node");
                }
                Ok(Placement::Replicated {
                    nodes: req.node_urls.clone(),
                })
            }
            RedundancyMode::ErasureCoding => {
                let fragments = req
                    .fragments_metadata
                    .clone()
                    .filter(|f| !f.is_empty())
                    .ok_or("erasure commit requires fragment metadata")?;
                Ok(Placement::Erasure { fragments })
            }
        }
    }
}
