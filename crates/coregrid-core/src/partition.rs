//! Partition definitions.

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::config::{ConfigError, ConfigResult, PartitionConfig};
use crate::job::PreemptMode;
use crate::node::Node;

pub type PartitionId = u32;

/// A named set of nodes with a scheduling priority and a sharing limit.
///
/// Jobs refer to partitions by name; the partition never points back at
/// its jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: PartitionId,
    pub name: String,
    pub priority_tier: u16,
    /// Number of rows, i.e. how many jobs may share one core.
    pub max_share: u16,
    pub preempt_mode: PreemptMode,
    pub nodes: Bitmap,
}

impl Partition {
    pub fn from_config(
        id: PartitionId,
        cfg: &PartitionConfig,
        nodes: &[Node],
        default_mode: PreemptMode,
    ) -> ConfigResult<Self> {
        let mut bitmap = Bitmap::new(nodes.len());
        for name in &cfg.nodes {
            let node = nodes
                .iter()
                .find(|n| &n.name == name)
                .ok_or_else(|| ConfigError::Partition(format!("{}: unknown node {name}", cfg.name)))?;
            bitmap.set(node.id as usize);
        }
        Ok(Self {
            id,
            name: cfg.name.clone(),
            priority_tier: cfg.priority_tier,
            max_share: cfg.max_share.max(1),
            preempt_mode: cfg.preempt_mode.unwrap_or(default_mode),
            nodes: bitmap,
        })
    }
}
