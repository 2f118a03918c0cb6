//! Frozen cluster inventory: nodes and partitions.

use coregrid_core::{Bitmap, ClusterConfig, ConfigResult, Node, NodeId, Partition, PartitionId};

/// Nodes and partitions as registered at startup. Never mutated; shared
/// by reference between the engine and every placement pass.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub nodes: Vec<Node>,
    pub partitions: Vec<Partition>,
}

impl Inventory {
    pub fn new(nodes: Vec<Node>, partitions: Vec<Partition>) -> Self {
        Self { nodes, partitions }
    }

    pub fn from_config(cfg: &ClusterConfig) -> ConfigResult<Self> {
        let nodes = cfg.build_nodes()?;
        let partitions = cfg.build_partitions(&nodes)?;
        Ok(Self { nodes, partitions })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn partition_by_id(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(id as usize)
    }

    pub fn all_nodes(&self) -> Bitmap {
        Bitmap::full(self.nodes.len())
    }

    /// Largest hardware threads-per-core among `nodes`.
    pub fn max_threads(&self, nodes: &[NodeId]) -> u16 {
        nodes
            .iter()
            .filter_map(|id| self.node(*id))
            .map(|n| n.threads_per_core)
            .max()
            .unwrap_or(1)
    }
}
