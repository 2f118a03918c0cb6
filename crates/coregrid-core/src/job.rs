//! Job requests and the resources granted to them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::node::NodeId;

pub type JobId = u32;

/// Node exclusivity requested by a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WholeNode {
    #[default]
    No,
    /// User asked for exclusive nodes.
    User,
    /// Every core and every GRES unit of each node must be free.
    Required,
}

/// How a node may be shared, ordered from most to least permissive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeShareState {
    /// Cores may be shared across partition rows.
    #[default]
    Available,
    /// At most one row may use the node.
    OneRow,
    /// The node belongs to a single job.
    Reserved,
}

/// What happens to a job when something preempts it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptMode {
    #[default]
    Off,
    Requeue,
    Cancel,
    Suspend,
    Gang,
}

impl PreemptMode {
    /// Suspended and gang-scheduled jobs keep their memory and GRES.
    pub fn releases_only_cores(self) -> bool {
        matches!(self, PreemptMode::Suspend | PreemptMode::Gang)
    }
}

/// Node-level task distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeDist {
    #[default]
    Block,
    Cyclic,
    Plane,
    Arbitrary,
}

/// Socket-level distribution modifier (`block:cyclic` and friends).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketDist {
    /// Follow the node-level distribution.
    #[default]
    Inherit,
    Block,
    Cyclic,
}

/// Chooser family used for per-node core selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreFamily {
    Block,
    Cyclic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDist {
    pub node: NodeDist,
    pub socket: SocketDist,
    pub plane_size: u16,
}

impl Default for TaskDist {
    fn default() -> Self {
        Self {
            node: NodeDist::Block,
            socket: SocketDist::Inherit,
            plane_size: 1,
        }
    }
}

impl TaskDist {
    pub fn block() -> Self {
        Self::default()
    }

    pub fn cyclic() -> Self {
        Self {
            node: NodeDist::Cyclic,
            ..Self::default()
        }
    }

    pub fn plane(size: u16) -> Self {
        Self {
            node: NodeDist::Plane,
            socket: SocketDist::Inherit,
            plane_size: size.max(1),
        }
    }

    pub fn core_family(&self) -> CoreFamily {
        match (self.socket, self.node) {
            (SocketDist::Block, _) => CoreFamily::Block,
            (SocketDist::Cyclic, _) => CoreFamily::Cyclic,
            (SocketDist::Inherit, NodeDist::Block | NodeDist::Plane) => CoreFamily::Block,
            (SocketDist::Inherit, NodeDist::Cyclic | NodeDist::Arbitrary) => CoreFamily::Cyclic,
        }
    }

    /// Round-robin chunk used when spreading tasks over nodes.
    pub fn chunk(&self) -> u32 {
        match self.node {
            NodeDist::Plane => u32::from(self.plane_size.max(1)),
            _ => 1,
        }
    }
}

/// One GRES request, e.g. `gpu:2` per node or `gpu:1` per task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GresRequest {
    pub name: String,
    pub type_name: Option<String>,
    pub per_node: u64,
    pub per_task: u64,
    pub per_socket: u64,
    /// Overrides the cluster default when set.
    pub enforce_binding: Option<bool>,
}

impl GresRequest {
    /// Parse `name[:type]:count` as a per-node request.
    pub fn per_node(spec: &str) -> Option<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (name, type_name, count) = match parts.as_slice() {
            [name] => (*name, None, 1),
            [name, count] => (*name, None, count.parse().ok()?),
            [name, ty, count] => (*name, Some(ty.to_string()), count.parse().ok()?),
            _ => return None,
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            type_name,
            per_node: count,
            ..Self::default()
        })
    }
}

/// A pending job's resource request.
///
/// Counts of zero mean "no constraint" unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub job_id: JobId,
    pub partition: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Preferred node count between `min_nodes` and `max_nodes`.
    pub req_nodes: u32,
    pub min_cpus: u32,
    /// MiB per node, or per CPU when `mem_per_cpu` is set.
    pub pn_min_memory: u64,
    pub mem_per_cpu: bool,
    pub pn_min_cpus: u16,
    pub num_tasks: u32,
    pub cpus_per_task: u16,
    pub ntasks_per_node: u16,
    pub ntasks_per_socket: u16,
    pub ntasks_per_core: u16,
    pub ntasks_per_board: u16,
    pub ntasks_per_tres: u16,
    pub sockets_per_node: u16,
    pub cores_per_socket: u16,
    pub threads_per_core: u16,
    pub overcommit: bool,
    pub contiguous: bool,
    pub whole_node: WholeNode,
    /// Cores per node reserved for system use.
    pub core_spec: u16,
    pub share_res: bool,
    pub time_limit_secs: u64,
    pub task_dist: TaskDist,
    pub gres: Vec<GresRequest>,
    pub required_nodes: Option<Bitmap>,
    /// Per-node cores the job must not use.
    pub excluded_cores: BTreeMap<NodeId, Bitmap>,
    /// Mode applied when this job is itself preempted.
    pub preempt_mode: Option<PreemptMode>,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            job_id: 0,
            partition: String::new(),
            min_nodes: 1,
            max_nodes: 0,
            req_nodes: 0,
            min_cpus: 1,
            pn_min_memory: 0,
            mem_per_cpu: false,
            pn_min_cpus: 0,
            num_tasks: 0,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            ntasks_per_socket: 0,
            ntasks_per_core: 0,
            ntasks_per_board: 0,
            ntasks_per_tres: 0,
            sockets_per_node: 0,
            cores_per_socket: 0,
            threads_per_core: 0,
            overcommit: false,
            contiguous: false,
            whole_node: WholeNode::No,
            core_spec: 0,
            share_res: false,
            time_limit_secs: 0,
            task_dist: TaskDist::default(),
            gres: Vec::new(),
            required_nodes: None,
            excluded_cores: BTreeMap::new(),
            preempt_mode: None,
        }
    }
}

impl JobRequest {
    pub fn cpus_per_task(&self) -> u32 {
        u32::from(self.cpus_per_task.max(1))
    }

    /// Share state the job imposes on the nodes it receives.
    pub fn node_req(&self) -> NodeShareState {
        if self.whole_node != WholeNode::No || self.core_spec > 0 {
            NodeShareState::Reserved
        } else if !self.share_res {
            NodeShareState::OneRow
        } else {
            NodeShareState::Available
        }
    }

    /// Upper bound on nodes, `u32::MAX` when unbounded.
    pub fn max_nodes_bound(&self) -> u32 {
        if self.max_nodes == 0 { u32::MAX } else { self.max_nodes.max(self.min_nodes) }
    }

    /// A job asking for no nodes holds nothing but burst-buffer style resources.
    pub fn is_zero_node(&self) -> bool {
        self.min_nodes == 0 && self.max_nodes == 0 && self.num_tasks == 0 && self.min_cpus == 0
    }

    pub fn wants_gres(&self) -> bool {
        self.gres
            .iter()
            .any(|g| g.per_node > 0 || g.per_task > 0 || g.per_socket > 0)
    }
}

/// GRES units granted on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GresAlloc {
    pub node: NodeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub units: Vec<u32>,
}

/// Resources held by a job; the authoritative record of its allocation.
///
/// Per-node vectors are indexed by position in `node_bitmap` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    pub job_id: JobId,
    pub partition: String,
    pub node_bitmap: Bitmap,
    /// Allocated CPUs per selected node, in hardware threads.
    pub cpus: Vec<u32>,
    /// Core count of each selected node, for splitting `core_bitmap`.
    pub node_cores: Vec<u32>,
    /// Concatenated per-node core bitmaps.
    pub core_bitmap: Bitmap,
    /// MiB per selected node.
    pub memory_allocated: Vec<u64>,
    pub tasks: Vec<u32>,
    pub node_req: NodeShareState,
    pub threads_per_core: u16,
    pub whole_node: WholeNode,
    pub gres_alloc: Vec<GresAlloc>,
    pub preempt_mode: PreemptMode,
    pub start_time: u64,
    pub end_time: u64,
}

impl JobResources {
    /// Allocation of a job that asked for no nodes.
    pub fn empty(job_id: JobId, partition: &str, node_count: usize) -> Self {
        Self {
            job_id,
            partition: partition.to_string(),
            node_bitmap: Bitmap::new(node_count),
            cpus: Vec::new(),
            node_cores: Vec::new(),
            core_bitmap: Bitmap::new(0),
            memory_allocated: Vec::new(),
            tasks: Vec::new(),
            node_req: NodeShareState::Available,
            threads_per_core: 1,
            whole_node: WholeNode::No,
            gres_alloc: Vec::new(),
            preempt_mode: PreemptMode::Off,
            start_time: 0,
            end_time: 0,
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.node_bitmap.iter_set().map(|i| i as NodeId).collect()
    }

    pub fn node_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Position of `node` within the per-node vectors.
    pub fn node_index(&self, node: NodeId) -> Option<usize> {
        if !self.node_bitmap.test(node as usize) {
            return None;
        }
        Some(self.node_bitmap.count_range(0, node as usize))
    }

    fn core_offset(&self, index: usize) -> usize {
        self.node_cores[..index].iter().map(|c| *c as usize).sum()
    }

    /// Core bitmap of the `index`th selected node.
    pub fn node_core_bitmap(&self, index: usize) -> Bitmap {
        let lo = self.core_offset(index);
        let hi = lo + self.node_cores.get(index).copied().unwrap_or(0) as usize;
        self.core_bitmap.slice(lo, hi)
    }

    pub fn total_cpus(&self) -> u64 {
        self.cpus.iter().map(|c| u64::from(*c)).sum()
    }

    pub fn total_tasks(&self) -> u64 {
        self.tasks.iter().map(|t| u64::from(*t)).sum()
    }

    pub fn gres_on(&self, node: NodeId) -> impl Iterator<Item = &GresAlloc> {
        self.gres_alloc.iter().filter(move |g| g.node == node)
    }
}
