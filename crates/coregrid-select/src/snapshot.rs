//! Allocation snapshot: what is currently held on every node.
//!
//! ```text
//!  AllocSnapshot
//!   ├── epoch            bumped on every commit / release / resume
//!   ├── nodes[n]         NodeUsage: memory, GRES unit bitmaps, share counters
//!   └── parts[p]
//!        └── rows[r]     PartitionRow: per-node core bitmaps
//! ```
//!
//! Within one row a core belongs to at most one job. A partition with
//! `max_share > 1` has that many rows, so the same core may appear in
//! several rows. The snapshot holds no job records; cloning it costs
//! O(nodes + rows) regardless of how many jobs are running.

use coregrid_core::{
    Bitmap, JobId, JobResources, Node, NodeId, NodeShareState, PartitionId, PreemptMode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{SelectError, SelectResult};
use crate::inventory::Inventory;

/// GRES units in use for one inventory entry of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GresUsage {
    pub name: String,
    pub type_name: Option<String>,
    pub used: Bitmap,
}

/// Mutable per-node usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUsage {
    /// MiB held by running jobs.
    pub alloc_memory: u64,
    pub gres: Vec<GresUsage>,
    reserved_jobs: u32,
    one_row_jobs: u32,
}

impl NodeUsage {
    fn new(node: &Node) -> Self {
        Self {
            alloc_memory: 0,
            gres: node
                .gres
                .iter()
                .map(|g| GresUsage {
                    name: g.name.clone(),
                    type_name: g.type_name.clone(),
                    used: Bitmap::new(g.count as usize),
                })
                .collect(),
            reserved_jobs: 0,
            one_row_jobs: 0,
        }
    }

    pub fn state(&self) -> NodeShareState {
        if self.reserved_jobs > 0 {
            NodeShareState::Reserved
        } else if self.one_row_jobs > 0 {
            NodeShareState::OneRow
        } else {
            NodeShareState::Available
        }
    }

    pub fn gres_in_use(&self) -> bool {
        self.gres.iter().any(|g| g.used.any())
    }

    /// Units in use for the inventory entry `name` of type `type_name`.
    pub fn gres_used(&self, name: &str, type_name: Option<&str>) -> Option<&Bitmap> {
        self.gres
            .iter()
            .find(|g| g.name == name && g.type_name.as_deref() == type_name)
            .map(|g| &g.used)
    }

    fn gres_used_mut(&mut self, name: &str, type_name: Option<&str>) -> Option<&mut Bitmap> {
        self.gres
            .iter_mut()
            .find(|g| g.name == name && g.type_name.as_deref() == type_name)
            .map(|g| &mut g.used)
    }
}

/// One row of a partition: per-node bitmaps of allocated cores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRow {
    pub cores: Vec<Bitmap>,
}

impl PartitionRow {
    fn new(inv: &Inventory) -> Self {
        Self {
            cores: inv
                .nodes
                .iter()
                .map(|n| Bitmap::new(n.tot_cores() as usize))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cores.iter().all(Bitmap::is_empty)
    }

    /// True when any core of `res` is already held in this row.
    pub fn overlaps(&self, res: &JobResources) -> bool {
        res.node_ids().into_iter().enumerate().any(|(i, node)| {
            let job = res.node_core_bitmap(i);
            self.cores
                .get(node as usize)
                .is_some_and(|row| row.overlaps(&job).unwrap_or(true))
        })
    }

    fn add(&mut self, res: &JobResources) -> SelectResult<()> {
        for (i, node) in res.node_ids().into_iter().enumerate() {
            let job = res.node_core_bitmap(i);
            let row = self
                .cores
                .get_mut(node as usize)
                .ok_or_else(|| SelectError::Conflict(format!("node {node} not in inventory")))?;
            row.or(&job)
                .map_err(|e| SelectError::Conflict(format!("node {node}: {e}")))?;
        }
        Ok(())
    }

    fn remove(&mut self, res: &JobResources) {
        for (i, node) in res.node_ids().into_iter().enumerate() {
            let job = res.node_core_bitmap(i);
            if let Some(row) = self.cores.get_mut(node as usize) {
                let _ = row.and_not(&job);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartUsage {
    pub part: PartitionId,
    pub rows: Vec<PartitionRow>,
}

/// Allocation state of a committed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocState {
    Running,
    /// Cores released; `memory_kept` tells whether memory still counts.
    Suspended { memory_kept: bool },
}

/// A committed allocation as tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub res: JobResources,
    pub part: PartitionId,
    pub row: usize,
    pub state: AllocState,
}

impl JobRecord {
    pub fn job_id(&self) -> JobId {
        self.res.job_id
    }

    pub fn preempt_mode(&self) -> PreemptMode {
        self.res.preempt_mode
    }
}

/// Which parts of an allocation to add or remove. Share counters travel
/// with the cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Cores, memory, GRES and share counters.
    All,
    /// Cores and share counters; memory and GRES stay put.
    CoresOnly,
    /// Cores, share counters and memory; GRES stays put.
    CoresAndMemory,
    /// What a memory-keeping suspension left behind.
    MemoryAndGres,
    /// What a plain suspension left behind.
    GresOnly,
}

impl Scope {
    fn cores(self) -> bool {
        matches!(self, Scope::All | Scope::CoresOnly | Scope::CoresAndMemory)
    }

    fn memory(self) -> bool {
        matches!(self, Scope::All | Scope::CoresAndMemory | Scope::MemoryAndGres)
    }

    fn gres(self) -> bool {
        matches!(self, Scope::All | Scope::MemoryAndGres | Scope::GresOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocSnapshot {
    epoch: u64,
    pub nodes: Vec<NodeUsage>,
    pub parts: Vec<PartUsage>,
}

impl AllocSnapshot {
    pub fn new(inv: &Inventory) -> Self {
        Self {
            epoch: 0,
            nodes: inv.nodes.iter().map(NodeUsage::new).collect(),
            parts: inv
                .partitions
                .iter()
                .map(|p| PartUsage {
                    part: p.id,
                    rows: (0..p.max_share).map(|_| PartitionRow::new(inv)).collect(),
                })
                .collect(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeUsage> {
        self.nodes.get(id as usize)
    }

    pub fn part(&self, id: PartitionId) -> Option<&PartUsage> {
        self.parts.get(id as usize)
    }

    /// First row of `part` that shares no core with `res`.
    pub fn first_free_row(&self, part: PartitionId, res: &JobResources) -> Option<usize> {
        self.part(part)?.rows.iter().position(|row| !row.overlaps(res))
    }

    /// True when any row of any partition holds a core on `node`.
    pub fn any_busy(&self, node: NodeId) -> bool {
        self.parts.iter().any(|p| {
            p.rows
                .iter()
                .any(|r| r.cores.get(node as usize).is_some_and(Bitmap::any))
        })
    }

    /// Union of the cores held on `node` by rows for which `counts` is true.
    pub fn busy_cores(
        &self,
        node: NodeId,
        size: usize,
        mut counts: impl FnMut(PartitionId, usize) -> bool,
    ) -> Bitmap {
        let mut out = Bitmap::new(size);
        for p in &self.parts {
            for (r, row) in p.rows.iter().enumerate() {
                if !counts(p.part, r) {
                    continue;
                }
                if let Some(cores) = row.cores.get(node as usize) {
                    let _ = out.or(cores);
                }
            }
        }
        out
    }

    /// Cores held on `node` by any row.
    pub fn alloc_cores(&self, node: NodeId, size: usize) -> Bitmap {
        self.busy_cores(node, size, |_, _| true)
    }

    /// Record `rec` in the snapshot. Fails without side effects when the
    /// row already holds one of its cores or a GRES unit is taken.
    pub fn add_job(&mut self, rec: &JobRecord, scope: Scope) -> SelectResult<()> {
        let row = self
            .parts
            .get(rec.part as usize)
            .and_then(|p| p.rows.get(rec.row))
            .ok_or_else(|| {
                SelectError::Conflict(format!("partition {} has no row {}", rec.part, rec.row))
            })?;
        if scope.cores() && row.overlaps(&rec.res) {
            return Err(SelectError::Conflict(format!(
                "job {} overlaps row {} of partition {}",
                rec.job_id(),
                rec.row,
                rec.part
            )));
        }
        if scope.gres() {
            for g in &rec.res.gres_alloc {
                let used = self
                    .nodes
                    .get(g.node as usize)
                    .and_then(|n| n.gres_used(&g.name, g.type_name.as_deref()));
                let taken = match used {
                    Some(bits) => g.units.iter().any(|u| bits.test(*u as usize)),
                    None => true,
                };
                if taken {
                    return Err(SelectError::Conflict(format!(
                        "job {}: gres/{} on node {} already in use",
                        rec.job_id(),
                        g.name,
                        g.node
                    )));
                }
            }
        }

        if scope.cores() {
            if let Some(row) = self
                .parts
                .get_mut(rec.part as usize)
                .and_then(|p| p.rows.get_mut(rec.row))
            {
                row.add(&rec.res)?;
            }
        }
        self.apply_node_side(rec, scope, true);
        trace!(job = rec.job_id(), part = rec.part, row = rec.row, ?scope, "snapshot add");
        Ok(())
    }

    /// Remove `rec` from the snapshot.
    pub fn remove_job(&mut self, rec: &JobRecord, scope: Scope) {
        if scope.cores() {
            if let Some(row) = self
                .parts
                .get_mut(rec.part as usize)
                .and_then(|p| p.rows.get_mut(rec.row))
            {
                row.remove(&rec.res);
            }
        }
        self.apply_node_side(rec, scope, false);
        debug!(job = rec.job_id(), part = rec.part, row = rec.row, ?scope, "snapshot remove");
    }

    fn apply_node_side(&mut self, rec: &JobRecord, scope: Scope, add: bool) {
        let res = &rec.res;
        for (i, node) in res.node_ids().into_iter().enumerate() {
            let Some(usage) = self.nodes.get_mut(node as usize) else { continue };
            if scope.cores() {
                match res.node_req {
                    NodeShareState::Reserved => bump(&mut usage.reserved_jobs, add),
                    NodeShareState::OneRow => bump(&mut usage.one_row_jobs, add),
                    NodeShareState::Available => {}
                }
            }
            if scope.memory() {
                let mem = res.memory_allocated.get(i).copied().unwrap_or(0);
                usage.alloc_memory = if add {
                    usage.alloc_memory + mem
                } else {
                    usage.alloc_memory.saturating_sub(mem)
                };
            }
            if !scope.gres() {
                continue;
            }
            for g in res.gres_on(node) {
                if let Some(bits) = usage.gres_used_mut(&g.name, g.type_name.as_deref()) {
                    for u in &g.units {
                        if add {
                            bits.set(*u as usize);
                        } else {
                            bits.clear(*u as usize);
                        }
                    }
                }
            }
        }
    }
}

fn bump(counter: &mut u32, add: bool) {
    *counter = if add { *counter + 1 } else { counter.saturating_sub(1) };
}
