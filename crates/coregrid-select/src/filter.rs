//! Candidate filter: drop nodes that cannot host the job at all.

use coregrid_core::{Bitmap, JobRequest, NodeShareState, SelectConfig, WholeNode};
use tracing::{debug, trace};

use crate::error::{SelectError, SelectResult};
use crate::gres;
use crate::inventory::Inventory;
use crate::snapshot::AllocSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Share,
    Memory,
    WholeNode,
    Gres,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub nodes: Bitmap,
    pub dropped_gres: u32,
    pub dropped_memory: u32,
    pub dropped_other: u32,
}

impl FilterOutcome {
    fn dropped(&self) -> u32 {
        self.dropped_gres + self.dropped_memory + self.dropped_other
    }
}

/// Per-node memory floor (MiB) for `req`. Zero when memory is not tracked
/// or the job asks for none.
pub fn memory_floor(req: &JobRequest, cfg: &SelectConfig) -> u64 {
    if !cfg.cr_memory {
        return 0;
    }
    let multiplier = u64::from(
        req.ntasks_per_node
            .max(req.pn_min_cpus)
            .max(req.cpus_per_task)
            .max(1),
    );
    match (req.pn_min_memory, req.mem_per_cpu) {
        (0, _) => cfg.def_mem_per_cpu * multiplier,
        (mem, true) => mem * multiplier,
        (mem, false) => mem,
    }
}

/// Filter `candidates` down to nodes that could host `req`. With
/// `ignore_usage` existing allocations are disregarded and memory is
/// checked against total usable memory.
pub fn filter_candidates(
    inv: &Inventory,
    snap: &AllocSnapshot,
    cfg: &SelectConfig,
    req: &JobRequest,
    candidates: &Bitmap,
    ignore_usage: bool,
) -> SelectResult<FilterOutcome> {
    let mut out = FilterOutcome {
        nodes: Bitmap::new(candidates.size()),
        dropped_gres: 0,
        dropped_memory: 0,
        dropped_other: 0,
    };
    let mem_floor = memory_floor(req, cfg);
    let job_req = req.node_req();

    for idx in candidates.iter_set() {
        let Some(node) = inv.nodes.get(idx) else { continue };
        let usage = if ignore_usage { None } else { snap.nodes.get(idx) };
        let id = node.id;

        let reason = (|| {
            if let Some(u) = usage {
                match u.state() {
                    NodeShareState::Reserved => return Some(DropReason::Share),
                    NodeShareState::OneRow if job_req != NodeShareState::Available => {
                        return Some(DropReason::Share);
                    }
                    _ => {}
                }
                if job_req == NodeShareState::Reserved && (snap.any_busy(id) || u.alloc_memory > 0) {
                    return Some(DropReason::Share);
                }
            }
            let alloc = usage.map_or(0, |u| u.alloc_memory);
            if mem_floor > node.usable_memory().saturating_sub(alloc) {
                return Some(DropReason::Memory);
            }
            if req.whole_node == WholeNode::Required {
                if usage.is_some_and(|u| u.gres_in_use()) {
                    return Some(DropReason::Gres);
                }
                if req.excluded_cores.get(&id).is_some_and(Bitmap::any) {
                    return Some(DropReason::WholeNode);
                }
            }
            let sockets = vec![true; usize::from(node.sockets)];
            if gres::node_fit(node, usage, req, cfg.enforce_binding, &sockets).is_none() {
                return Some(DropReason::Gres);
            }
            None
        })();

        let Some(reason) = reason else {
            out.nodes.set(idx);
            continue;
        };
        trace!(job = req.job_id, node = %node.name, ?reason, "candidate dropped");
        match reason {
            DropReason::Gres => out.dropped_gres += 1,
            DropReason::Memory => out.dropped_memory += 1,
            DropReason::Share | DropReason::WholeNode => out.dropped_other += 1,
        }

        if req.required_nodes.as_ref().is_some_and(|r| r.test(idx)) {
            return Err(match reason {
                DropReason::Gres => SelectError::GresInfeasible(format!(
                    "required node {} cannot satisfy the GRES request",
                    node.name
                )),
                DropReason::Memory if ignore_usage => SelectError::NodeMemoryExceeded(node.name.clone()),
                _ => SelectError::NoResources(format!("required node {} is unavailable", node.name)),
            });
        }
    }

    if out.nodes.is_empty() && out.dropped() > 0 {
        debug!(
            job = req.job_id,
            gres = out.dropped_gres,
            memory = out.dropped_memory,
            other = out.dropped_other,
            "every candidate dropped"
        );
        if out.dropped_gres == out.dropped() {
            return Err(SelectError::GresInfeasible(format!(
                "no candidate node can satisfy job {}",
                req.job_id
            )));
        }
        if ignore_usage && out.dropped_memory == out.dropped() {
            return Err(SelectError::NodeMemoryExceeded(format!(
                "no node has {mem_floor} MiB usable"
            )));
        }
    }
    Ok(out)
}
