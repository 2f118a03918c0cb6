//! Per-node availability: what a node can offer one job, given the cores
//! that are free in the current view.

use coregrid_core::{Bitmap, JobRequest, Node, NodeId, SelectConfig, WholeNode};
use tracing::trace;

use crate::gres::{self, GresFit};
use crate::snapshot::NodeUsage;

/// Resources one node can contribute to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailRes {
    pub node: NodeId,
    /// Free cores the job may use.
    pub free_cores: Bitmap,
    /// Free cores per socket.
    pub sock_cores: Vec<u32>,
    /// CPUs usable per socket after per-socket task caps.
    pub sock_cpus: Vec<u32>,
    /// Usable threads per core.
    pub vpus: u16,
    pub avail_cpus: u32,
    pub max_tasks: u32,
    /// Fewest CPUs the job may take on this node.
    pub min_cpus: u32,
    pub gres: GresFit,
    /// MiB still free on the node.
    pub mem_free: u64,
    /// The job takes every core of the node.
    pub whole: bool,
}

/// Threads per core a job may use on `node`.
pub fn vpus(node: &Node, req: &JobRequest, one_task_per_core: bool) -> u16 {
    let mut threads = node.threads_per_core.max(1);
    let ntasks_per_core = if req.ntasks_per_core > 0 {
        req.ntasks_per_core
    } else if one_task_per_core {
        1
    } else {
        0
    };
    if ntasks_per_core > 0 {
        threads = threads.min(ntasks_per_core.saturating_mul(req.cpus_per_task.max(1)));
    }
    if req.threads_per_core > 0 {
        threads = threads.min(req.threads_per_core);
    }
    threads.max(1)
}

/// Whether the job must hold the node exclusively.
pub fn takes_whole_node(req: &JobRequest) -> bool {
    req.whole_node != WholeNode::No || req.core_spec > 0
}

/// Compute what `node` can give `req` when `busy` cores are held by
/// others. Returns `None` when the node cannot host even the minimum.
pub fn node_avail(
    node: &Node,
    usage: Option<&NodeUsage>,
    busy: &Bitmap,
    req: &JobRequest,
    cfg: &SelectConfig,
    mem_free: u64,
) -> Option<AvailRes> {
    let whole = takes_whole_node(req);
    let cpt = req.cpus_per_task();
    let mut free = node.schedulable_cores();

    if whole && free.overlaps(busy).unwrap_or(true) {
        trace!(node = %node.name, "whole node requested but cores are busy");
        return None;
    }
    free.and_not(busy).ok()?;
    if let Some(excluded) = req.excluded_cores.get(&node.id) {
        free.and_not(excluded).ok()?;
    }
    if req.core_spec > 0 {
        let spec = node.spec_core_mask(node.core_spec_count.saturating_add(req.core_spec));
        free.and_not(&spec).ok()?;
    }

    let sockets = usize::from(node.sockets);
    let usable: Vec<bool> = (0..node.sockets)
        .map(|s| {
            let (lo, hi) = node.socket_range(s);
            free.count_range(lo, hi) > 0
        })
        .collect();
    let fit = gres::node_fit(node, usage, req, cfg.enforce_binding, &usable)?;

    let mut sock_cores = vec![0u32; sockets];
    for s in 0..node.sockets {
        let (lo, hi) = node.socket_range(s);
        let mut count = free.count_range(lo, hi) as u32;
        let too_few = req.cores_per_socket > 0 && count < u32::from(req.cores_per_socket);
        if !whole && (!fit.socket_allowed(s) || too_few) {
            free.clear_range(lo, hi);
            count = 0;
        }
        sock_cores[usize::from(s)] = count;
    }
    let used_sockets = sock_cores.iter().filter(|c| **c > 0).count();
    if used_sockets < usize::from(req.sockets_per_node) {
        trace!(node = %node.name, used_sockets, "too few usable sockets");
        return None;
    }

    let vpus = vpus(node, req, cfg.one_task_per_core);
    let mut sock_cpus: Vec<u32> = sock_cores.iter().map(|c| c * u32::from(vpus)).collect();
    if req.ntasks_per_socket > 0 && !req.overcommit && !whole {
        let cap = u32::from(req.ntasks_per_socket) * cpt;
        for cpus in &mut sock_cpus {
            *cpus = (*cpus).min(cap);
        }
    }

    let mut avail: u32 = if req.ntasks_per_board > 0 && !req.overcommit && !whole {
        let cap = u32::from(req.ntasks_per_board) * cpt;
        let spb = usize::from(node.sockets_per_board().max(1));
        sock_cpus.chunks(spb).map(|b| b.iter().sum::<u32>().min(cap)).sum()
    } else {
        sock_cpus.iter().sum()
    };

    if !whole {
        if req.ntasks_per_node > 0 && !req.overcommit {
            avail = avail.min(u32::from(req.ntasks_per_node) * cpt);
        }
        if cfg.cr_memory && (req.mem_per_cpu || req.pn_min_memory == 0) {
            let per_cpu = if req.pn_min_memory > 0 { req.pn_min_memory } else { cfg.def_mem_per_cpu };
            if per_cpu > 0 {
                avail = avail.min((mem_free / per_cpu).min(u64::from(u32::MAX)) as u32);
            }
        }
        if let Some(limit) = fit.per_task_limit {
            avail = avail.min(limit.saturating_mul(cpt));
        }
    }

    let max_tasks = avail / cpt;
    if !whole && cpt > 1 {
        avail = max_tasks * cpt;
    }

    let mut min_cpus = fit.min_cpus.max(cpt);
    if req.ntasks_per_node > 0 && !req.overcommit {
        min_cpus = min_cpus.max(u32::from(req.ntasks_per_node) * cpt);
    }
    if whole {
        min_cpus = avail;
    }
    if avail == 0 || avail < min_cpus {
        trace!(node = %node.name, avail, min_cpus, "node cannot meet per-node minimum");
        return None;
    }

    Some(AvailRes {
        node: node.id,
        free_cores: free,
        sock_cores,
        sock_cpus,
        vpus,
        avail_cpus: avail,
        max_tasks,
        min_cpus,
        gres: fit,
        mem_free,
        whole,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coregrid_core::NodeConfig;

    fn node(sockets: u16, cores: u16, threads: u16) -> Node {
        let cfg = NodeConfig {
            name: "n0".to_string(),
            boards: 1,
            sockets,
            cores_per_socket: cores,
            threads_per_core: threads,
            real_memory: 8192,
            mem_spec_limit: 0,
            core_spec_count: 0,
            gres: Vec::new(),
        };
        Node::from_config(0, &cfg).unwrap()
    }

    fn cfg() -> SelectConfig {
        SelectConfig::default()
    }

    #[test]
    fn vpus_follow_task_and_thread_limits() {
        let n = node(2, 4, 2);
        let mut req = JobRequest::default();
        assert_eq!(vpus(&n, &req, false), 2);
        assert_eq!(vpus(&n, &req, true), 1);
        req.ntasks_per_core = 1;
        req.cpus_per_task = 2;
        assert_eq!(vpus(&n, &req, false), 2);
        req.threads_per_core = 1;
        assert_eq!(vpus(&n, &req, false), 1);
    }

    #[test]
    fn busy_cores_reduce_availability() {
        let n = node(2, 4, 1);
        let busy = Bitmap::from_indices(8, [0, 1, 2]).unwrap();
        let a = node_avail(&n, None, &busy, &JobRequest::default(), &cfg(), 8192).unwrap();
        assert_eq!(a.sock_cores, vec![1, 4]);
        assert_eq!(a.avail_cpus, 5);
        assert_eq!(a.max_tasks, 5);
    }

    #[test]
    fn ntasks_per_socket_caps_each_socket() {
        let n = node(2, 4, 1);
        let mut req = JobRequest::default();
        req.ntasks_per_socket = 2;
        let a = node_avail(&n, None, &Bitmap::new(8), &req, &cfg(), 8192).unwrap();
        assert_eq!(a.sock_cpus, vec![2, 2]);
        assert_eq!(a.avail_cpus, 4);
    }

    #[test]
    fn cpus_round_down_to_whole_tasks() {
        let n = node(1, 5, 1);
        let mut req = JobRequest::default();
        req.cpus_per_task = 2;
        let a = node_avail(&n, None, &Bitmap::new(5), &req, &cfg(), 8192).unwrap();
        assert_eq!(a.avail_cpus, 4);
        assert_eq!(a.max_tasks, 2);
    }

    #[test]
    fn whole_node_needs_every_core_free() {
        let n = node(1, 4, 2);
        let mut req = JobRequest::default();
        req.whole_node = WholeNode::User;
        assert!(node_avail(&n, None, &Bitmap::from_indices(4, [3]).unwrap(), &req, &cfg(), 8192).is_none());
        let a = node_avail(&n, None, &Bitmap::new(4), &req, &cfg(), 8192).unwrap();
        assert!(a.whole);
        assert_eq!(a.avail_cpus, 8);
        assert_eq!(a.min_cpus, 8);
    }

    #[test]
    fn per_cpu_memory_caps_cpus() {
        let n = node(1, 8, 1);
        let mut req = JobRequest::default();
        req.pn_min_memory = 1000;
        req.mem_per_cpu = true;
        let a = node_avail(&n, None, &Bitmap::new(8), &req, &cfg(), 3500).unwrap();
        assert_eq!(a.avail_cpus, 3);
    }

    #[test]
    fn cores_per_socket_minimum_drops_thin_sockets() {
        let n = node(2, 4, 1);
        let mut req = JobRequest::default();
        req.cores_per_socket = 3;
        let busy = Bitmap::from_indices(8, [0, 1]).unwrap();
        let a = node_avail(&n, None, &busy, &req, &cfg(), 8192).unwrap();
        assert_eq!(a.sock_cores, vec![0, 4]);
        req.sockets_per_node = 2;
        assert!(node_avail(&n, None, &busy, &req, &cfg(), 8192).is_none());
    }
}
