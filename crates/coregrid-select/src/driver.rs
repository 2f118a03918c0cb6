//! Placement driver: run the fit pipeline under progressively wider views
//! of which existing allocations may be disregarded.
//!
//! ```text
//!  step 0  ignore every allocation           feasibility only
//!  step 1  every row of every partition busy
//!  step 2  only higher-tier rows busy        (plus non-preemptable
//!                                             lower tiers by partition)
//!  step 3  step 2 + same-tier rows           then fold in lower tiers
//!                                             while the fit still holds
//!  step 4  step 3, own partition one row at a time
//! ```
//!
//! One fit is: candidate filter → per-node availability → node selection →
//! task distribution → core choice → GRES units → memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use coregrid_core::{
    BackfillConfig, Bitmap, ClusterConfig, GresAlloc, JobRequest, JobResources, Partition,
    PartitionId, PreemptConfig, PreemptMode, SelectConfig,
};
use tracing::{debug, trace};

use crate::avail::{AvailRes, node_avail};
use crate::chooser;
use crate::dist::distribute;
use crate::error::{SelectError, SelectResult};
use crate::eval::eval_nodes;
use crate::filter::filter_candidates;
use crate::gres;
use crate::inventory::Inventory;
use crate::snapshot::AllocSnapshot;

// ── Cancellation ───────────────────────────────────────────────

/// Cooperative cancel flag, checked between driver steps and between
/// will-run iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> SelectResult<()> {
        if self.is_cancelled() {
            Err(SelectError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ── Configuration ──────────────────────────────────────────────

/// The parts of the cluster configuration placement consults.
#[derive(Debug, Clone, Default)]
pub struct PlacementConfig {
    pub select: SelectConfig,
    pub preempt: PreemptConfig,
    pub backfill: BackfillConfig,
}

impl From<&ClusterConfig> for PlacementConfig {
    fn from(cfg: &ClusterConfig) -> Self {
        Self {
            select: cfg.select.clone(),
            preempt: cfg.preempt.clone(),
            backfill: cfg.backfill.clone(),
        }
    }
}

// ── Views ──────────────────────────────────────────────────────

/// Which existing allocations count against a fit.
#[derive(Clone, Copy)]
pub enum View<'a> {
    IgnoreUsage,
    /// Rows for which the predicate holds are busy.
    Rows(&'a dyn Fn(PartitionId, usize) -> bool),
}

/// Failures after which a wider view may still succeed.
pub fn retryable(err: &SelectError) -> bool {
    matches!(err, SelectError::NoResources(_) | SelectError::HeldNoPriority(_))
}

/// Memory (MiB) a node grants for `cpus` CPUs.
pub fn node_memory(req: &JobRequest, cfg: &SelectConfig, cpus: u32) -> u64 {
    if !cfg.cr_memory {
        return 0;
    }
    match (req.pn_min_memory, req.mem_per_cpu) {
        (0, _) => cfg.def_mem_per_cpu * u64::from(cpus),
        (mem, true) => mem * u64::from(cpus),
        (mem, false) => mem,
    }
}

// ── Driver ─────────────────────────────────────────────────────

pub struct Driver<'a> {
    pub inv: &'a Inventory,
    pub cfg: &'a PlacementConfig,
    pub cancel: &'a CancelToken,
}

impl<'a> Driver<'a> {
    pub fn new(inv: &'a Inventory, cfg: &'a PlacementConfig, cancel: &'a CancelToken) -> Self {
        Self { inv, cfg, cancel }
    }

    fn tier(&self, part: PartitionId) -> Option<(u16, PreemptMode)> {
        self.inv
            .partition_by_id(part)
            .map(|p| (p.priority_tier, p.preempt_mode))
    }

    /// Step 0: could the job ever fit on an empty cluster?
    pub fn feasible(&self, snap: &AllocSnapshot, req: &JobRequest, part: &Partition) -> SelectResult<JobResources> {
        self.try_fit(snap, req, part, View::IgnoreUsage)
    }

    /// Steps 1 through 4 against `snap`.
    pub fn run_steps(&self, snap: &AllocSnapshot, req: &JobRequest, part: &Partition) -> SelectResult<JobResources> {
        self.cancel.check()?;
        let all = |_: PartitionId, _: usize| true;
        let err = match self.try_fit(snap, req, part, View::Rows(&all)) {
            Ok(res) => {
                debug!(job = req.job_id, step = 1, "placed on idle cores");
                return Ok(res);
            }
            Err(e) if retryable(&e) => e,
            Err(e) => return Err(e),
        };
        trace!(job = req.job_id, error = %err, "step 1 failed");

        self.cancel.check()?;
        let my_tier = part.priority_tier;
        let by_part = self.cfg.preempt.by_partition;
        let step2 = |p: PartitionId, _: usize| {
            self.tier(p).is_some_and(|(tier, mode)| {
                tier > my_tier || (by_part && tier < my_tier && mode == PreemptMode::Off)
            })
        };
        self.try_fit(snap, req, part, View::Rows(&step2))?;

        self.cancel.check()?;
        let step3 = |p: PartitionId, r: usize| {
            step2(p, r) || self.tier(p).is_some_and(|(tier, _)| tier == my_tier)
        };
        let err = match self.try_fit(snap, req, part, View::Rows(&step3)) {
            Ok(res) => return Ok(self.fold_lower_tiers(snap, req, part, &step3, res)),
            Err(e) if retryable(&e) => e,
            Err(e) => return Err(e),
        };
        trace!(job = req.job_id, error = %err, "step 3 failed");

        let mut last = err;
        for row in 0..usize::from(part.max_share) {
            self.cancel.check()?;
            let step4 = |p: PartitionId, r: usize| {
                if p == part.id {
                    r == row
                } else {
                    step3(p, r)
                }
            };
            match self.try_fit(snap, req, part, View::Rows(&step4)) {
                Ok(res) => {
                    debug!(job = req.job_id, step = 4, row, "placed in partition row");
                    return Ok(res);
                }
                Err(e) if retryable(&e) => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Step 3b: treat lower-tier partitions as busy one at a time, keeping
    /// each one whose addition still fits.
    fn fold_lower_tiers(
        &self,
        snap: &AllocSnapshot,
        req: &JobRequest,
        part: &Partition,
        base: &dyn Fn(PartitionId, usize) -> bool,
        mut best: JobResources,
    ) -> JobResources {
        let mut lower: Vec<&Partition> = self
            .inv
            .partitions
            .iter()
            .filter(|p| p.priority_tier < part.priority_tier && !base(p.id, 0))
            .collect();
        lower.sort_by(|a, b| b.priority_tier.cmp(&a.priority_tier).then(a.id.cmp(&b.id)));

        let mut kept: Vec<PartitionId> = Vec::new();
        for p in lower {
            if self.cancel.is_cancelled() {
                break;
            }
            kept.push(p.id);
            let view = |q: PartitionId, r: usize| base(q, r) || kept.contains(&q);
            let fit = self.try_fit(snap, req, part, View::Rows(&view));
            match fit {
                Ok(res) => best = res,
                Err(_) => {
                    kept.pop();
                }
            }
        }
        debug!(job = req.job_id, step = 3, lower_busy = kept.len(), "placed over lower tiers");
        best
    }

    /// One pass of the fit pipeline under `view`.
    pub fn try_fit(
        &self,
        snap: &AllocSnapshot,
        req: &JobRequest,
        part: &Partition,
        view: View<'_>,
    ) -> SelectResult<JobResources> {
        let select = &self.cfg.select;
        let ignore = matches!(view, View::IgnoreUsage);
        if let Some(required) = &req.required_nodes {
            if !part.nodes.is_superset(required).unwrap_or(false) {
                return Err(SelectError::InvalidRequest(format!(
                    "required nodes are not all in partition {}",
                    part.name
                )));
            }
        }

        let filtered = filter_candidates(self.inv, snap, select, req, &part.nodes, ignore)?;
        let mut avail: Vec<Option<AvailRes>> = vec![None; self.inv.node_count()];
        for idx in filtered.nodes.iter_set() {
            let Some(node) = self.inv.nodes.get(idx) else { continue };
            let size = node.tot_cores() as usize;
            avail[idx] = match view {
                View::IgnoreUsage => {
                    node_avail(node, None, &Bitmap::new(size), req, select, node.usable_memory())
                }
                View::Rows(counts) => {
                    let usage = snap.node(node.id);
                    let busy = snap.busy_cores(node.id, size, counts);
                    let mem_free = node
                        .usable_memory()
                        .saturating_sub(usage.map_or(0, |u| u.alloc_memory));
                    node_avail(node, usage, &busy, req, select, mem_free)
                }
            };
        }

        let selected = eval_nodes(req, &avail, select.lln)?;
        let chosen: Vec<&AvailRes> = selected
            .iter()
            .filter_map(|id| avail.get(*id as usize).and_then(Option::as_ref))
            .collect();
        let layout = distribute(req, &chosen)?;

        let family = req.task_dist.core_family();
        let mut res = JobResources::empty(req.job_id, &part.name, self.inv.node_count());
        for (i, a) in chosen.iter().enumerate() {
            let node = self
                .inv
                .node(a.node)
                .ok_or_else(|| SelectError::Conflict(format!("node {} not in inventory", a.node)))?;
            let choice = chooser::choose(family, node, a, layout.cpus[i], req, select)
                .ok_or(SelectError::HeldNoPriority(req.job_id))?;

            let mut sockets = Bitmap::new(usize::from(node.sockets));
            for core in choice.cores.iter_set() {
                sockets.set(usize::from(node.socket_of_core(core)));
            }
            let usage = if ignore { None } else { snap.node(node.id) };
            for g in req.gres.iter().filter(|g| g.per_node > 0 || g.per_task > 0 || g.per_socket > 0) {
                let Some(inventory) = gres::inventory_for(node, g) else {
                    return Err(SelectError::GresInfeasible(format!("{} has no gres/{}", node.name, g.name)));
                };
                let count = gres::units_for_node(g, layout.tasks[i], sockets.count() as u32);
                let enforce = g.enforce_binding.unwrap_or(select.enforce_binding);
                let Some(units) = gres::pick_units(inventory, usage, count, &sockets, enforce) else {
                    let msg = format!("{count} gres/{} units on {}", g.name, node.name);
                    return Err(if ignore {
                        SelectError::GresInfeasible(msg)
                    } else {
                        SelectError::NoResources(msg)
                    });
                };
                res.gres_alloc.push(GresAlloc {
                    node: node.id,
                    name: inventory.name.clone(),
                    type_name: inventory.type_name.clone(),
                    units,
                });
            }

            let mem = node_memory(req, select, choice.task_cpus);
            if mem > a.mem_free {
                return Err(if ignore {
                    SelectError::NodeMemoryExceeded(node.name.clone())
                } else {
                    SelectError::NoResources(format!("{mem} MiB not free on {}", node.name))
                });
            }

            res.node_bitmap.set(node.id as usize);
            res.cpus.push(choice.cpus);
            res.node_cores.push(node.tot_cores());
            res.core_bitmap.append(&choice.cores);
            res.memory_allocated.push(mem);
            res.tasks.push(layout.tasks[i]);
        }
        res.node_req = req.node_req();
        res.whole_node = req.whole_node;
        res.threads_per_core = self.inv.max_threads(&selected);
        res.preempt_mode = req.preempt_mode.unwrap_or(part.preempt_mode);
        trace!(
            job = req.job_id,
            nodes = %res.node_bitmap.fmt_ranges(),
            cpus = res.total_cpus(),
            "fit found"
        );
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::{inventory, record};
    use crate::snapshot::Scope;

    fn cfg() -> PlacementConfig {
        PlacementConfig::default()
    }

    fn cpus(n: u32) -> JobRequest {
        JobRequest {
            num_tasks: n,
            partition: "batch".to_string(),
            ..JobRequest::default()
        }
    }

    #[test]
    fn cancel_token_trips_check() {
        let t = CancelToken::new();
        assert!(t.check().is_ok());
        t.clone().cancel();
        assert_eq!(t.check(), Err(SelectError::Cancelled));
    }

    #[test]
    fn fits_on_idle_cluster() {
        let inv = inventory(2, 2, 2, 1, 1);
        let snap = AllocSnapshot::new(&inv);
        let cfg = cfg();
        let cancel = CancelToken::new();
        let d = Driver::new(&inv, &cfg, &cancel);
        let res = d.run_steps(&snap, &cpus(4), &inv.partitions[0]).unwrap();
        assert_eq!(res.node_count(), 1);
        assert_eq!(res.total_cpus(), 4);
        assert_eq!(res.total_tasks(), 4);
    }

    #[test]
    fn busy_cores_push_job_to_another_node() {
        let inv = inventory(2, 1, 4, 1, 1);
        let mut snap = AllocSnapshot::new(&inv);
        let mut rec = record(&inv, 1, 0, &[0, 1, 2]);
        rec.res.memory_allocated = vec![0];
        snap.add_job(&rec, Scope::All).unwrap();
        let cfg = cfg();
        let cancel = CancelToken::new();
        let d = Driver::new(&inv, &cfg, &cancel);
        let mut req = cpus(2);
        req.share_res = true;
        let res = d.run_steps(&snap, &req, &inv.partitions[0]).unwrap();
        assert_eq!(res.node_ids(), vec![1]);
    }

    #[test]
    fn second_row_takes_shared_cores() {
        let inv = inventory(1, 1, 2, 1, 2);
        let mut snap = AllocSnapshot::new(&inv);
        let mut rec = record(&inv, 1, 0, &[0, 1]);
        rec.res.memory_allocated = vec![0];
        snap.add_job(&rec, Scope::All).unwrap();
        let cfg = cfg();
        let cancel = CancelToken::new();
        let d = Driver::new(&inv, &cfg, &cancel);
        let mut req = cpus(2);
        req.share_res = true;
        let res = d.run_steps(&snap, &req, &inv.partitions[0]).unwrap();
        assert_eq!(res.total_cpus(), 2);
        assert_eq!(snap.first_free_row(0, &res), Some(1));
    }

    #[test]
    fn full_single_row_partition_has_no_resources() {
        let inv = inventory(1, 1, 2, 1, 1);
        let mut snap = AllocSnapshot::new(&inv);
        let mut rec = record(&inv, 1, 0, &[0, 1]);
        rec.res.memory_allocated = vec![0];
        snap.add_job(&rec, Scope::All).unwrap();
        let cfg = cfg();
        let cancel = CancelToken::new();
        let d = Driver::new(&inv, &cfg, &cancel);
        let mut req = cpus(1);
        req.share_res = true;
        assert!(matches!(
            d.run_steps(&snap, &req, &inv.partitions[0]),
            Err(SelectError::NoResources(_))
        ));
    }

    #[test]
    fn feasibility_ignores_allocations() {
        let inv = inventory(1, 1, 2, 1, 1);
        let mut snap = AllocSnapshot::new(&inv);
        snap.add_job(&record(&inv, 1, 0, &[0, 1]), Scope::All).unwrap();
        let cfg = cfg();
        let cancel = CancelToken::new();
        let d = Driver::new(&inv, &cfg, &cancel);
        assert!(d.feasible(&snap, &cpus(2), &inv.partitions[0]).is_ok());
        assert!(matches!(
            d.feasible(&snap, &cpus(3), &inv.partitions[0]),
            Err(SelectError::NoResources(_))
        ));
    }

    #[test]
    fn memory_is_granted_per_cpu() {
        let inv = inventory(1, 1, 4, 1, 1);
        let snap = AllocSnapshot::new(&inv);
        let cfg = cfg();
        let cancel = CancelToken::new();
        let d = Driver::new(&inv, &cfg, &cancel);
        let mut req = cpus(3);
        req.pn_min_memory = 100;
        req.mem_per_cpu = true;
        let res = d.run_steps(&snap, &req, &inv.partitions[0]).unwrap();
        assert_eq!(res.memory_allocated, vec![300]);
    }

    #[test]
    fn gres_units_are_picked() {
        let inv = inventory(1, 1, 4, 1, 1);
        let snap = AllocSnapshot::new(&inv);
        let cfg = cfg();
        let cancel = CancelToken::new();
        let d = Driver::new(&inv, &cfg, &cancel);
        let mut req = cpus(1);
        req.gres = vec![coregrid_core::GresRequest::per_node("gpu:2").unwrap()];
        let res = d.run_steps(&snap, &req, &inv.partitions[0]).unwrap();
        assert_eq!(res.gres_alloc.len(), 1);
        assert_eq!(res.gres_alloc[0].units, vec![0, 1]);
    }

    #[test]
    fn cancelled_driver_stops() {
        let inv = inventory(1, 1, 2, 1, 1);
        let snap = AllocSnapshot::new(&inv);
        let cfg = cfg();
        let cancel = CancelToken::new();
        cancel.cancel();
        let d = Driver::new(&inv, &cfg, &cancel);
        assert_eq!(
            d.run_steps(&snap, &cpus(1), &inv.partitions[0]),
            Err(SelectError::Cancelled)
        );
    }
}
