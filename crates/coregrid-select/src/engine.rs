//! `SelectEngine`: owner of the inventory, the allocation snapshot and the
//! committed job records.
//!
//! Placement runs and commits are serialized by a scheduling lock. Within
//! it, placement holds a read lock on the state for the whole run, so it
//! never observes a partial commit; commits and releases take the write
//! lock. Readers outside scheduling (`node_states`, `job`) only need the
//! read lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use coregrid_core::{
    ClusterConfig, ConfigResult, JobId, JobRequest, JobResources, NodeId, NodeShareState, Partition,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::driver::{CancelToken, Driver, PlacementConfig, retryable};
use crate::error::{SelectError, SelectResult};
use crate::inventory::Inventory;
use crate::preempt;
use crate::snapshot::{AllocSnapshot, AllocState, JobRecord, Scope};
use crate::willrun;

/// What a placement request asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceMode {
    #[default]
    RunNow,
    WillRun,
    TestOnly,
}

/// How an allocation is given back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    #[default]
    Normal,
    /// Free cores and memory; GRES stay held until the job ends.
    Suspend,
    /// Free cores only.
    SuspendMemKeep,
}

/// Result of a placement run. Nothing is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub resources: JobResources,
    pub preemptees: Vec<JobId>,
    pub start_time: u64,
}

/// Operator view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: NodeId,
    pub name: String,
    pub cpus: u32,
    pub alloc_cpus: u32,
    pub real_memory: u64,
    pub alloc_memory: u64,
    pub share: NodeShareState,
    pub gres: Vec<GresState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GresState {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub total: u32,
    pub used: u32,
}

struct EngineState {
    snap: AllocSnapshot,
    jobs: BTreeMap<JobId, JobRecord>,
}

pub struct SelectEngine {
    inv: Arc<Inventory>,
    cfg: PlacementConfig,
    sched: Mutex<()>,
    state: RwLock<EngineState>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn run_mode(
    driver: &Driver<'_>,
    state: &EngineState,
    req: &JobRequest,
    part: &Partition,
    mode: PlaceMode,
    candidates: &[JobId],
    now: u64,
) -> SelectResult<Placement> {
    let feasible = driver.feasible(&state.snap, req, part)?;
    match mode {
        PlaceMode::TestOnly => {
            debug!(job = req.job_id, "test-only placement feasible");
            Ok(Placement {
                resources: feasible,
                preemptees: Vec::new(),
                start_time: now,
            })
        }
        PlaceMode::WillRun => {
            let w = willrun::will_run(driver, &state.snap, &state.jobs, req, part, candidates, now)?;
            Ok(Placement {
                resources: w.res,
                preemptees: w.preemptees,
                start_time: w.start_time,
            })
        }
        PlaceMode::RunNow => match driver.run_steps(&state.snap, req, part) {
            Ok(res) => Ok(Placement {
                resources: willrun::stamp(res, req, now),
                preemptees: Vec::new(),
                start_time: now,
            }),
            Err(e) if retryable(&e) && !candidates.is_empty() => {
                debug!(job = req.job_id, error = %e, "trying preemption");
                let o = preempt::simulate(driver, &state.snap, &state.jobs, req, part, candidates)?;
                Ok(Placement {
                    resources: willrun::stamp(o.res, req, now),
                    preemptees: o.preemptees,
                    start_time: now,
                })
            }
            Err(e) => Err(e),
        },
    }
}

impl SelectEngine {
    pub fn new(inv: Arc<Inventory>, cfg: PlacementConfig) -> Self {
        let snap = AllocSnapshot::new(&inv);
        info!(
            nodes = inv.node_count(),
            partitions = inv.partitions.len(),
            "select engine ready"
        );
        Self {
            inv,
            cfg,
            sched: Mutex::new(()),
            state: RwLock::new(EngineState {
                snap,
                jobs: BTreeMap::new(),
            }),
        }
    }

    pub fn from_config(cfg: &ClusterConfig) -> ConfigResult<Self> {
        let inv = Inventory::from_config(cfg)?;
        Ok(Self::new(Arc::new(inv), PlacementConfig::from(cfg)))
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inv
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().snap.epoch()
    }

    /// A committed job's record.
    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.state.read().jobs.get(&id).cloned()
    }

    pub fn job_count(&self) -> usize {
        self.state.read().jobs.len()
    }

    // ── Placement ──────────────────────────────────────────────

    pub fn place_job(
        &self,
        req: &JobRequest,
        mode: PlaceMode,
        preemptee_candidates: &[JobId],
        cancel: &CancelToken,
    ) -> SelectResult<Placement> {
        self.place_job_at(req, mode, preemptee_candidates, cancel, unix_now())
    }

    /// [`place_job`](Self::place_job) with an explicit clock.
    pub fn place_job_at(
        &self,
        req: &JobRequest,
        mode: PlaceMode,
        preemptee_candidates: &[JobId],
        cancel: &CancelToken,
        now: u64,
    ) -> SelectResult<Placement> {
        let part = self
            .inv
            .partition(&req.partition)
            .ok_or_else(|| SelectError::InvalidRequest(format!("unknown partition '{}'", req.partition)))?;
        if let Some(required) = &req.required_nodes {
            if required.size() != self.inv.node_count() {
                return Err(SelectError::InvalidRequest(format!(
                    "required node bitmap has {} bits, cluster has {} nodes",
                    required.size(),
                    self.inv.node_count()
                )));
            }
        }
        if req.is_zero_node() {
            debug!(job = req.job_id, "zero-node job");
            let mut res = JobResources::empty(req.job_id, &part.name, self.inv.node_count());
            res.start_time = now;
            return Ok(Placement {
                resources: res,
                preemptees: Vec::new(),
                start_time: now,
            });
        }

        let _sched = self.sched.lock();
        let state = self.state.read();
        let driver = Driver::new(&self.inv, &self.cfg, cancel);
        match run_mode(&driver, &state, req, part, mode, preemptee_candidates, now) {
            Err(SelectError::HeldNoPriority(id)) if mode != PlaceMode::RunNow => {
                Err(SelectError::NoResources(format!("no core layout found for job {id}")))
            }
            Err(SelectError::HeldNoPriority(id)) => {
                warn!(job = id, "placement made no progress; holding job");
                Err(SelectError::HeldNoPriority(id))
            }
            other => other,
        }
    }

    // ── Allocation bookkeeping ─────────────────────────────────

    pub fn commit_allocation(&self, res: JobResources) -> SelectResult<u64> {
        self.commit_allocation_at(res, unix_now())
    }

    /// Record `res` as held. Returns the new snapshot epoch.
    pub fn commit_allocation_at(&self, mut res: JobResources, now: u64) -> SelectResult<u64> {
        let _sched = self.sched.lock();
        let mut state = self.state.write();
        if state.jobs.contains_key(&res.job_id) {
            return Err(SelectError::AlreadyCommitted(res.job_id));
        }
        let part = self
            .inv
            .partition(&res.partition)
            .ok_or_else(|| SelectError::Conflict(format!("unknown partition '{}'", res.partition)))?;
        self.check_nodes(&state.snap, &res)?;

        let row = if res.is_empty() {
            0
        } else {
            state.snap.first_free_row(part.id, &res).ok_or_else(|| {
                SelectError::Conflict(format!(
                    "job {} overlaps every row of partition {}",
                    res.job_id, part.name
                ))
            })?
        };
        if res.start_time == 0 {
            res.start_time = now;
        }
        let rec = JobRecord {
            res,
            part: part.id,
            row,
            state: AllocState::Running,
        };
        state.snap.add_job(&rec, Scope::All)?;
        let job_id = rec.job_id();
        let cpus = rec.res.total_cpus();
        state.jobs.insert(job_id, rec);
        let epoch = state.snap.bump_epoch();
        info!(job = job_id, partition = %part.name, row, cpus, epoch, "allocation committed");
        Ok(epoch)
    }

    /// Share-state and memory checks a commit must pass.
    fn check_nodes(&self, snap: &AllocSnapshot, res: &JobResources) -> SelectResult<()> {
        for (i, node) in res.node_ids().into_iter().enumerate() {
            let Some(info) = self.inv.node(node) else {
                return Err(SelectError::Conflict(format!("node {node} not in inventory")));
            };
            let Some(usage) = snap.node(node) else { continue };
            let reserved = usage.state() == NodeShareState::Reserved;
            let one_row_clash = usage.state() == NodeShareState::OneRow && res.node_req != NodeShareState::Available;
            let wants_whole = res.node_req == NodeShareState::Reserved && snap.any_busy(node);
            if reserved || one_row_clash || wants_whole {
                return Err(SelectError::Conflict(format!(
                    "node {} is not shareable with job {}",
                    info.name, res.job_id
                )));
            }
            let mem = res.memory_allocated.get(i).copied().unwrap_or(0);
            if usage.alloc_memory + mem > info.usable_memory() {
                return Err(SelectError::Conflict(format!(
                    "node {} has {} MiB free, job {} needs {mem}",
                    info.name,
                    info.usable_memory().saturating_sub(usage.alloc_memory),
                    res.job_id
                )));
            }
        }
        Ok(())
    }

    pub fn release_allocation(&self, job_id: JobId, mode: ReleaseMode) -> SelectResult<()> {
        let _sched = self.sched.lock();
        let mut state = self.state.write();
        let Some(rec) = state.jobs.get(&job_id).cloned() else {
            return Err(SelectError::UnknownJob(job_id));
        };
        let (scope, next) = match (rec.state, mode) {
            (AllocState::Running, ReleaseMode::Normal) => (Scope::All, None),
            (AllocState::Running, ReleaseMode::Suspend) => {
                (Scope::CoresAndMemory, Some(AllocState::Suspended { memory_kept: false }))
            }
            (AllocState::Running, ReleaseMode::SuspendMemKeep) => {
                (Scope::CoresOnly, Some(AllocState::Suspended { memory_kept: true }))
            }
            (AllocState::Suspended { memory_kept: false }, ReleaseMode::Normal) => (Scope::GresOnly, None),
            (AllocState::Suspended { memory_kept: true }, ReleaseMode::Normal) => (Scope::MemoryAndGres, None),
            (AllocState::Suspended { .. }, _) => {
                return Err(SelectError::Conflict(format!("job {job_id} is already suspended")));
            }
        };
        state.snap.remove_job(&rec, scope);
        match next {
            Some(s) => {
                if let Some(r) = state.jobs.get_mut(&job_id) {
                    r.state = s;
                }
            }
            None => {
                state.jobs.remove(&job_id);
            }
        }
        let epoch = state.snap.bump_epoch();
        info!(job = job_id, ?mode, epoch, "allocation released");
        Ok(())
    }

    /// Re-add the cores of a suspended job. Returns the new epoch.
    pub fn resume_allocation(&self, job_id: JobId) -> SelectResult<u64> {
        let _sched = self.sched.lock();
        let mut state = self.state.write();
        let Some(mut rec) = state.jobs.get(&job_id).cloned() else {
            return Err(SelectError::UnknownJob(job_id));
        };
        let scope = match rec.state {
            AllocState::Running => {
                return Err(SelectError::Conflict(format!("job {job_id} is not suspended")));
            }
            AllocState::Suspended { memory_kept: true } => Scope::CoresOnly,
            AllocState::Suspended { memory_kept: false } => Scope::CoresAndMemory,
        };
        rec.row = if rec.res.is_empty() {
            0
        } else {
            state.snap.first_free_row(rec.part, &rec.res).ok_or_else(|| {
                SelectError::Conflict(format!("job {job_id} cannot resume: its cores are taken"))
            })?
        };
        rec.state = AllocState::Running;
        state.snap.add_job(&rec, scope)?;
        state.jobs.insert(job_id, rec);
        let epoch = state.snap.bump_epoch();
        info!(job = job_id, epoch, "allocation resumed");
        Ok(epoch)
    }

    // ── Queries ────────────────────────────────────────────────

    pub fn node_states(&self) -> Vec<NodeState> {
        let state = self.state.read();
        self.inv
            .nodes
            .iter()
            .map(|node| {
                let usage = state.snap.node(node.id);
                let alloc_cores = state.snap.alloc_cores(node.id, node.tot_cores() as usize);
                NodeState {
                    id: node.id,
                    name: node.name.clone(),
                    cpus: node.cpus(),
                    alloc_cpus: alloc_cores.count() as u32 * u32::from(node.threads_per_core),
                    real_memory: node.real_memory,
                    alloc_memory: usage.map_or(0, |u| u.alloc_memory),
                    share: usage.map_or(NodeShareState::Available, |u| u.state()),
                    gres: node
                        .gres
                        .iter()
                        .map(|g| GresState {
                            name: g.name.clone(),
                            type_name: g.type_name.clone(),
                            total: g.count.min(u64::from(u32::MAX)) as u32,
                            used: usage
                                .and_then(|u| u.gres_used(&g.name, g.type_name.as_deref()))
                                .map_or(0, |b| b.count() as u32),
                        })
                        .collect(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::inventory;

    fn engine(nodes: usize, cores: u16, max_share: u16) -> SelectEngine {
        SelectEngine::new(Arc::new(inventory(nodes, 1, cores, 1, max_share)), PlacementConfig::default())
    }

    fn req(job_id: JobId, tasks: u32) -> JobRequest {
        JobRequest {
            job_id,
            num_tasks: tasks,
            partition: "batch".to_string(),
            share_res: true,
            ..JobRequest::default()
        }
    }

    fn place(e: &SelectEngine, r: &JobRequest) -> SelectResult<Placement> {
        e.place_job_at(r, PlaceMode::RunNow, &[], &CancelToken::new(), 1000)
    }

    #[test]
    fn place_commit_release_cycle() {
        let e = engine(1, 4, 1);
        let p = place(&e, &req(1, 4)).unwrap();
        assert_eq!(p.start_time, 1000);
        assert_eq!(e.commit_allocation_at(p.resources.clone(), 1000).unwrap(), 1);
        assert_eq!(e.node_states()[0].alloc_cpus, 4);
        assert!(matches!(place(&e, &req(2, 1)), Err(SelectError::NoResources(_))));

        e.release_allocation(1, ReleaseMode::Normal).unwrap();
        assert_eq!(e.epoch(), 2);
        assert_eq!(e.node_states()[0].alloc_cpus, 0);
        assert!(place(&e, &req(2, 1)).is_ok());
    }

    #[test]
    fn commit_twice_is_rejected_without_change() {
        let e = engine(1, 4, 1);
        let p = place(&e, &req(1, 2)).unwrap();
        e.commit_allocation(p.resources.clone()).unwrap();
        let before = e.node_states();
        assert_eq!(
            e.commit_allocation(p.resources),
            Err(SelectError::AlreadyCommitted(1))
        );
        assert_eq!(e.node_states(), before);
        assert_eq!(e.epoch(), 1);
    }

    #[test]
    fn overlapping_commit_conflicts() {
        let e = engine(1, 4, 1);
        let a = place(&e, &req(1, 2)).unwrap();
        let mut b = a.resources.clone();
        b.job_id = 2;
        e.commit_allocation(a.resources).unwrap();
        assert!(matches!(e.commit_allocation(b), Err(SelectError::Conflict(_))));
    }

    #[test]
    fn unknown_job_release() {
        let e = engine(1, 4, 1);
        assert_eq!(e.release_allocation(7, ReleaseMode::Normal), Err(SelectError::UnknownJob(7)));
    }

    #[test]
    fn suspend_then_resume() {
        let e = engine(1, 4, 1);
        let mut r = req(1, 4);
        r.pn_min_memory = 512;
        let p = place(&e, &r).unwrap();
        e.commit_allocation(p.resources).unwrap();

        e.release_allocation(1, ReleaseMode::SuspendMemKeep).unwrap();
        let n = &e.node_states()[0];
        assert_eq!(n.alloc_cpus, 0);
        assert_eq!(n.alloc_memory, 512);
        assert_eq!(
            e.job(1).map(|j| j.state),
            Some(AllocState::Suspended { memory_kept: true })
        );

        e.resume_allocation(1).unwrap();
        assert_eq!(e.node_states()[0].alloc_cpus, 4);
        assert_eq!(e.node_states()[0].alloc_memory, 512);

        e.release_allocation(1, ReleaseMode::Suspend).unwrap();
        assert_eq!(e.node_states()[0].alloc_memory, 0);
        e.release_allocation(1, ReleaseMode::Normal).unwrap();
        assert_eq!(e.job_count(), 0);
    }

    #[test]
    fn unknown_partition_is_invalid() {
        let e = engine(1, 4, 1);
        let mut r = req(1, 1);
        r.partition = "nope".to_string();
        assert!(matches!(place(&e, &r), Err(SelectError::InvalidRequest(_))));
    }

    #[test]
    fn zero_node_job_gets_empty_resources() {
        let e = engine(1, 4, 1);
        let r = JobRequest {
            job_id: 5,
            partition: "batch".to_string(),
            min_nodes: 0,
            max_nodes: 0,
            num_tasks: 0,
            min_cpus: 0,
            ..JobRequest::default()
        };
        let p = place(&e, &r).unwrap();
        assert!(p.resources.is_empty());
        e.commit_allocation(p.resources).unwrap();
        assert_eq!(e.node_states()[0].alloc_cpus, 0);
    }

    #[test]
    fn preemption_returns_preemptees() {
        let e = engine(1, 4, 1);
        let mut low = req(1, 4);
        low.preempt_mode = Some(coregrid_core::PreemptMode::Requeue);
        let p = place(&e, &low).unwrap();
        e.commit_allocation(p.resources).unwrap();

        let high = req(2, 2);
        let p = e
            .place_job_at(&high, PlaceMode::RunNow, &[1], &CancelToken::new(), 1000)
            .unwrap();
        assert_eq!(p.preemptees, vec![1]);
        // Nothing was committed by the simulation.
        assert_eq!(e.node_states()[0].alloc_cpus, 4);
    }

    #[test]
    fn test_only_ignores_running_jobs() {
        let e = engine(1, 4, 1);
        let p = place(&e, &req(1, 4)).unwrap();
        e.commit_allocation(p.resources).unwrap();
        let r = e.place_job_at(&req(2, 4), PlaceMode::TestOnly, &[], &CancelToken::new(), 1000);
        assert!(r.is_ok());
    }

    #[test]
    fn modes_use_snake_case_on_the_wire() {
        let mode: PlaceMode = serde_json::from_str("\"will_run\"").unwrap();
        assert_eq!(mode, PlaceMode::WillRun);
        let json = serde_json::to_string(&ReleaseMode::SuspendMemKeep).unwrap();
        assert_eq!(json, "\"suspend_mem_keep\"");
    }
}
