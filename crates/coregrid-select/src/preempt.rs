//! Step 5: preemption simulation.
//!
//! Candidates are removed from a cloned snapshot one at a time, in the
//! caller's order, re-running steps 1–4 after each removal. The removed
//! jobs whose nodes overlap the resulting allocation are the preemptees.
//! With strict ordering the last preemptee is moved to the front and the
//! simulation repeated, up to `reorder_count` extra passes, keeping the
//! pass that needed the fewest preemptees.

use std::collections::{BTreeMap, HashSet};

use coregrid_core::{JobId, JobRequest, JobResources, Partition, PreemptMode};
use tracing::{debug, warn};

use crate::driver::{Driver, retryable};
use crate::error::{SelectError, SelectResult};
use crate::snapshot::{AllocSnapshot, AllocState, JobRecord, Scope};

/// Snapshot scope a preemption of this mode frees.
pub fn preempt_scope(mode: PreemptMode) -> Option<Scope> {
    match mode {
        PreemptMode::Off => None,
        PreemptMode::Suspend | PreemptMode::Gang => Some(Scope::CoresOnly),
        PreemptMode::Requeue | PreemptMode::Cancel => Some(Scope::All),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptOutcome {
    pub res: JobResources,
    pub preemptees: Vec<JobId>,
}

/// Running candidates that may be preempted, in the caller's order.
pub fn preemptable<'a>(jobs: &'a BTreeMap<JobId, JobRecord>, candidates: &[JobId]) -> Vec<&'a JobRecord> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|id| seen.insert(**id))
        .filter_map(|id| jobs.get(id))
        .filter(|rec| rec.state == AllocState::Running && preempt_scope(rec.preempt_mode()).is_some())
        .collect()
}

/// One pass over `order`: remove candidates until the job fits.
fn simulate_pass(
    driver: &Driver<'_>,
    snap: &AllocSnapshot,
    req: &JobRequest,
    part: &Partition,
    order: &[&JobRecord],
) -> SelectResult<Option<PreemptOutcome>> {
    let mut sim = snap.clone();
    let mut removed: Vec<&JobRecord> = Vec::new();
    for rec in order {
        driver.cancel.check()?;
        let Some(scope) = preempt_scope(rec.preempt_mode()) else { continue };
        sim.remove_job(rec, scope);
        removed.push(*rec);
        match driver.run_steps(&sim, req, part) {
            Ok(res) => {
                let preemptees = removed
                    .iter()
                    .filter(|r| r.res.node_bitmap.overlaps(&res.node_bitmap).unwrap_or(false))
                    .map(|r| r.job_id())
                    .collect();
                return Ok(Some(PreemptOutcome { res, preemptees }));
            }
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Result of the reorder passes: the smallest preemptee set found, and the
/// loop error when the passes ran out before the order settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub best: Option<PreemptOutcome>,
    pub stalled: Option<SelectError>,
}

pub fn search(
    driver: &Driver<'_>,
    snap: &AllocSnapshot,
    mut order: Vec<&JobRecord>,
    req: &JobRequest,
    part: &Partition,
) -> SelectResult<Search> {
    let policy = &driver.cfg.preempt;
    let passes = if policy.strict_order { 1 + policy.reorder_count } else { 1 };

    let mut tried: HashSet<Vec<JobId>> = HashSet::new();
    let mut best: Option<PreemptOutcome> = None;
    for pass in 0..passes {
        let key: Vec<JobId> = order.iter().map(|r| r.job_id()).collect();
        if !tried.insert(key) {
            return Ok(Search { best, stalled: None });
        }
        let Some(outcome) = simulate_pass(driver, snap, req, part, &order)? else {
            return Ok(Search { best, stalled: None });
        };
        debug!(job = req.job_id, pass, preemptees = ?outcome.preemptees, "preemption pass fits");
        let last = outcome.preemptees.last().copied();
        if best.as_ref().is_none_or(|b| outcome.preemptees.len() < b.preemptees.len()) {
            best = Some(outcome);
        }
        if !policy.strict_order {
            return Ok(Search { best, stalled: None });
        }
        let Some(pos) = last.and_then(|id| order.iter().position(|r| r.job_id() == id)) else {
            return Ok(Search { best, stalled: None });
        };
        let moved = order.remove(pos);
        order.insert(0, moved);
    }
    Ok(Search {
        best,
        stalled: Some(SelectError::PreemptionWouldLoop(passes)),
    })
}

/// Step 5. A reorder loop that does not settle is logged and the best set
/// found so far is used.
pub fn simulate(
    driver: &Driver<'_>,
    snap: &AllocSnapshot,
    jobs: &BTreeMap<JobId, JobRecord>,
    req: &JobRequest,
    part: &Partition,
    candidates: &[JobId],
) -> SelectResult<PreemptOutcome> {
    let order = preemptable(jobs, candidates);
    if order.is_empty() {
        return Err(SelectError::NoResources(format!(
            "job {} does not fit and no preemptable jobs were offered",
            req.job_id
        )));
    }
    let found = search(driver, snap, order, req, part)?;
    if let Some(err) = &found.stalled {
        warn!(job = req.job_id, error = %err, "using best preemption set found");
    }
    found.best.ok_or_else(|| {
        SelectError::NoResources(format!("job {} does not fit even after preemption", req.job_id))
    })
}
