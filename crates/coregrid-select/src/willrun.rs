//! Will-run: when could a job start?
//!
//! The job is tried against the current snapshot first, then with the
//! offered preemption candidates removed. After that running jobs are
//! retired from a cloned snapshot in end-time order. Jobs ending within
//! the current window of the next one are retired together; the window
//! grows by `window_scale` each iteration, or doubles when that is zero.
//! The search stops at the wall budget or when the cancel token trips.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use coregrid_core::{JobId, JobRequest, JobResources, Partition};
use tracing::{debug, trace};

use crate::driver::{Driver, retryable};
use crate::error::{SelectError, SelectResult};
use crate::preempt::{preempt_scope, preemptable};
use crate::snapshot::{AllocSnapshot, AllocState, JobRecord, Scope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillRun {
    pub res: JobResources,
    pub start_time: u64,
    pub preemptees: Vec<JobId>,
}

/// Set start and end times on a placement starting at `start`.
pub(crate) fn stamp(mut res: JobResources, req: &JobRequest, start: u64) -> JobResources {
    res.start_time = start;
    res.end_time = if req.time_limit_secs > 0 { start + req.time_limit_secs } else { 0 };
    res
}

fn attempt(driver: &Driver<'_>, snap: &AllocSnapshot, req: &JobRequest, part: &Partition) -> SelectResult<Option<JobResources>> {
    match driver.run_steps(snap, req, part) {
        Ok(res) => Ok(Some(res)),
        Err(e) if retryable(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn will_run(
    driver: &Driver<'_>,
    snap: &AllocSnapshot,
    jobs: &BTreeMap<JobId, JobRecord>,
    req: &JobRequest,
    part: &Partition,
    candidates: &[JobId],
    now: u64,
) -> SelectResult<WillRun> {
    let started = Instant::now();
    let budget = Duration::from_millis(driver.cfg.backfill.max_wall_ms);

    if let Some(res) = attempt(driver, snap, req, part)? {
        return Ok(WillRun { res: stamp(res, req, now), start_time: now, preemptees: Vec::new() });
    }

    let mut sim = snap.clone();
    let victims = preemptable(jobs, candidates);
    for rec in &victims {
        if let Some(scope) = preempt_scope(rec.preempt_mode()) {
            sim.remove_job(rec, scope);
        }
    }
    if !victims.is_empty() {
        if let Some(res) = attempt(driver, &sim, req, part)? {
            let preemptees = victims
                .iter()
                .filter(|r| r.res.node_bitmap.overlaps(&res.node_bitmap).unwrap_or(false))
                .map(|r| r.job_id())
                .collect();
            return Ok(WillRun { res: stamp(res, req, now), start_time: now, preemptees });
        }
    }

    let mut ending: Vec<&JobRecord> = jobs
        .values()
        .filter(|r| r.state == AllocState::Running && r.res.end_time > 0)
        .filter(|r| !victims.iter().any(|v| v.job_id() == r.job_id()))
        .collect();
    ending.sort_by_key(|r| (r.res.end_time, r.job_id()));

    let scale = driver.cfg.backfill.window_scale;
    let mut window = driver.cfg.backfill.initial_window_secs.max(1);
    let mut next = 0;
    while next < ending.len() {
        driver.cancel.check()?;
        if started.elapsed() > budget {
            debug!(job = req.job_id, elapsed_ms = started.elapsed().as_millis() as u64, "will-run wall budget spent");
            break;
        }
        let horizon = ending[next].res.end_time.saturating_add(window);
        let mut end = ending[next].res.end_time;
        while next < ending.len() && ending[next].res.end_time <= horizon {
            sim.remove_job(ending[next], Scope::All);
            end = ending[next].res.end_time;
            next += 1;
        }
        trace!(job = req.job_id, end, window, retired = next, "will-run retire batch");
        if let Some(res) = attempt(driver, &sim, req, part)? {
            let start = end.max(now);
            return Ok(WillRun { res: stamp(res, req, start), start_time: start, preemptees: Vec::new() });
        }
        window = if scale == 0 { window.saturating_mul(2) } else { window.saturating_add(scale) };
    }
    Err(SelectError::NoResources(format!(
        "job {} has no start time within the simulated horizon",
        req.job_id
    )))
}
