//! `StepManager`: the accounting entry points.
//!
//! Holds one sampler per active step. The step map is guarded by the
//! task-list lock; a separate shutdown lock gates new work once
//! [`StepManager::end_poll`] has run. When a [`ProfileTimer`] is attached,
//! every step gets its own sampler thread that runs one tick per timer
//! signal; without one, sampling happens only on polls.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use coregrid_core::{AcctGatherConfig, AcctParam, JobAcct};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capability::Capabilities;
use crate::error::{AcctError, AcctResult};
use crate::options::AcctGatherOptions;
use crate::proc::ProcReader;
use crate::profile::{ProfileSink, ProfileTimer};
use crate::sampler::{StepKey, StepLimits, StepSampler};
use crate::signal::StepControl;
use crate::tracker::{CgroupTracker, PgidTracker, ProcessTracker};

/// How a step's processes are found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tracking {
    /// Scan the proc root for the task pids' process groups.
    Pgid,
    /// Read `<root>/job_<id>/step_<id>/cgroup.procs`.
    Cgroup { root: PathBuf },
}

impl Tracking {
    fn tracker(&self, step: StepKey) -> Box<dyn ProcessTracker> {
        match self {
            Tracking::Pgid => Box::new(PgidTracker::new()),
            Tracking::Cgroup { root } => Box::new(CgroupTracker::new(
                root.join(format!("job_{}", step.job_id))
                    .join(format!("step_{}", step.step_id)),
            )),
        }
    }
}

struct StepSlot {
    sampler: Mutex<StepSampler>,
    stop: AtomicBool,
}

pub struct StepManager {
    reader: ProcReader,
    caps: Arc<Mutex<Capabilities>>,
    control: Arc<dyn StepControl>,
    sink: Option<Arc<dyn ProfileSink>>,
    params: Vec<AcctParam>,
    tracking: Tracking,
    timer: Option<ProfileTimer>,
    steps: Mutex<BTreeMap<StepKey, Arc<StepSlot>>>,
    shutdown: Mutex<bool>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl StepManager {
    pub fn new(reader: ProcReader, caps: Capabilities, control: Arc<dyn StepControl>, params: Vec<AcctParam>) -> Self {
        Self {
            reader,
            caps: Arc::new(Mutex::new(caps)),
            control,
            sink: None,
            params,
            tracking: Tracking::Pgid,
            timer: None,
            steps: Mutex::new(BTreeMap::new()),
            shutdown: Mutex::new(false),
        }
    }

    /// Parse the acct_gather options against `caps` and build a manager.
    pub fn from_config(
        cfg: &AcctGatherConfig,
        mut caps: Capabilities,
        control: Arc<dyn StepControl>,
    ) -> AcctResult<(Self, AcctGatherOptions)> {
        let options = AcctGatherOptions::from_config(cfg, &mut caps)?;
        let manager = Self::new(ProcReader::from_config(cfg), caps, control, options.params.clone());
        info!(
            frequency_secs = options.frequency_secs,
            params = ?options.params,
            "step accounting ready"
        );
        Ok((manager, options))
    }

    pub fn with_tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_timer(mut self, timer: ProfileTimer) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.lock()
    }

    fn check_running(&self) -> AcctResult<()> {
        if self.is_shutdown() {
            return Err(AcctError::ShutdownInProgress);
        }
        Ok(())
    }

    fn slot(&self, step: StepKey) -> AcctResult<Arc<StepSlot>> {
        self.steps
            .lock()
            .get(&step)
            .cloned()
            .ok_or(AcctError::UnknownStep(step))
    }

    pub fn steps(&self) -> Vec<StepKey> {
        self.steps.lock().keys().copied().collect()
    }

    /// Track `pid` as task `task_id` on `node_id`. `limits` apply when this
    /// is the step's first task and are ignored afterwards.
    pub fn step_add_task(
        &self,
        step: StepKey,
        pid: u32,
        node_id: u32,
        task_id: u32,
        limits: Option<StepLimits>,
    ) -> AcctResult<()> {
        self.check_running()?;
        if pid == 0 {
            return Err(AcctError::BadPid(pid));
        }
        let slot = {
            let mut steps = self.steps.lock();
            match steps.get(&step) {
                Some(slot) => slot.clone(),
                None => {
                    let limits = limits.unwrap_or_default();
                    let mut sampler = StepSampler::new(
                        step,
                        node_id,
                        self.reader.clone(),
                        self.tracking.tracker(step),
                        self.caps.clone(),
                        self.control.clone(),
                        self.params.clone(),
                        limits,
                    );
                    if let Some(sink) = &self.sink {
                        sampler = sampler.with_sink(sink.clone());
                    }
                    let slot = Arc::new(StepSlot {
                        sampler: Mutex::new(sampler),
                        stop: AtomicBool::new(false),
                    });
                    if let Some(timer) = &self.timer {
                        spawn_sampler(step, slot.clone(), timer.clone());
                    }
                    info!(step = %step, ?limits, "step accounting started");
                    steps.insert(step, slot.clone());
                    slot
                }
            }
        };
        let mut sampler = slot.sampler.lock();
        sampler.add_task(pid, node_id, task_id)
    }

    /// Sample the step now and return a copy of its aggregate. A profiling
    /// poll also emits a profile row if the step profiles.
    pub fn step_poll(&self, step: StepKey, profile: bool) -> AcctResult<JobAcct> {
        self.check_running()?;
        let slot = self.slot(step)?;
        let mut sampler = slot.sampler.lock();
        sampler.sample(unix_now(), profile)
    }

    /// Copy of the step's aggregate without sampling.
    pub fn snapshot(&self, step: StepKey) -> AcctResult<JobAcct> {
        let slot = self.slot(step)?;
        let sampler = slot.sampler.lock();
        Ok(sampler.snapshot())
    }

    /// Take a final sample, stop the step's sampler and forget the step.
    pub fn step_end(&self, step: StepKey) -> AcctResult<JobAcct> {
        let slot = self
            .steps
            .lock()
            .remove(&step)
            .ok_or(AcctError::UnknownStep(step))?;
        slot.stop.store(true, Ordering::Release);
        let mut sampler = slot.sampler.lock();
        let acct = match sampler.sample(unix_now(), false) {
            Ok(acct) => acct,
            Err(e) => {
                debug!(step = %step, error = %e, "final sample failed; using last aggregate");
                sampler.snapshot()
            }
        };
        info!(step = %step, polls = sampler.polls(), cpu_secs = acct.total_cpu_secs(), "step accounting ended");
        Ok(acct)
    }

    /// Stop accepting work and wake every sampler thread so it exits.
    pub fn end_poll(&self) {
        *self.shutdown.lock() = true;
        if let Some(timer) = &self.timer {
            timer.shutdown();
        }
        info!(steps = self.steps.lock().len(), "accounting shutting down");
    }
}

fn spawn_sampler(step: StepKey, slot: Arc<StepSlot>, timer: ProfileTimer) {
    let spawned = thread::Builder::new()
        .name(format!("acct-{step}"))
        .spawn(move || {
            let mut seen = timer.current();
            while let Some(tick) = timer.wait_past(seen) {
                seen = tick;
                if slot.stop.load(Ordering::Acquire) {
                    break;
                }
                let mut sampler = slot.sampler.lock();
                if let Err(e) = sampler.sample(unix_now(), true) {
                    debug!(step = %step, error = %e, "sample failed");
                }
            }
            debug!(step = %step, "sampler thread exiting");
        });
    if let Err(e) = spawned {
        warn!(step = %step, error = %e, "no sampler thread; sampling on poll only");
    }
}
