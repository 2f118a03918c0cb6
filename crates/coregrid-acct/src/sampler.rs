//! Per-step sampler.
//!
//! One sampler owns one step's accumulator. Each call to
//! [`StepSampler::sample`] runs one tick:
//!
//! ```text
//!   tracker pids ─► read stat/io/statm (skip LWPs, drop vanished pids)
//!        │
//!        ▼
//!   offspring sums per task ─► task records (min = max = sample)
//!        │
//!        ▼
//!   node capabilities (energy, fs, ic) ─► tick aggregate
//!        │
//!        ▼
//!   fold into step accumulator ─► limits ─► profile row
//! ```
//!
//! Counters (CPU, energy, disk and network bytes, page faults) keep their
//! latest cumulative value as `tot`; gauges (RSS, virtual size) add up
//! across ticks so that `tot / polls` is the average.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use coregrid_core::tres::{TRES_CPU, TRES_ENERGY, TRES_FS_DISK, TRES_MEM, TRES_PAGES, TRES_STATIC_CNT, TRES_VMEM};
use coregrid_core::{AcctParam, JobAcct, TresId, TresTable, UNSET};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::capability::{Capabilities, IoCounters};
use crate::error::{AcctError, AcctResult};
use crate::proc::ProcReader;
use crate::profile::{ProfileRow, ProfileSink};
use crate::signal::StepControl;
use crate::tracker::ProcessTracker;

const MIB: u64 = 1024 * 1024;

/// `job.step` identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub job_id: u32,
    pub step_id: u32,
}

impl StepKey {
    pub const fn new(job_id: u32, step_id: u32) -> Self {
        Self { job_id, step_id }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job_id, self.step_id)
    }
}

/// Limits and flags given with the first task of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepLimits {
    /// MiB; 0 is unlimited.
    pub mem_limit_mib: u64,
    pub vmem_limit_mib: u64,
    pub profile: bool,
}

/// What one pid, or a summed process tree, showed on a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PidSample {
    ppid: u32,
    user_ms: u64,
    sys_ms: u64,
    rss: u64,
    vsize: u64,
    majflt: u64,
    rchar: u64,
    wchar: u64,
    freq_khz: u32,
}

impl PidSample {
    fn add(&mut self, other: &PidSample) {
        self.user_ms += other.user_ms;
        self.sys_ms += other.sys_ms;
        self.rss += other.rss;
        self.vsize += other.vsize;
        self.majflt += other.majflt;
        self.rchar += other.rchar;
        self.wchar += other.wchar;
    }
}

struct TaskEntry {
    pid: u32,
    acct: JobAcct,
    cpu_ms: u64,
    freq_weight: u64,
}

fn is_gauge(id: TresId) -> bool {
    id as usize == TRES_MEM || id as usize == TRES_VMEM
}

/// Fold a frequency sample into a running mean weighted by CPU time.
fn weighted_freq(mean: u32, weight: u64, sample: u32, delta: u64) -> u32 {
    let total = weight + delta;
    if total == 0 {
        return mean;
    }
    ((u128::from(mean) * u128::from(weight) + u128::from(sample) * u128::from(delta)) / u128::from(total)) as u32
}

pub struct StepSampler {
    step: StepKey,
    node_id: u32,
    reader: ProcReader,
    tracker: Box<dyn ProcessTracker>,
    caps: Arc<Mutex<Capabilities>>,
    control: Arc<dyn StepControl>,
    sink: Option<Arc<dyn ProfileSink>>,
    params: Vec<AcctParam>,
    limits: StepLimits,
    tres_ids: Vec<TresId>,
    fs_tres: Option<TresId>,
    ic_tres: Option<TresId>,
    tasks: Vec<TaskEntry>,
    acct: JobAcct,
    polls: u64,
    freq_weight: u64,
    energy_base: Option<u64>,
    fs_base: Option<IoCounters>,
    ic_base: Option<IoCounters>,
    killed: bool,
    over_limit_logged: bool,
    last_time: u64,
    last_cpu_ms: u64,
}

impl StepSampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        step: StepKey,
        node_id: u32,
        reader: ProcReader,
        tracker: Box<dyn ProcessTracker>,
        caps: Arc<Mutex<Capabilities>>,
        control: Arc<dyn StepControl>,
        params: Vec<AcctParam>,
        limits: StepLimits,
    ) -> Self {
        let mut tres_ids: Vec<TresId> = (0..TRES_STATIC_CNT as TresId).collect();
        let (fs_tres, ic_tres) = {
            let guard = caps.lock();
            let mut table = TresTable::global().write();
            (
                guard.filesystem.as_ref().map(|c| table.register("fs", Some(c.tres_name()))),
                guard.interconnect.as_ref().map(|c| table.register("ic", Some(c.tres_name()))),
            )
        };
        tres_ids.extend(fs_tres);
        tres_ids.extend(ic_tres);
        let mut acct = JobAcct::new(tres_ids.clone());
        acct.node_id = node_id;
        Self {
            step,
            node_id,
            reader,
            tracker,
            caps,
            control,
            sink: None,
            params,
            limits,
            tres_ids,
            fs_tres,
            ic_tres,
            tasks: Vec::new(),
            acct,
            polls: 0,
            freq_weight: 0,
            energy_base: None,
            fs_base: None,
            ic_base: None,
            killed: false,
            over_limit_logged: false,
            last_time: 0,
            last_cpu_ms: 0,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProfileSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn step(&self) -> StepKey {
        self.step
    }

    pub fn limits(&self) -> StepLimits {
        self.limits
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// Whether the step was cancelled for exceeding a limit.
    pub fn killed(&self) -> bool {
        self.killed
    }

    pub fn task_pids(&self) -> Vec<u32> {
        self.tasks.iter().map(|t| t.pid).collect()
    }

    /// Copy of the step accumulator.
    pub fn snapshot(&self) -> JobAcct {
        self.acct.clone()
    }

    pub fn add_task(&mut self, pid: u32, node_id: u32, task_id: u32) -> AcctResult<()> {
        if pid == 0 || self.tasks.iter().any(|t| t.pid == pid) {
            return Err(AcctError::BadPid(pid));
        }
        self.tracker.add(pid);
        self.tasks.push(TaskEntry {
            pid,
            acct: JobAcct::for_task(self.tres_ids.clone(), pid, node_id, task_id),
            cpu_ms: 0,
            freq_weight: 0,
        });
        debug!(step = %self.step, pid, node_id, task_id, "task added");
        Ok(())
    }

    fn has(&self, param: AcctParam) -> bool {
        self.params.contains(&param)
    }

    /// Read one pid. `Ok(None)` for lightweight processes.
    fn read_pid(&self, pid: u32) -> AcctResult<Option<PidSample>> {
        if self.reader.tgid(pid)? != pid {
            return Ok(None);
        }
        let stat = self.reader.stat(pid)?;
        let page = self.reader.page_size;
        let mut rss = stat.rss.saturating_mul(page);
        if self.has(AcctParam::UsePss) {
            match self.reader.pss_bytes(pid) {
                Ok(pss) if pss > 0 => rss = pss,
                Ok(_) => {}
                Err(e) => trace!(pid, error = %e, "no pss"),
            }
        } else if self.has(AcctParam::NoShare) {
            match self.reader.shared_pages(pid) {
                Ok(shared) => rss = rss.saturating_sub(shared.saturating_mul(page)),
                Err(e) => trace!(pid, error = %e, "no statm"),
            }
        }
        let io = self.reader.io(pid).unwrap_or_default();
        let freq_khz = self.reader.cpu_freq_khz(stat.last_cpu).unwrap_or(0);
        Ok(Some(PidSample {
            ppid: stat.ppid,
            user_ms: self.reader.ticks_to_ms(stat.utime),
            sys_ms: self.reader.ticks_to_ms(stat.stime),
            rss,
            vsize: stat.vsize,
            majflt: stat.majflt,
            rchar: io.rchar,
            wchar: io.wchar,
            freq_khz,
        }))
    }

    fn read_all(&self, pids: &[u32]) -> BTreeMap<u32, PidSample> {
        let mut out = BTreeMap::new();
        for &pid in pids {
            match self.read_pid(pid) {
                Ok(Some(sample)) => {
                    out.insert(pid, sample);
                }
                Ok(None) => trace!(pid, "skipping lightweight process"),
                Err(e) if e.is_vanished() => trace!(pid, error = %e, "process vanished"),
                Err(e) => debug!(pid, error = %e, "unreadable process"),
            }
        }
        out
    }

    /// Sum of `root` and every descendant seen this tick.
    fn offspring(root: u32, readings: &BTreeMap<u32, PidSample>, children: &BTreeMap<u32, Vec<u32>>) -> Option<PidSample> {
        let mut sum = *readings.get(&root)?;
        let mut stack: Vec<u32> = children.get(&root).cloned().unwrap_or_default();
        let mut visited = vec![root];
        while let Some(pid) = stack.pop() {
            if visited.contains(&pid) {
                continue;
            }
            visited.push(pid);
            if let Some(s) = readings.get(&pid) {
                sum.add(s);
            }
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids.iter().copied());
            }
        }
        Some(sum)
    }

    /// Run one tick at `now` (seconds). Returns a copy of the accumulator.
    pub fn sample(&mut self, now: u64, profile: bool) -> AcctResult<JobAcct> {
        let now = now.max(self.last_time);
        let pids = match self.tracker.pids(&self.reader) {
            Ok(pids) => pids,
            Err(e) if e.is_vanished() => {
                trace!(step = %self.step, error = %e, "step container gone");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let readings = self.read_all(&pids);
        let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for (pid, s) in &readings {
            children.entry(s.ppid).or_default().push(*pid);
        }

        let mut current = JobAcct::new(self.tres_ids.clone());
        current.node_id = self.node_id;
        let (mut tot_mem, mut tot_vmem) = (0u64, 0u64);
        for task in &mut self.tasks {
            let Some(tree) = Self::offspring(task.pid, &readings, &children) else {
                // Exited: counters keep their last value, gauges drop out.
                let mut gone = task.acct.clone();
                for id in [TRES_MEM, TRES_VMEM] {
                    if let Some(i) = gone.index_of(id as TresId) {
                        gone.usage_in.set_sample(i, UNSET, UNSET, UNSET);
                    }
                }
                current.aggregate(&gone);
                continue;
            };
            let cpu_ms = (tree.user_ms + tree.sys_ms).max(task.cpu_ms);
            let delta = cpu_ms - task.cpu_ms;
            if delta > 0 && tree.freq_khz > 0 {
                task.acct.act_cpufreq = weighted_freq(task.acct.act_cpufreq, task.freq_weight, tree.freq_khz, delta);
                task.freq_weight += delta;
                self.acct.act_cpufreq = weighted_freq(self.acct.act_cpufreq, self.freq_weight, tree.freq_khz, delta);
                self.freq_weight += delta;
            }
            task.cpu_ms = cpu_ms;

            let acct = &mut task.acct;
            acct.user_cpu_sec = tree.user_ms / 1000;
            acct.user_cpu_usec = ((tree.user_ms % 1000) * 1000) as u32;
            acct.sys_cpu_sec = tree.sys_ms / 1000;
            acct.sys_cpu_usec = ((tree.sys_ms % 1000) * 1000) as u32;
            acct.set_in_sample(TRES_CPU as TresId, cpu_ms);
            acct.set_in_sample(TRES_MEM as TresId, tree.rss);
            acct.set_in_sample(TRES_VMEM as TresId, tree.vsize);
            acct.set_in_sample(TRES_PAGES as TresId, tree.majflt);
            acct.set_in_sample(TRES_FS_DISK as TresId, tree.rchar);
            acct.set_out_sample(TRES_FS_DISK as TresId, tree.wchar);
            tot_mem += tree.rss;
            tot_vmem += tree.vsize;
            current.aggregate(acct);
        }

        self.sample_capabilities(&mut current);
        self.fold(&current);
        self.polls += 1;
        trace!(step = %self.step, pids = readings.len(), tot_mem, tot_vmem, poll = self.polls, "sampled");

        self.enforce_limits(tot_mem, tot_vmem, &pids);
        if profile && self.limits.profile {
            self.emit_profile(now, tot_mem, tot_vmem);
        }
        self.last_time = now;
        self.last_cpu_ms = self.acct.cpu_time_ms().unwrap_or(0);
        Ok(self.acct.clone())
    }

    fn sample_capabilities(&mut self, current: &mut JobAcct) {
        let node = u64::from(self.node_id);
        let mut caps = self.caps.lock();
        if let Some(energy) = caps.energy.as_mut() {
            match energy.energy_joules() {
                Ok(joules) => {
                    let base = *self.energy_base.get_or_insert(joules);
                    let used = joules.saturating_sub(base);
                    current.energy_consumed = used;
                    if let Some(i) = current.index_of(TRES_ENERGY as TresId) {
                        current.usage_in.set_sample(i, used, node, UNSET);
                    }
                }
                Err(e) => trace!(step = %self.step, error = %e, "energy read failed"),
            }
        }
        let fs = caps.filesystem.as_mut().map(|c| c.counters());
        let ic = caps.interconnect.as_mut().map(|c| c.counters());
        drop(caps);

        for (reading, id, base) in [
            (fs, self.fs_tres, &mut self.fs_base),
            (ic, self.ic_tres, &mut self.ic_base),
        ] {
            let (Some(reading), Some(id)) = (reading, id) else { continue };
            let counters = match reading {
                Ok(c) => c,
                Err(e) => {
                    trace!(step = %self.step, error = %e, "counter read failed");
                    continue;
                }
            };
            let start = *base.get_or_insert(counters);
            let Some(i) = current.index_of(id) else { continue };
            current
                .usage_in
                .set_sample(i, counters.read_bytes.saturating_sub(start.read_bytes), node, UNSET);
            current
                .usage_out
                .set_sample(i, counters.write_bytes.saturating_sub(start.write_bytes), node, UNSET);
        }
    }

    /// Merge a tick aggregate into the step accumulator.
    fn fold(&mut self, current: &JobAcct) {
        let mut usage_in = self.acct.usage_in.clone();
        usage_in.aggregate(&current.usage_in);
        let mut usage_out = self.acct.usage_out.clone();
        usage_out.aggregate(&current.usage_out);
        for (i, id) in self.tres_ids.iter().enumerate() {
            if is_gauge(*id) {
                continue;
            }
            if current.usage_in.tot.is_set(i) {
                usage_in.tot.set(i, current.usage_in.tot.get(i));
            }
            if current.usage_out.tot.is_set(i) {
                usage_out.tot.set(i, current.usage_out.tot.get(i));
            }
        }
        self.acct.usage_in = usage_in;
        self.acct.usage_out = usage_out;
        self.acct.user_cpu_sec = current.user_cpu_sec;
        self.acct.user_cpu_usec = current.user_cpu_usec;
        self.acct.sys_cpu_sec = current.sys_cpu_sec;
        self.acct.sys_cpu_usec = current.sys_cpu_usec;
        self.acct.energy_consumed = self.acct.energy_consumed.max(current.energy_consumed);
    }

    fn enforce_limits(&mut self, tot_mem: u64, tot_vmem: u64, pids: &[u32]) {
        let mem_limit = self.limits.mem_limit_mib.saturating_mul(MIB);
        let vmem_limit = self.limits.vmem_limit_mib.saturating_mul(MIB);
        let (used, limit, message) = if mem_limit > 0 && tot_mem > mem_limit {
            (tot_mem, mem_limit, "Exceeded job memory limit")
        } else if vmem_limit > 0 && tot_vmem > vmem_limit {
            (tot_vmem, vmem_limit, "Exceeded job virtual memory limit")
        } else {
            return;
        };
        if self.killed {
            return;
        }
        let err = AcctError::MemoryLimitExceeded {
            step: self.step,
            used,
            limit,
        };
        if self.has(AcctParam::NoOverMemoryKill) {
            if !self.over_limit_logged {
                warn!(step = %self.step, error = %err, "over limit; kill disabled");
                self.over_limit_logged = true;
            }
            return;
        }
        warn!(step = %self.step, error = %err, "cancelling step");
        self.control.notify(self.step, message);
        if let Err(e) = self.control.cancel(self.step, libc::SIGKILL, pids) {
            warn!(step = %self.step, error = %e, "cancel after memory limit failed");
        }
        self.killed = true;
    }

    fn emit_profile(&self, now: u64, tot_mem: u64, tot_vmem: u64) {
        let Some(sink) = &self.sink else { return };
        let cpu_ms = self.acct.cpu_time_ms().unwrap_or(0);
        let elapsed_ms = now.saturating_sub(self.last_time).saturating_mul(1000);
        let cpu_util = if elapsed_ms > 0 {
            cpu_ms.saturating_sub(self.last_cpu_ms) as f64 * 100.0 / elapsed_ms as f64
        } else {
            0.0
        };
        let counter = |id: usize, out: bool| {
            let usage = if out { &self.acct.usage_out } else { &self.acct.usage_in };
            let v = usage.tot.get(id);
            if v == UNSET { 0 } else { v }
        };
        let row = ProfileRow {
            timestamp: now,
            cpu_freq: self.acct.act_cpufreq,
            cpu_time: cpu_ms as f64 / 1000.0,
            cpu_util,
            rss: tot_mem,
            vm_size: tot_vmem,
            pages: counter(TRES_PAGES, false),
            read_mb: counter(TRES_FS_DISK, false) as f64 / MIB as f64,
            write_mb: counter(TRES_FS_DISK, true) as f64 / MIB as f64,
        };
        sink.record(self.step, &row);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capability::{Capability, EnergySampler};
    use crate::proc::tests::{FakeProc, write_freq, write_proc};
    use crate::profile::MemorySink;
    use crate::tracker::PgidTracker;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Default)]
    pub(crate) struct RecordingControl {
        pub calls: Mutex<Vec<String>>,
    }

    impl StepControl for RecordingControl {
        fn notify(&self, step: StepKey, message: &str) {
            self.calls.lock().push(format!("notify {step} {message}"));
        }

        fn cancel(&self, step: StepKey, signal: i32, _pids: &[u32]) -> AcctResult<()> {
            self.calls.lock().push(format!("cancel {step} {signal}"));
            Ok(())
        }
    }

    struct FixedEnergy(u64);

    impl Capability for FixedEnergy {
        fn name(&self) -> &'static str {
            "energy/fixed"
        }
    }

    impl EnergySampler for FixedEnergy {
        fn energy_joules(&mut self) -> AcctResult<u64> {
            self.0 += 10;
            Ok(self.0)
        }
    }

    struct Fixture {
        proc_dir: TempDir,
        sys_dir: TempDir,
        control: Arc<RecordingControl>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                proc_dir: TempDir::new().unwrap(),
                sys_dir: TempDir::new().unwrap(),
                control: Arc::new(RecordingControl::default()),
            }
        }

        fn sampler(&self, params: Vec<AcctParam>, limits: StepLimits, caps: Capabilities) -> StepSampler {
            let reader = ProcReader::new(self.proc_dir.path(), self.sys_dir.path());
            StepSampler::new(
                StepKey::new(7, 0),
                3,
                reader,
                Box::new(PgidTracker::new()),
                Arc::new(Mutex::new(caps)),
                self.control.clone(),
                params,
                limits,
            )
        }

        fn write(&self, p: &FakeProc) {
            write_proc(self.proc_dir.path(), p);
        }
    }

    fn proc_with(pid: u32, ppid: u32, utime: u64, rss_mib: u64) -> FakeProc {
        let mut p = FakeProc::new(pid, ppid);
        p.pgrp = if ppid > 1 { ppid } else { pid };
        p.utime = utime;
        p.rss_pages = rss_mib * MIB / 4096;
        p.vsize = rss_mib * 2 * MIB;
        p
    }

    #[test]
    fn offspring_are_summed_into_the_task() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 10));
        fx.write(&proc_with(101, 100, 50, 5));
        fx.write(&proc_with(300, 1, 999, 99));

        let mut s = fx.sampler(Vec::new(), StepLimits::default(), Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        let acct = s.sample(10, false).unwrap();
        assert_eq!(acct.cpu_time_ms(), Some(1500));
        assert_eq!(acct.max_rss(), Some(15 * MIB));
        assert_eq!(acct.usage_in.max_task.get(TRES_MEM), 0);
        assert_eq!(acct.usage_in.max_node.get(TRES_MEM), 3);
        assert_eq!(acct.user_cpu_sec, 1);
        assert_eq!(acct.user_cpu_usec, 500_000);
    }

    #[test]
    fn lightweight_processes_are_skipped() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 10));
        let mut lwp = proc_with(101, 100, 100, 10);
        lwp.tgid = 100;
        fx.write(&lwp);

        let mut s = fx.sampler(Vec::new(), StepLimits::default(), Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        let acct = s.sample(10, false).unwrap();
        assert_eq!(acct.cpu_time_ms(), Some(1000));
    }

    #[test]
    fn counters_are_monotonic_and_gauges_accumulate() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 10));
        let mut s = fx.sampler(Vec::new(), StepLimits::default(), Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        let first = s.sample(10, false).unwrap();

        fx.write(&proc_with(100, 1, 300, 30));
        let second = s.sample(20, false).unwrap();
        assert!(second.cpu_time_ms() >= first.cpu_time_ms());
        assert_eq!(second.cpu_time_ms(), Some(3000));
        assert_eq!(second.max_rss(), Some(30 * MIB));
        assert_eq!(second.usage_in.min.get(TRES_MEM), 10 * MIB);
        assert_eq!(second.ave(TRES_MEM as TresId, s.polls()), Some(20 * MIB));
    }

    #[test]
    fn vanished_task_keeps_its_cpu_time() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 10));
        let mut s = fx.sampler(Vec::new(), StepLimits::default(), Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        s.sample(10, false).unwrap();

        fs::remove_dir_all(fx.proc_dir.path().join("100")).unwrap();
        let acct = s.sample(20, false).unwrap();
        assert_eq!(acct.cpu_time_ms(), Some(1000));
        // Only the first tick contributed RSS.
        assert_eq!(acct.usage_in.tot.get(TRES_MEM), 10 * MIB);
    }

    #[test]
    fn cpu_frequency_is_weighted_by_cpu_time() {
        let fx = Fixture::new();
        write_freq(fx.sys_dir.path(), 0, 1_000_000);
        write_freq(fx.sys_dir.path(), 1, 3_000_000);
        let mut p = proc_with(100, 1, 100, 1);
        fx.write(&p);
        let mut s = fx.sampler(Vec::new(), StepLimits::default(), Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        assert_eq!(s.sample(10, false).unwrap().act_cpufreq, 1_000_000);

        // 1 s more CPU time at 3 GHz: equal weights.
        p.utime = 200;
        p.cpu = 1;
        fx.write(&p);
        assert_eq!(s.sample(20, false).unwrap().act_cpufreq, 2_000_000);
    }

    #[test]
    fn memory_limit_notifies_then_kills_once() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 150));
        let limits = StepLimits {
            mem_limit_mib: 100,
            ..StepLimits::default()
        };
        let mut s = fx.sampler(Vec::new(), limits, Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        s.sample(10, false).unwrap();
        s.sample(20, false).unwrap();

        let calls = fx.control.calls.lock().clone();
        assert_eq!(
            calls,
            vec![
                "notify 7.0 Exceeded job memory limit".to_string(),
                format!("cancel 7.0 {}", libc::SIGKILL),
            ]
        );
        assert!(s.killed());
    }

    #[test]
    fn no_over_memory_kill_only_logs() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 150));
        let limits = StepLimits {
            mem_limit_mib: 100,
            ..StepLimits::default()
        };
        let mut s = fx.sampler(vec![AcctParam::NoOverMemoryKill], limits, Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        s.sample(10, false).unwrap();
        assert!(fx.control.calls.lock().is_empty());
        assert!(!s.killed());
    }

    #[test]
    fn no_share_subtracts_shared_pages() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 1));
        let mut s = fx.sampler(vec![AcctParam::NoShare], StepLimits::default(), Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        // The fake statm reports 16 shared pages.
        assert_eq!(s.sample(10, false).unwrap().max_rss(), Some(MIB - 16 * 4096));
    }

    #[test]
    fn energy_is_relative_to_the_first_tick() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 1));
        let caps = Capabilities {
            energy: Some(Box::new(FixedEnergy(1000))),
            ..Capabilities::none()
        };
        let mut s = fx.sampler(Vec::new(), StepLimits::default(), caps);
        s.add_task(100, 3, 0).unwrap();
        assert_eq!(s.sample(10, false).unwrap().energy_consumed, 0);
        let acct = s.sample(20, false).unwrap();
        assert_eq!(acct.energy_consumed, 10);
        assert_eq!(acct.usage_in.tot.get(TRES_ENERGY), 10);
    }

    #[test]
    fn profile_rows_only_when_enabled_and_requested() {
        let fx = Fixture::new();
        fx.write(&proc_with(100, 1, 100, 4));
        let sink = Arc::new(MemorySink::new());
        let limits = StepLimits {
            profile: true,
            ..StepLimits::default()
        };
        let mut s = fx
            .sampler(Vec::new(), limits, Capabilities::none())
            .with_sink(sink.clone());
        s.add_task(100, 3, 0).unwrap();
        s.sample(10, false).unwrap();
        assert!(sink.rows().is_empty());

        s.sample(20, true).unwrap();
        let rows = sink.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.timestamp, 20);
        assert_eq!(rows[0].1.rss, 4 * MIB);
        assert_eq!(rows[0].1.cpu_time, 1.0);
    }

    #[test]
    fn duplicate_and_zero_pids_are_rejected() {
        let fx = Fixture::new();
        let mut s = fx.sampler(Vec::new(), StepLimits::default(), Capabilities::none());
        s.add_task(100, 3, 0).unwrap();
        assert!(matches!(s.add_task(100, 3, 1), Err(AcctError::BadPid(100))));
        assert!(matches!(s.add_task(0, 3, 1), Err(AcctError::BadPid(0))));
    }
}
