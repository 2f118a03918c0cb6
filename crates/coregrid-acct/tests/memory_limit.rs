//! Step accounting through `StepManager` against a fake proc tree.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use coregrid_acct::{
    AcctResult, Capabilities, MemorySink, ProcReader, StepControl, StepKey, StepLimits, StepManager,
};
use coregrid_core::AcctParam;
use parking_lot::Mutex;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl StepControl for Recorder {
    fn notify(&self, step: StepKey, message: &str) {
        self.calls.lock().push(format!("notify {step}: {message}"));
    }

    fn cancel(&self, step: StepKey, signal: i32, pids: &[u32]) -> AcctResult<()> {
        self.calls.lock().push(format!("cancel {step} sig={signal} pids={pids:?}"));
        Ok(())
    }
}

/// Minimal `/proc/<pid>` entry: CPU ticks and resident MiB. Children share
/// the parent's process group.
fn write_pid(root: &Path, pid: u32, ppid: u32, utime: u64, rss_mib: u64) {
    let pgrp = if ppid > 1 { ppid } else { pid };
    let dir = root.join(pid.to_string());
    fs::create_dir_all(&dir).unwrap();
    let mut tail = vec!["0".to_string(); 37];
    tail[0] = "R".to_string();
    tail[1] = ppid.to_string();
    tail[2] = pgrp.to_string();
    tail[11] = utime.to_string();
    tail[20] = (rss_mib * 2 * MIB).to_string();
    tail[21] = (rss_mib * MIB / 4096).to_string();
    fs::write(dir.join("stat"), format!("{pid} (worker) {}\n", tail.join(" "))).unwrap();
    fs::write(dir.join("status"), format!("Tgid:\t{pid}\n")).unwrap();
}

fn manager(proc_root: &Path, control: Arc<Recorder>, params: Vec<AcctParam>) -> StepManager {
    StepManager::new(ProcReader::new(proc_root, proc_root), Capabilities::none(), control, params)
}

#[test]
fn step_over_its_memory_limit_is_cancelled_once() {
    let proc_dir = TempDir::new().unwrap();
    write_pid(proc_dir.path(), 4000, 1, 100, 64);
    let control = Arc::new(Recorder::default());
    let m = manager(proc_dir.path(), control.clone(), Vec::new());
    let step = StepKey::new(42, 1);
    let limits = StepLimits {
        mem_limit_mib: 100,
        ..StepLimits::default()
    };
    m.step_add_task(step, 4000, 0, 0, Some(limits)).unwrap();

    m.step_poll(step, false).unwrap();
    assert!(control.calls.lock().is_empty());

    // A child pushes the task tree to 128 MiB.
    write_pid(proc_dir.path(), 4001, 4000, 10, 64);
    m.step_poll(step, false).unwrap();
    m.step_poll(step, false).unwrap();

    let calls = control.calls.lock().clone();
    assert_eq!(calls.len(), 2, "{calls:?}");
    assert_eq!(calls[0], "notify 42.1: Exceeded job memory limit");
    assert!(calls[1].starts_with(&format!("cancel 42.1 sig={}", libc::SIGKILL)));

    let acct = m.step_end(step).unwrap();
    assert_eq!(acct.max_rss(), Some(128 * MIB));
    assert_eq!(acct.cpu_time_ms(), Some(1100));
}

#[test]
fn no_over_memory_kill_leaves_the_step_running() {
    let proc_dir = TempDir::new().unwrap();
    write_pid(proc_dir.path(), 4000, 1, 100, 256);
    let control = Arc::new(Recorder::default());
    let m = manager(proc_dir.path(), control.clone(), vec![AcctParam::NoOverMemoryKill]);
    let step = StepKey::new(42, 2);
    let limits = StepLimits {
        mem_limit_mib: 100,
        ..StepLimits::default()
    };
    m.step_add_task(step, 4000, 0, 0, Some(limits)).unwrap();
    m.step_poll(step, false).unwrap();
    m.step_poll(step, false).unwrap();
    assert!(control.calls.lock().is_empty());
}

#[test]
fn profiling_poll_records_a_row() {
    let proc_dir = TempDir::new().unwrap();
    write_pid(proc_dir.path(), 4000, 1, 250, 8);
    let sink = Arc::new(MemorySink::new());
    let m = manager(proc_dir.path(), Arc::new(Recorder::default()), Vec::new()).with_sink(sink.clone());
    let step = StepKey::new(7, 0);
    let limits = StepLimits {
        profile: true,
        ..StepLimits::default()
    };
    m.step_add_task(step, 4000, 0, 0, Some(limits)).unwrap();
    m.step_poll(step, true).unwrap();

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, step);
    assert_eq!(rows[0].1.rss, 8 * MIB);
    assert_eq!(rows[0].1.cpu_time, 2.5);
}
