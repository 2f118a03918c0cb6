//! Profile rows, sinks, and the timer that paces samplers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::sampler::StepKey;

/// One profiling row for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProfileRow {
    pub timestamp: u64,
    /// kHz.
    #[serde(rename = "CPUFreq")]
    pub cpu_freq: u32,
    /// Seconds of CPU time so far.
    #[serde(rename = "CPUTime")]
    pub cpu_time: f64,
    /// Percent of one CPU since the previous row.
    #[serde(rename = "CPUUtil")]
    pub cpu_util: f64,
    /// Bytes.
    #[serde(rename = "RSS")]
    pub rss: u64,
    #[serde(rename = "VMSize")]
    pub vm_size: u64,
    pub pages: u64,
    #[serde(rename = "ReadMB")]
    pub read_mb: f64,
    #[serde(rename = "WriteMB")]
    pub write_mb: f64,
}

pub trait ProfileSink: Send + Sync {
    fn record(&self, step: StepKey, row: &ProfileRow);
}

/// Keeps rows in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<(StepKey, ProfileRow)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<(StepKey, ProfileRow)> {
        self.rows.lock().clone()
    }
}

impl ProfileSink for MemorySink {
    fn record(&self, step: StepKey, row: &ProfileRow) {
        self.rows.lock().push((step, row.clone()));
    }
}

/// Emits each row as a structured `info` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProfileSink for TracingSink {
    fn record(&self, step: StepKey, row: &ProfileRow) {
        info!(
            step = %step,
            timestamp = row.timestamp,
            cpu_freq = row.cpu_freq,
            cpu_time = row.cpu_time,
            cpu_util = row.cpu_util,
            rss = row.rss,
            vm_size = row.vm_size,
            pages = row.pages,
            read_mb = row.read_mb,
            write_mb = row.write_mb,
            "profile"
        );
    }
}

// ── Timer ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TimerState {
    tick: u64,
    shutdown: bool,
}

/// Shared tick counter plus condition variable. Samplers wait for the
/// counter to move past the tick they last handled; shutdown wakes all
/// of them.
#[derive(Debug, Clone, Default)]
pub struct ProfileTimer {
    shared: Arc<(Mutex<TimerState>, Condvar)>,
}

impl ProfileTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the tick and wake every waiter.
    pub fn tick(&self) {
        let (lock, cond) = &*self.shared;
        lock.lock().tick += 1;
        cond.notify_all();
    }

    pub fn shutdown(&self) {
        let (lock, cond) = &*self.shared;
        lock.lock().shutdown = true;
        cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.0.lock().shutdown
    }

    pub fn current(&self) -> u64 {
        self.shared.0.lock().tick
    }

    /// Block until the tick moves past `seen`. `None` once shut down.
    pub fn wait_past(&self, seen: u64) -> Option<u64> {
        let (lock, cond) = &*self.shared;
        let mut state = lock.lock();
        while !state.shutdown && state.tick <= seen {
            cond.wait(&mut state);
        }
        (!state.shutdown).then_some(state.tick)
    }

    /// Spawn a thread that ticks every `period` until shutdown.
    pub fn start(&self, period: Duration) -> JoinHandle<()> {
        let timer = self.clone();
        thread::spawn(move || {
            debug!(period_ms = period.as_millis() as u64, "profile timer started");
            let (lock, cond) = &*timer.shared;
            loop {
                let mut state = lock.lock();
                if state.shutdown {
                    break;
                }
                let timed_out = cond.wait_for(&mut state, period).timed_out();
                if state.shutdown {
                    break;
                }
                if timed_out {
                    state.tick += 1;
                    drop(state);
                    cond.notify_all();
                }
            }
            debug!("profile timer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_see_ticks_and_shutdown() {
        let timer = ProfileTimer::new();
        let waiter = {
            let timer = timer.clone();
            thread::spawn(move || {
                let mut seen = 0;
                let mut ticks = 0;
                while let Some(t) = timer.wait_past(seen) {
                    seen = t;
                    ticks += 1;
                }
                ticks
            })
        };
        timer.tick();
        while timer.current() < 1 {
            thread::yield_now();
        }
        timer.shutdown();
        let ticks = waiter.join().unwrap();
        assert!(ticks <= 1);
        assert!(timer.is_shutdown());
        assert_eq!(timer.wait_past(0), None);
    }

    #[test]
    fn started_timer_ticks_until_shutdown() {
        let timer = ProfileTimer::new();
        let handle = timer.start(Duration::from_millis(5));
        assert_eq!(timer.wait_past(0).map(|t| t >= 1), Some(true));
        timer.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn memory_sink_keeps_rows() {
        let sink = MemorySink::new();
        let row = ProfileRow {
            timestamp: 1,
            cpu_freq: 2_000_000,
            cpu_time: 1.5,
            cpu_util: 50.0,
            rss: 1024,
            vm_size: 4096,
            pages: 0,
            read_mb: 0.0,
            write_mb: 0.0,
        };
        sink.record(StepKey::new(1, 0), &row);
        assert_eq!(sink.rows(), vec![(StepKey::new(1, 0), row.clone())]);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["CPUFreq"], 2_000_000);
        assert_eq!(json["VMSize"], 4096);
    }
}
