//! Process trackers: which pids belong to a step.
//!
//! - [`PgidTracker`] scans the proc root and keeps processes whose group
//!   matches a registered task. It misses processes that changed group
//!   and is slower than a container lookup.
//! - [`CgroupTracker`] reads `cgroup.procs` of the step's container.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use tracing::trace;

use crate::error::{AcctError, AcctResult};
use crate::proc::ProcReader;

pub trait ProcessTracker: Send {
    /// Start tracking the process tree rooted at `pid`.
    fn add(&mut self, pid: u32);

    /// Every pid currently in the step.
    fn pids(&self, reader: &ProcReader) -> AcctResult<Vec<u32>>;
}

#[derive(Debug, Default)]
pub struct PgidTracker {
    groups: BTreeSet<u32>,
}

impl PgidTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessTracker for PgidTracker {
    fn add(&mut self, pid: u32) {
        self.groups.insert(pid);
    }

    fn pids(&self, reader: &ProcReader) -> AcctResult<Vec<u32>> {
        let mut out = Vec::new();
        for pid in reader.list_pids()? {
            match reader.stat(pid) {
                Ok(stat) if self.groups.contains(&stat.pgrp) || self.groups.contains(&pid) => out.push(pid),
                Ok(_) => {}
                Err(e) => trace!(pid, error = %e, "skipping pid during scan"),
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub struct CgroupTracker {
    dir: PathBuf,
}

impl CgroupTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ProcessTracker for CgroupTracker {
    // Membership comes from the container.
    fn add(&mut self, _pid: u32) {}

    fn pids(&self, _reader: &ProcReader) -> AcctResult<Vec<u32>> {
        let path = self.dir.join("cgroup.procs");
        let text = fs::read_to_string(&path).map_err(|e| AcctError::io(&path, e))?;
        let mut pids: Vec<u32> = text.lines().filter_map(|l| l.trim().parse().ok()).collect();
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }
}
