//! `/proc` and sysfs readers.
//!
//! Every read goes through [`ProcReader`], rooted at a configurable
//! directory so tests can point it at a fake tree. A file that vanishes
//! mid-read surfaces as [`AcctError::SamplerIo`]; callers drop the pid for
//! that tick.

use std::fs;
use std::path::{Path, PathBuf};

use coregrid_core::AcctGatherConfig;

use crate::error::{AcctError, AcctResult};

/// Fields of `/proc/<pid>/stat` up to `processor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    pub pgrp: u32,
    pub majflt: u64,
    /// Clock ticks.
    pub utime: u64,
    pub stime: u64,
    /// Bytes.
    pub vsize: u64,
    /// Pages.
    pub rss: u64,
    pub last_cpu: u32,
}

/// `rchar`/`wchar` of `/proc/<pid>/io`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcIo {
    pub rchar: u64,
    pub wchar: u64,
}

#[derive(Debug, Clone)]
pub struct ProcReader {
    proc_root: PathBuf,
    sysfs_root: PathBuf,
    pub clock_ticks: u64,
    pub page_size: u64,
}

// Offsets into the whitespace-split tail of `stat`, which starts at field 3.
const STAT_STATE: usize = 0;
const STAT_PPID: usize = 1;
const STAT_PGRP: usize = 2;
const STAT_MAJFLT: usize = 9;
const STAT_UTIME: usize = 11;
const STAT_STIME: usize = 12;
const STAT_VSIZE: usize = 20;
const STAT_RSS: usize = 21;
const STAT_PROCESSOR: usize = 36;

impl ProcReader {
    pub fn new(proc_root: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sysfs_root: sysfs_root.into(),
            clock_ticks: 100,
            page_size: 4096,
        }
    }

    pub fn from_config(cfg: &AcctGatherConfig) -> Self {
        Self {
            proc_root: cfg.proc_root.clone(),
            sysfs_root: cfg.sysfs_root.clone(),
            clock_ticks: cfg.clock_ticks.max(1),
            page_size: cfg.page_size.max(1),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    fn pid_path(&self, pid: u32, file: &str) -> PathBuf {
        self.proc_root.join(pid.to_string()).join(file)
    }

    fn read(&self, path: &Path) -> AcctResult<String> {
        fs::read_to_string(path).map_err(|e| AcctError::io(path, e))
    }

    /// Numeric entries of the proc root.
    pub fn list_pids(&self) -> AcctResult<Vec<u32>> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| AcctError::io(&self.proc_root, e))?;
        let mut pids: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    pub fn stat(&self, pid: u32) -> AcctResult<ProcStat> {
        let path = self.pid_path(pid, "stat");
        let text = self.read(&path)?;
        parse_stat(&text).ok_or_else(|| AcctError::parse(&path, "unexpected stat layout"))
    }

    /// Thread-group id from `status`. A pid whose tgid differs is a
    /// lightweight process.
    pub fn tgid(&self, pid: u32) -> AcctResult<u32> {
        let path = self.pid_path(pid, "status");
        let text = self.read(&path)?;
        text.lines()
            .find_map(|l| l.strip_prefix("Tgid:"))
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| AcctError::parse(&path, "no Tgid line"))
    }

    pub fn io(&self, pid: u32) -> AcctResult<ProcIo> {
        let path = self.pid_path(pid, "io");
        let text = self.read(&path)?;
        let mut io = ProcIo::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else { continue };
            let value: u64 = value.trim().parse().unwrap_or(0);
            match key.trim() {
                "rchar" => io.rchar = value,
                "wchar" => io.wchar = value,
                _ => {}
            }
        }
        Ok(io)
    }

    /// Shared resident pages (third field of `statm`).
    pub fn shared_pages(&self, pid: u32) -> AcctResult<u64> {
        let path = self.pid_path(pid, "statm");
        let text = self.read(&path)?;
        text.split_whitespace()
            .nth(2)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| AcctError::parse(&path, "too few statm fields"))
    }

    /// Proportional set size in bytes, from `smaps_rollup` or by summing
    /// the `Pss:` lines of `smaps`.
    pub fn pss_bytes(&self, pid: u32) -> AcctResult<u64> {
        let rollup = self.pid_path(pid, "smaps_rollup");
        let text = match fs::read_to_string(&rollup) {
            Ok(text) => text,
            Err(_) => self.read(&self.pid_path(pid, "smaps"))?,
        };
        let kib: u64 = text
            .lines()
            .filter_map(|l| l.strip_prefix("Pss:"))
            .filter_map(|v| v.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .sum();
        Ok(kib * 1024)
    }

    /// Current frequency of `cpu` in kHz.
    pub fn cpu_freq_khz(&self, cpu: u32) -> AcctResult<u32> {
        let path = self
            .sysfs_root
            .join("devices/system/cpu")
            .join(format!("cpu{cpu}"))
            .join("cpufreq/scaling_cur_freq");
        let text = self.read(&path)?;
        text.trim()
            .parse()
            .map_err(|_| AcctError::parse(&path, "not a frequency"))
    }

    /// Ticks to milliseconds.
    pub fn ticks_to_ms(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(1000) / self.clock_ticks
    }
}

/// Parse a `stat` line. `comm` may contain spaces and parentheses, so
/// the fixed fields are taken after the last `)`.
pub fn parse_stat(text: &str) -> Option<ProcStat> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    if close < open {
        return None;
    }
    let pid = text[..open].trim().parse().ok()?;
    let comm = text[open + 1..close].to_string();
    let rest: Vec<&str> = text[close + 1..].split_whitespace().collect();
    if rest.len() <= STAT_PROCESSOR {
        return None;
    }
    let num = |i: usize| rest[i].parse::<u64>().ok();
    Some(ProcStat {
        pid,
        comm,
        state: rest[STAT_STATE].chars().next()?,
        ppid: num(STAT_PPID)? as u32,
        pgrp: num(STAT_PGRP)? as u32,
        majflt: num(STAT_MAJFLT)?,
        utime: num(STAT_UTIME)?,
        stime: num(STAT_STIME)?,
        vsize: num(STAT_VSIZE)?,
        rss: rest[STAT_RSS].parse::<i64>().ok()?.max(0) as u64,
        last_cpu: num(STAT_PROCESSOR)? as u32,
    })
}
