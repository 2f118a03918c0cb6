//! Node capabilities the sampler calls into: energy, filesystem and
//! interconnect counters.
//!
//! Each capability reports the option keys it understands
//! (`conf_options`), accepts the merged option table (`conf_set`) and
//! reports its effective settings back (`conf_values`). The set is fixed
//! at construction in [`Capabilities`]; nothing is loaded at runtime.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{AcctError, AcctResult};
use crate::options::OptionsError;

pub trait Capability: Send {
    fn name(&self) -> &'static str;

    fn conf_options(&self) -> &'static [&'static str] {
        &[]
    }

    fn conf_set(&mut self, _table: &BTreeMap<String, String>) -> Result<(), OptionsError> {
        Ok(())
    }

    fn conf_values(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Cumulative byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

pub trait EnergySampler: Capability {
    /// Joules consumed by the node since the sampler started.
    fn energy_joules(&mut self) -> AcctResult<u64>;
}

pub trait FilesystemSampler: Capability {
    /// Sub-name of the `fs/<name>` TRES the counters land in.
    fn tres_name(&self) -> &'static str;
    fn counters(&mut self) -> AcctResult<IoCounters>;
}

pub trait InterconnectSampler: Capability {
    /// Sub-name of the `ic/<name>` TRES the counters land in.
    fn tres_name(&self) -> &'static str;
    fn counters(&mut self) -> AcctResult<IoCounters>;
}

/// The capabilities available on this node.
#[derive(Default)]
pub struct Capabilities {
    pub energy: Option<Box<dyn EnergySampler>>,
    pub filesystem: Option<Box<dyn FilesystemSampler>>,
    pub interconnect: Option<Box<dyn InterconnectSampler>>,
}

impl Capabilities {
    pub fn none() -> Self {
        Self::default()
    }

    /// `(capability, key)` for every key some capability accepts.
    pub fn conf_options(&self) -> Vec<(&'static str, &'static str)> {
        let mut out = Vec::new();
        if let Some(c) = &self.energy {
            out.extend(c.conf_options().iter().map(|k| (c.name(), *k)));
        }
        if let Some(c) = &self.filesystem {
            out.extend(c.conf_options().iter().map(|k| (c.name(), *k)));
        }
        if let Some(c) = &self.interconnect {
            out.extend(c.conf_options().iter().map(|k| (c.name(), *k)));
        }
        out
    }

    pub fn conf_set(&mut self, table: &BTreeMap<String, String>) -> Result<(), OptionsError> {
        if let Some(c) = self.energy.as_mut() {
            c.conf_set(table)?;
        }
        if let Some(c) = self.filesystem.as_mut() {
            c.conf_set(table)?;
        }
        if let Some(c) = self.interconnect.as_mut() {
            c.conf_set(table)?;
        }
        Ok(())
    }

    pub fn conf_values(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(c) = &self.energy {
            out.extend(c.conf_values());
        }
        if let Some(c) = &self.filesystem {
            out.extend(c.conf_values());
        }
        if let Some(c) = &self.interconnect {
            out.extend(c.conf_values());
        }
        out
    }
}

fn read_u64(path: &Path) -> AcctResult<u64> {
    let text = fs::read_to_string(path).map_err(|e| AcctError::io(path, e))?;
    text.trim()
        .parse()
        .map_err(|_| AcctError::parse(path, "not an integer"))
}

// ── RAPL energy ────────────────────────────────────────────────────

/// Package energy from the powercap interface
/// (`<sysfs>/class/powercap/<zone>/energy_uj`), unwrapping counter
/// overflow with `max_energy_range_uj`.
pub struct RaplEnergy {
    sysfs_root: PathBuf,
    zone: String,
    first_uj: Option<u64>,
    last_uj: u64,
    wrapped_uj: u64,
}

impl RaplEnergy {
    pub const ZONE_KEY: &'static str = "EnergyRaplZone";

    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            zone: "intel-rapl:0".to_string(),
            first_uj: None,
            last_uj: 0,
            wrapped_uj: 0,
        }
    }

    fn zone_dir(&self) -> PathBuf {
        self.sysfs_root.join("class/powercap").join(&self.zone)
    }
}

impl Capability for RaplEnergy {
    fn name(&self) -> &'static str {
        "energy/rapl"
    }

    fn conf_options(&self) -> &'static [&'static str] {
        &[Self::ZONE_KEY]
    }

    fn conf_set(&mut self, table: &BTreeMap<String, String>) -> Result<(), OptionsError> {
        if let Some(zone) = table.get(Self::ZONE_KEY) {
            if zone.is_empty() || zone.contains('/') {
                return Err(OptionsError::InvalidValue {
                    key: Self::ZONE_KEY.to_string(),
                    value: zone.clone(),
                });
            }
            self.zone = zone.clone();
        }
        Ok(())
    }

    fn conf_values(&self) -> Vec<(String, String)> {
        vec![(Self::ZONE_KEY.to_string(), self.zone.clone())]
    }
}

impl EnergySampler for RaplEnergy {
    fn energy_joules(&mut self) -> AcctResult<u64> {
        let dir = self.zone_dir();
        let now = read_u64(&dir.join("energy_uj"))?;
        let first = *self.first_uj.get_or_insert(now);
        if now < self.last_uj {
            let range = read_u64(&dir.join("max_energy_range_uj")).unwrap_or(0);
            self.wrapped_uj += range;
            trace!(zone = %self.zone, "energy counter wrapped");
        }
        self.last_uj = now;
        Ok((self.wrapped_uj + now).saturating_sub(first) / 1_000_000)
    }
}

// ── Lustre client stats ────────────────────────────────────────────

/// Byte counters summed over every mount in
/// `<proc>/fs/lustre/llite/*/stats`.
pub struct LustreStats {
    proc_root: PathBuf,
}

impl LustreStats {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

/// Last field of a `read_bytes`/`write_bytes` stats line is the byte sum.
fn stats_bytes(line: &str) -> u64 {
    line.split_whitespace()
        .last()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

impl Capability for LustreStats {
    fn name(&self) -> &'static str {
        "filesystem/lustre"
    }
}

impl FilesystemSampler for LustreStats {
    fn tres_name(&self) -> &'static str {
        "lustre"
    }

    fn counters(&mut self) -> AcctResult<IoCounters> {
        let llite = self.proc_root.join("fs/lustre/llite");
        let entries = fs::read_dir(&llite).map_err(|e| AcctError::io(&llite, e))?;
        let mut out = IoCounters::default();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path().join("stats");
            let Ok(text) = fs::read_to_string(&path) else { continue };
            for line in text.lines() {
                if line.starts_with("read_bytes") {
                    out.read_bytes += stats_bytes(line);
                } else if line.starts_with("write_bytes") {
                    out.write_bytes += stats_bytes(line);
                }
            }
        }
        Ok(out)
    }
}

// ── InfiniBand port counters ───────────────────────────────────────

/// Port data counters of the first HCA under
/// `<sysfs>/class/infiniband`. The counters count 4-byte words.
pub struct OfedCounters {
    sysfs_root: PathBuf,
    port: u32,
}

impl OfedCounters {
    pub const PORT_KEY: &'static str = "InfinibandOFEDPort";

    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            port: 1,
        }
    }
}

impl Capability for OfedCounters {
    fn name(&self) -> &'static str {
        "interconnect/ofed"
    }

    fn conf_options(&self) -> &'static [&'static str] {
        &[Self::PORT_KEY]
    }

    fn conf_set(&mut self, table: &BTreeMap<String, String>) -> Result<(), OptionsError> {
        if let Some(value) = table.get(Self::PORT_KEY) {
            self.port = value.parse().map_err(|_| OptionsError::InvalidValue {
                key: Self::PORT_KEY.to_string(),
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    fn conf_values(&self) -> Vec<(String, String)> {
        vec![(Self::PORT_KEY.to_string(), self.port.to_string())]
    }
}

impl InterconnectSampler for OfedCounters {
    fn tres_name(&self) -> &'static str {
        "ofed"
    }

    fn counters(&mut self) -> AcctResult<IoCounters> {
        let class = self.sysfs_root.join("class/infiniband");
        let mut devices: Vec<PathBuf> = fs::read_dir(&class)
            .map_err(|e| AcctError::io(&class, e))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .collect();
        devices.sort();
        let Some(device) = devices.first() else {
            debug!(path = %class.display(), "no infiniband device");
            return Ok(IoCounters::default());
        };
        let counters = device.join("ports").join(self.port.to_string()).join("counters");
        Ok(IoCounters {
            read_bytes: read_u64(&counters.join("port_rcv_data"))? * 4,
            write_bytes: read_u64(&counters.join("port_xmit_data"))? * 4,
        })
    }
}
