//! Static hardware description of a compute node.
//!
//! A [`Node`] is built once at registration and never mutated afterwards.
//! Cores are numbered socket-major: core `c` of socket `s` has index
//! `s * cores_per_socket + c`, and sockets are numbered board-major.

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::config::{ConfigError, ConfigResult, NodeConfig};

/// Index of a node in the cluster inventory.
pub type NodeId = u32;

/// Boards above this count collapse into a single board view.
pub const MAX_BOARDS: u16 = 8;

/// A block of GRES units sharing the same socket affinity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GresTopo {
    pub count: u64,
    /// Sockets these units are attached to; `None` means reachable from any socket.
    pub sockets: Option<Vec<u16>>,
}

/// One GRES type available on a node, e.g. `gpu:a100:4(S:0-1)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GresInventory {
    pub name: String,
    pub type_name: Option<String>,
    pub count: u64,
    pub topo: Vec<GresTopo>,
}

impl GresInventory {
    /// Parse `name[:type]:count[(S:list)]`.
    pub fn parse(spec: &str) -> ConfigResult<Self> {
        let spec = spec.trim();
        let (body, sockets) = match spec.find('(') {
            Some(open) => {
                let close = spec
                    .rfind(')')
                    .filter(|c| *c > open)
                    .ok_or_else(|| ConfigError::Gres(spec.to_string()))?;
                let inner = &spec[open + 1..close];
                let list = inner
                    .strip_prefix("S:")
                    .ok_or_else(|| ConfigError::Gres(spec.to_string()))?;
                (&spec[..open], Some(parse_socket_list(list, spec)?))
            }
            None => (spec, None),
        };

        let parts: Vec<&str> = body.split(':').collect();
        let (name, type_name, count) = match parts.as_slice() {
            [name] => (*name, None, "1"),
            [name, count] => (*name, None, *count),
            [name, ty, count] => (*name, Some(ty.to_string()), *count),
            _ => return Err(ConfigError::Gres(spec.to_string())),
        };
        if name.is_empty() {
            return Err(ConfigError::Gres(spec.to_string()));
        }
        let count: u64 = count
            .parse()
            .map_err(|_| ConfigError::Gres(spec.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            type_name,
            count,
            topo: vec![GresTopo { count, sockets }],
        })
    }

    /// True for the entry named `name` with exactly `type_name`.
    pub fn is_kind(&self, name: &str, type_name: Option<&str>) -> bool {
        self.name == name && self.type_name.as_deref() == type_name
    }

    /// Socket affinity of every unit, in unit order.
    pub fn unit_sockets(&self) -> Vec<Option<&[u16]>> {
        let mut out = Vec::with_capacity(self.count as usize);
        for topo in &self.topo {
            for _ in 0..topo.count {
                out.push(topo.sockets.as_deref());
            }
        }
        out.truncate(self.count as usize);
        while (out.len() as u64) < self.count {
            out.push(None);
        }
        out
    }

    /// True when unit `unit` may be reached from `socket`.
    pub fn unit_on_socket(&self, unit: usize, socket: u16) -> bool {
        let mut base = 0usize;
        for topo in &self.topo {
            let end = base + topo.count as usize;
            if unit < end {
                return match &topo.sockets {
                    Some(list) => list.contains(&socket),
                    None => true,
                };
            }
            base = end;
        }
        true
    }
}

fn parse_socket_list(list: &str, spec: &str) -> ConfigResult<Vec<u16>> {
    let mut out = Vec::new();
    for part in list.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo.parse().map_err(|_| ConfigError::Gres(spec.to_string()))?;
                let hi: u16 = hi.parse().map_err(|_| ConfigError::Gres(spec.to_string()))?;
                out.extend(lo..=hi);
            }
            None => out.push(part.parse().map_err(|_| ConfigError::Gres(spec.to_string()))?),
        }
    }
    Ok(out)
}

/// Static node properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub boards: u16,
    /// Total sockets across all boards.
    pub sockets: u16,
    pub cores_per_socket: u16,
    pub threads_per_core: u16,
    /// Usable CPUs after node-level core specialization.
    pub cpus_efctv: u32,
    /// Memory in MiB.
    pub real_memory: u64,
    /// Memory reserved for the system, MiB.
    pub mem_spec_limit: u64,
    /// Cores reserved for system use on this node.
    pub core_spec_count: u16,
    /// Threads per core used for accounting.
    pub tpc: u16,
    pub gres: Vec<GresInventory>,
}

impl Node {
    pub fn from_config(id: NodeId, cfg: &NodeConfig) -> ConfigResult<Self> {
        if cfg.sockets == 0 || cfg.cores_per_socket == 0 || cfg.threads_per_core == 0 {
            return Err(ConfigError::Node(format!(
                "{}: sockets, cores_per_socket and threads_per_core must be non-zero",
                cfg.name
            )));
        }
        let boards = cfg.boards.max(1);
        if cfg.sockets % boards != 0 {
            return Err(ConfigError::Node(format!(
                "{}: {} sockets do not divide evenly over {} boards",
                cfg.name, cfg.sockets, boards
            )));
        }
        let tot_cores = u32::from(cfg.sockets) * u32::from(cfg.cores_per_socket);
        if u32::from(cfg.core_spec_count) >= tot_cores {
            return Err(ConfigError::Node(format!(
                "{}: core_spec_count {} leaves no usable cores",
                cfg.name, cfg.core_spec_count
            )));
        }
        if cfg.mem_spec_limit > cfg.real_memory {
            return Err(ConfigError::Node(format!(
                "{}: mem_spec_limit exceeds real_memory",
                cfg.name
            )));
        }
        let gres = cfg
            .gres
            .iter()
            .map(|g| GresInventory::parse(g))
            .collect::<ConfigResult<Vec<_>>>()?;
        for (i, g) in gres.iter().enumerate() {
            if gres[..i].iter().any(|p| p.is_kind(&g.name, g.type_name.as_deref())) {
                return Err(ConfigError::Gres(format!("{}: gres/{} listed twice", cfg.name, g.name)));
            }
        }

        Ok(Self {
            id,
            name: cfg.name.clone(),
            boards,
            sockets: cfg.sockets,
            cores_per_socket: cfg.cores_per_socket,
            threads_per_core: cfg.threads_per_core,
            cpus_efctv: (tot_cores - u32::from(cfg.core_spec_count))
                * u32::from(cfg.threads_per_core),
            real_memory: cfg.real_memory,
            mem_spec_limit: cfg.mem_spec_limit,
            core_spec_count: cfg.core_spec_count,
            tpc: cfg.threads_per_core,
            gres,
        })
    }

    pub fn tot_cores(&self) -> u32 {
        u32::from(self.sockets) * u32::from(self.cores_per_socket)
    }

    pub fn cpus(&self) -> u32 {
        self.tot_cores() * u32::from(self.threads_per_core)
    }

    /// Boards as seen by the chooser; above [`MAX_BOARDS`] the node is
    /// treated as a single board.
    pub fn effective_boards(&self) -> u16 {
        if self.boards > MAX_BOARDS { 1 } else { self.boards.max(1) }
    }

    pub fn sockets_per_board(&self) -> u16 {
        self.sockets / self.effective_boards()
    }

    /// Core index range `[lo, hi)` of socket `s`.
    pub fn socket_range(&self, s: u16) -> (usize, usize) {
        let cps = usize::from(self.cores_per_socket);
        let lo = usize::from(s) * cps;
        (lo, lo + cps)
    }

    pub fn socket_of_core(&self, core: usize) -> u16 {
        (core / usize::from(self.cores_per_socket)) as u16
    }

    /// Board holding socket `s` in the effective board view.
    pub fn board_of_socket(&self, s: u16) -> u16 {
        s / self.sockets_per_board()
    }

    /// Memory available to jobs (MiB).
    pub fn usable_memory(&self) -> u64 {
        self.real_memory.saturating_sub(self.mem_spec_limit)
    }

    /// Mask of `count` specialized cores: highest-numbered cores first,
    /// spread round-robin starting from the last socket.
    pub fn spec_core_mask(&self, count: u16) -> Bitmap {
        let mut mask = Bitmap::new(self.tot_cores() as usize);
        let count = u32::from(count).min(self.tot_cores());
        let sockets = u32::from(self.sockets);
        let cps = u32::from(self.cores_per_socket);
        for i in 0..count {
            let socket = sockets - 1 - (i % sockets);
            let core = cps - 1 - (i / sockets);
            mask.set((socket * cps + core) as usize);
        }
        mask
    }

    /// Cores this node offers to the scheduler: all cores minus the
    /// node-level specialized ones.
    pub fn schedulable_cores(&self) -> Bitmap {
        let mut cores = Bitmap::full(self.tot_cores() as usize);
        if self.core_spec_count > 0 {
            let spec = self.spec_core_mask(self.core_spec_count);
            // Same size by construction.
            let _ = cores.and_not(&spec);
        }
        cores
    }

    pub fn gres(&self, name: &str) -> Option<&GresInventory> {
        self.gres.iter().find(|g| g.name == name)
    }
}
