//! coregrid.toml configuration parser.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::job::PreemptMode;
use crate::node::Node;
use crate::partition::Partition;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid node: {0}")]
    Node(String),

    #[error("invalid GRES specification: {0}")]
    Gres(String),

    #[error("invalid partition: {0}")]
    Partition(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub select: SelectConfig,
    #[serde(default)]
    pub preempt: PreemptConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub acct_gather: AcctGatherConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

/// Consumable resource granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrType {
    #[default]
    Core,
    /// Whole sockets are allocated once any core of them is used.
    Socket,
    /// Individual hardware threads are allocatable.
    Cpu,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectConfig {
    pub cr_type: CrType,
    /// Track memory as a consumable resource.
    pub cr_memory: bool,
    pub one_task_per_core: bool,
    /// Prefer least-loaded nodes.
    pub lln: bool,
    /// MiB per CPU when a job gives no memory request; 0 leaves such jobs memory-free.
    pub def_mem_per_cpu: u64,
    pub enforce_binding: bool,
    pub pack_serial_at_end: bool,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            cr_type: CrType::Core,
            cr_memory: true,
            one_task_per_core: false,
            lln: false,
            def_mem_per_cpu: 0,
            enforce_binding: false,
            pack_serial_at_end: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptConfig {
    pub mode: PreemptMode,
    pub by_partition: bool,
    /// Admin limit on reorder passes (`preempt_reorder_cnt`).
    pub reorder_count: u32,
    pub strict_order: bool,
}

impl Default for PreemptConfig {
    fn default() -> Self {
        Self {
            mode: PreemptMode::Off,
            by_partition: false,
            reorder_count: 1,
            strict_order: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Seconds added to the batching window each iteration; 0 doubles it.
    pub window_scale: u64,
    pub initial_window_secs: u64,
    pub max_wall_ms: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            window_scale: 0,
            initial_window_secs: 60,
            max_wall_ms: 2000,
        }
    }
}

/// Accounting sampler flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AcctParam {
    NoShare,
    UsePss,
    NoOverMemoryKill,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcctGatherConfig {
    pub frequency_secs: u64,
    pub params: Vec<AcctParam>,
    pub clock_ticks: u64,
    pub page_size: u64,
    pub proc_root: PathBuf,
    pub sysfs_root: PathBuf,
    /// Capability options, routed through the option registry.
    pub options: BTreeMap<String, String>,
}

impl Default for AcctGatherConfig {
    fn default() -> Self {
        Self {
            frequency_secs: 30,
            params: Vec::new(),
            clock_ticks: 100,
            page_size: 4096,
            proc_root: PathBuf::from("/proc"),
            sysfs_root: PathBuf::from("/sys"),
            options: BTreeMap::new(),
        }
    }
}

impl AcctGatherConfig {
    pub fn has_param(&self, param: AcctParam) -> bool {
        self.params.contains(&param)
    }
}

fn one() -> u16 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default = "one")]
    pub boards: u16,
    pub sockets: u16,
    pub cores_per_socket: u16,
    #[serde(default = "one")]
    pub threads_per_core: u16,
    /// MiB.
    pub real_memory: u64,
    #[serde(default)]
    pub mem_spec_limit: u64,
    #[serde(default)]
    pub core_spec_count: u16,
    #[serde(default)]
    pub gres: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    pub nodes: Vec<String>,
    #[serde(default = "one")]
    pub priority_tier: u16,
    #[serde(default = "one")]
    pub max_share: u16,
    #[serde(default)]
    pub preempt_mode: Option<PreemptMode>,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        debug!(
            path = %path.display(),
            nodes = config.nodes.len(),
            partitions = config.partitions.len(),
            "loaded cluster config"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section checks that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::Node(format!("duplicate node name {}", node.name)));
            }
        }
        let mut parts = HashSet::new();
        for part in &self.partitions {
            if !parts.insert(part.name.as_str()) {
                return Err(ConfigError::Partition(format!(
                    "duplicate partition name {}",
                    part.name
                )));
            }
            if part.max_share == 0 {
                return Err(ConfigError::Partition(format!(
                    "{}: max_share must be at least 1",
                    part.name
                )));
            }
            if let Some(missing) = part.nodes.iter().find(|n| !names.contains(n.as_str())) {
                return Err(ConfigError::Partition(format!(
                    "{}: unknown node {missing}",
                    part.name
                )));
            }
        }
        Ok(())
    }

    /// Build the frozen node inventory, ids in declaration order.
    pub fn build_nodes(&self) -> ConfigResult<Vec<Node>> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, cfg)| Node::from_config(i as u32, cfg))
            .collect()
    }

    pub fn build_partitions(&self, nodes: &[Node]) -> ConfigResult<Vec<Partition>> {
        self.partitions
            .iter()
            .enumerate()
            .map(|(i, cfg)| Partition::from_config(i as u32, cfg, nodes, self.preempt.mode))
            .collect()
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
