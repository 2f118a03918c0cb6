//! coregrid-core — shared domain types for the coregrid workload manager.
//!
//! # Components
//!
//! - **`bitmap`**: Fixed-width node and core bitsets
//! - **`tres`**: TRES table, usage vectors and assignment lists
//! - **`node`**: Frozen node inventory and GRES topology
//! - **`partition`**: Partition definitions
//! - **`job`**: Job requests and granted resources
//! - **`acct`**: Step accounting record
//! - **`config`**: `coregrid.toml` parsing

pub mod acct;
pub mod bitmap;
pub mod config;
pub mod job;
pub mod node;
pub mod partition;
pub mod tres;

pub use acct::{JobAcct, TresUsage};
pub use bitmap::{Bitmap, BitmapError, BitmapResult};
pub use config::{
    AcctGatherConfig, AcctParam, BackfillConfig, ClusterConfig, ConfigError, ConfigResult, CrType,
    NodeConfig, PartitionConfig, PreemptConfig, SelectConfig,
};
pub use job::{
    CoreFamily, GresAlloc, GresRequest, JobId, JobRequest, JobResources, NodeDist, NodeShareState,
    PreemptMode, SocketDist, TaskDist, WholeNode,
};
pub use node::{GresInventory, GresTopo, MAX_BOARDS, Node, NodeId};
pub use partition::{Partition, PartitionId};
pub use tres::{TresCount, TresError, TresId, TresList, TresResult, TresTable, TresVec, UNSET};
