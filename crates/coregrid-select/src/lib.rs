//! coregrid-select — consumable-resource placement for the coregrid
//! workload manager.
//!
//! # Components
//!
//! - **`snapshot`**: Per-partition rows of allocated cores, per-node memory and GRES usage
//! - **`gres`**: GRES feasibility per node and unit picking
//! - **`filter`**: Drops nodes that cannot host a job at all
//! - **`avail`**: What each remaining node can offer
//! - **`eval`**: Which nodes the job receives
//! - **`dist`**: Tasks and CPUs per selected node
//! - **`chooser`**: Concrete cores per node (block and cyclic families)
//! - **`driver`**: The stepwise fit over widening views of existing allocations
//! - **`preempt`**: Preemption simulation on a cloned snapshot
//! - **`willrun`**: Earliest start time for backfill
//! - **`engine`**: `SelectEngine`, owner of the committed state
//!
//! # Architecture
//!
//! ```text
//!  JobRequest ──► SelectEngine::place_job
//!                   │  sched lock + read lock
//!                   ▼
//!                 Driver ── filter ─► avail ─► eval ─► dist ─► chooser ─► gres
//!                   │
//!                   ├─ steps 0–4        (driver)
//!                   ├─ step 5           (preempt, cloned snapshot)
//!                   └─ will-run         (willrun, cloned snapshot)
//!                   ▼
//!                 Placement ──► SelectEngine::commit_allocation
//!                                  sched lock + write lock, epoch += 1
//! ```

pub mod avail;
pub mod chooser;
pub mod dist;
pub mod driver;
pub mod engine;
pub mod error;
pub mod eval;
pub mod filter;
pub mod gres;
pub mod inventory;
pub mod preempt;
pub mod snapshot;
pub mod willrun;

pub use driver::{CancelToken, PlacementConfig};
pub use engine::{GresState, NodeState, PlaceMode, Placement, ReleaseMode, SelectEngine};
pub use error::{SelectError, SelectResult};
pub use inventory::Inventory;
pub use snapshot::{AllocSnapshot, AllocState, JobRecord, Scope};
