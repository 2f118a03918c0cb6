//! coregrid-acct — per-step resource accounting for the coregrid
//! workload manager.
//!
//! # Components
//!
//! - **`proc`**: Readers for `/proc/<pid>` and cpufreq sysfs files
//! - **`tracker`**: Which pids belong to a step (process group or cgroup)
//! - **`capability`**: Node-level energy, filesystem and interconnect samplers
//! - **`options`**: The merged acct_gather option table
//! - **`sampler`**: One step's accumulator and its sampling tick
//! - **`signal`**: Limit notifications and step cancellation
//! - **`profile`**: Profile rows, sinks and the shared timer
//! - **`manager`**: `StepManager`, the add/poll/end entry points
//!
//! # Architecture
//!
//! ```text
//!  ProfileTimer ──tick──► sampler thread (one per step)
//!                              │
//!  step_poll ──────────────────┤
//!                              ▼
//!                        StepSampler::sample
//!                   tracker ─► proc ─► capabilities
//!                              │
//!                              ├─► JobAcct (step aggregate)
//!                              ├─► StepControl (memory limit)
//!                              └─► ProfileSink
//! ```

pub mod capability;
pub mod error;
pub mod manager;
pub mod options;
pub mod proc;
pub mod profile;
pub mod sampler;
pub mod signal;
pub mod tracker;

pub use capability::{
    Capabilities, Capability, EnergySampler, FilesystemSampler, InterconnectSampler, IoCounters,
    LustreStats, OfedCounters, RaplEnergy,
};
pub use error::{AcctError, AcctResult};
pub use manager::{StepManager, Tracking};
pub use options::{AcctGatherOptions, OptionsError};
pub use proc::ProcReader;
pub use profile::{MemorySink, ProfileRow, ProfileSink, ProfileTimer, TracingSink};
pub use sampler::{StepKey, StepLimits, StepSampler};
pub use signal::{LocalControl, StepControl};
pub use tracker::{CgroupTracker, PgidTracker, ProcessTracker};
