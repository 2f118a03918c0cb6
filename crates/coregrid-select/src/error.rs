//! Placement error types.

use thiserror::Error;

use coregrid_core::JobId;

/// Errors that can occur during placement and allocation bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no resources available: {0}")]
    NoResources(String),

    #[error("job {0} is making no progress; held with priority 0 (Wait)")]
    HeldNoPriority(JobId),

    #[error("node {0} cannot hold the requested memory")]
    NodeMemoryExceeded(String),

    #[error("GRES request cannot be satisfied: {0}")]
    GresInfeasible(String),

    #[error("preemption reorder did not converge after {0} passes")]
    PreemptionWouldLoop(u32),

    #[error("job {0} is already committed")]
    AlreadyCommitted(JobId),

    #[error("allocation conflict: {0}")]
    Conflict(String),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("placement cancelled")]
    Cancelled,
}

pub type SelectResult<T> = Result<T, SelectError>;
