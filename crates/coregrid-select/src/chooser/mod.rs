//! Core chooser: turn a node's free cores into the concrete cores a job
//! receives.
//!
//! Two families share one entry point:
//!
//! - **block** ([`block`]) packs cores onto as few boards and sockets as
//!   possible, best fit first.
//! - **cyclic** ([`cyclic`]) walks sockets round-robin, one core (or one
//!   whole task) per visit.
//!
//! The caller decides how many CPUs a node carries; the chooser only
//! decides which cores hold them and how many CPUs that amounts to under
//! the configured allocation granularity.

pub mod block;
pub mod cyclic;

use coregrid_core::{Bitmap, CoreFamily, CrType, JobRequest, Node, SelectConfig};
use tracing::trace;

use crate::avail::AvailRes;

/// Cores picked on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreChoice {
    pub cores: Bitmap,
    /// CPUs recorded for the node, in hardware threads.
    pub cpus: u32,
    /// CPUs the tasks actually run on, before granularity rounding.
    pub task_cpus: u32,
}

/// Per-socket core budget: free cores capped by the per-socket CPU cap.
fn socket_budget(avail: &AvailRes) -> Vec<u32> {
    let vpus = u32::from(avail.vpus.max(1));
    avail
        .sock_cores
        .iter()
        .zip(&avail.sock_cpus)
        .map(|(cores, cpus)| (*cores).min(cpus.div_ceil(vpus)))
        .collect()
}

/// Highest `count` free cores of socket `s`.
fn take_cores(node: &Node, free: &Bitmap, s: u16, count: u32, out: &mut Bitmap) -> u32 {
    let (lo, hi) = node.socket_range(s);
    let mut taken = 0;
    for core in (lo..hi).rev() {
        if taken == count {
            break;
        }
        if free.test(core) && !out.test(core) {
            out.set(core);
            taken += 1;
        }
    }
    taken
}

/// Choose cores for `cpus` CPUs on `node`. `None` means the chooser made
/// no progress with the cores on offer.
pub fn choose(
    family: CoreFamily,
    node: &Node,
    avail: &AvailRes,
    cpus: u32,
    req: &JobRequest,
    cfg: &SelectConfig,
) -> Option<CoreChoice> {
    let vpus = u32::from(avail.vpus.max(1));
    let hw_threads = u32::from(node.threads_per_core.max(1));

    if avail.whole {
        let cores = avail.free_cores.clone();
        let count = cores.count() as u32;
        return Some(CoreChoice {
            cores,
            cpus: count * hw_threads,
            task_cpus: cpus,
        });
    }

    let needed = cpus.div_ceil(vpus);
    let picked = match family {
        CoreFamily::Block => block::pick(node, avail, needed),
        CoreFamily::Cyclic => cyclic::pick(node, avail, cpus, req.cpus_per_task()),
    };
    let Some(mut cores) = picked else {
        trace!(node = %node.name, cpus, ?family, "chooser made no progress");
        return None;
    };

    let count = cores.count() as u32;
    let recorded = match cfg.cr_type {
        CrType::Socket => {
            for s in 0..node.sockets {
                let (lo, hi) = node.socket_range(s);
                if cores.count_range(lo, hi) > 0 {
                    for core in avail.free_cores.iter_set().filter(|c| (lo..hi).contains(c)) {
                        cores.set(core);
                    }
                }
            }
            cores.count() as u32 * hw_threads
        }
        CrType::Cpu => cpus,
        CrType::Core => count * vpus,
    };
    let recorded = if req.threads_per_core > 0 && req.threads_per_core < node.threads_per_core {
        cores.count() as u32 * hw_threads
    } else {
        recorded
    };
    Some(CoreChoice {
        cores,
        cpus: recorded.max(cpus),
        task_cpus: cpus,
    })
}
