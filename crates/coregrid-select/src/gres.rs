//! GRES selector: per-node feasibility and unit picking for a job's
//! generic-resource requests.
//!
//! Feasibility runs before core selection and answers three questions for
//! a node: how many sockets the request spans at minimum, the fewest CPUs
//! that can host it, and (for per-task requests) how many tasks the node
//! can carry. Unit picking runs after the task layout is known.

use coregrid_core::{Bitmap, GresInventory, GresRequest, JobRequest, Node};
use tracing::trace;

use crate::snapshot::NodeUsage;

/// Outcome of GRES feasibility on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GresFit {
    /// Minimum number of sockets whose units cover the request.
    pub sockets_required: u16,
    /// Sockets from which the requested units are reachable; `None` when
    /// binding is not enforced and every socket qualifies.
    pub allowed_sockets: Option<Vec<bool>>,
    pub min_cpus: u32,
    /// Max tasks on the node when a per-task request is present.
    pub per_task_limit: Option<u32>,
}

impl GresFit {
    /// Fit for a job without GRES requests.
    pub fn unconstrained() -> Self {
        Self {
            sockets_required: 0,
            allowed_sockets: None,
            min_cpus: 0,
            per_task_limit: None,
        }
    }

    pub fn socket_allowed(&self, socket: u16) -> bool {
        match &self.allowed_sockets {
            Some(mask) => mask.get(usize::from(socket)).copied().unwrap_or(false),
            None => true,
        }
    }
}

fn matches(inv: &GresInventory, req: &GresRequest) -> bool {
    inv.name == req.name
        && match &req.type_name {
            Some(ty) => inv.type_name.as_deref() == Some(ty.as_str()),
            None => true,
        }
}

/// Free units of `inv` on a node, given what is already in use.
fn free_units(inv: &GresInventory, usage: Option<&NodeUsage>) -> Vec<usize> {
    let used = usage.and_then(|u| u.gres_used(&inv.name, inv.type_name.as_deref()));
    (0..inv.count as usize)
        .filter(|u| !used.is_some_and(|b| b.test(*u)))
        .collect()
}

/// Units needed on a node before the task count is known.
fn units_needed(req: &GresRequest, job: &JobRequest) -> u64 {
    let sockets = u64::from(job.sockets_per_node.max(1));
    req.per_node
        .max(req.per_task)
        .max(req.per_socket.saturating_mul(sockets))
}

/// Check every GRES request of `job` against `node`. `usage` is `None`
/// when existing allocations are ignored. Returns `None` when the node
/// cannot satisfy the request.
pub fn node_fit(
    node: &Node,
    usage: Option<&NodeUsage>,
    job: &JobRequest,
    default_binding: bool,
    usable_sockets: &[bool],
) -> Option<GresFit> {
    if !job.wants_gres() {
        return Some(GresFit::unconstrained());
    }
    let cpt = job.cpus_per_task();
    let mut fit = GresFit::unconstrained();

    for req in job.gres.iter().filter(|g| g.per_node > 0 || g.per_task > 0 || g.per_socket > 0) {
        let Some(inv) = node.gres.iter().find(|g| matches(g, req)) else {
            trace!(node = %node.name, gres = %req.name, "node has no such GRES");
            return None;
        };
        let free = free_units(inv, usage);
        let need = units_needed(req, job);
        if (free.len() as u64) < need {
            trace!(node = %node.name, gres = %req.name, free = free.len(), need, "too few free GRES units");
            return None;
        }

        let enforce = req.enforce_binding.unwrap_or(default_binding);
        if enforce {
            let (required, allowed) = bind_sockets(node, inv, &free, need, usable_sockets)?;
            fit.sockets_required = fit.sockets_required.max(required);
            fit.allowed_sockets = Some(match fit.allowed_sockets.take() {
                Some(prev) => prev.iter().zip(&allowed).map(|(a, b)| *a && *b).collect(),
                None => allowed,
            });
        }

        let tasks_for_gres = if job.ntasks_per_tres > 0 {
            need * u64::from(job.ntasks_per_tres)
        } else if req.per_task > 0 {
            need.div_ceil(req.per_task)
        } else {
            u64::from(fit.sockets_required.max(1))
        };
        fit.min_cpus = fit.min_cpus.max((tasks_for_gres as u32).saturating_mul(cpt));

        if req.per_task > 0 {
            let limit = (free.len() as u64 / req.per_task) as u32;
            fit.per_task_limit = Some(fit.per_task_limit.map_or(limit, |l| l.min(limit)));
        }
    }
    if let Some(allowed) = &fit.allowed_sockets {
        if !allowed.iter().any(|a| *a) {
            return None;
        }
    }
    Some(fit)
}

/// Greedy socket cover under enforced binding. Returns the minimum socket
/// count and the mask of sockets that can reach free units.
fn bind_sockets(
    node: &Node,
    inv: &GresInventory,
    free: &[usize],
    need: u64,
    usable_sockets: &[bool],
) -> Option<(u16, Vec<bool>)> {
    let sockets = usize::from(node.sockets);
    let mut reach: Vec<Vec<usize>> = vec![Vec::new(); sockets];
    for unit in free {
        for (s, units) in reach.iter_mut().enumerate() {
            if usable_sockets.get(s).copied().unwrap_or(false) && inv.unit_on_socket(*unit, s as u16) {
                units.push(*unit);
            }
        }
    }
    let allowed: Vec<bool> = reach.iter().map(|units| !units.is_empty()).collect();

    let mut order: Vec<usize> = (0..sockets).filter(|s| allowed[*s]).collect();
    order.sort_by(|a, b| reach[*b].len().cmp(&reach[*a].len()).then(b.cmp(a)));

    let mut covered = vec![false; inv.count as usize];
    let mut count = 0u64;
    let mut used_sockets = 0u16;
    for s in order {
        if count >= need {
            break;
        }
        for unit in &reach[s] {
            if let Some(slot) = covered.get_mut(*unit) {
                if !*slot {
                    *slot = true;
                    count += 1;
                }
            }
        }
        used_sockets += 1;
    }
    if count < need {
        return None;
    }
    Some((used_sockets, allowed))
}

/// Pick `count` concrete units of `inv` for a node, preferring units local
/// to `sockets`. Under enforced binding only local units qualify.
pub fn pick_units(
    inv: &GresInventory,
    usage: Option<&NodeUsage>,
    count: u64,
    sockets: &Bitmap,
    enforce: bool,
) -> Option<Vec<u32>> {
    let free = free_units(inv, usage);
    let local = |u: usize| sockets.iter_set().any(|s| inv.unit_on_socket(u, s as u16));

    let mut picked: Vec<u32> = free
        .iter()
        .copied()
        .filter(|u| local(*u))
        .take(count as usize)
        .map(|u| u as u32)
        .collect();
    if !enforce && (picked.len() as u64) < count {
        let rest = free
            .iter()
            .copied()
            .filter(|u| !local(*u))
            .take(count as usize - picked.len())
            .map(|u| u as u32);
        picked.extend(rest);
    }
    if (picked.len() as u64) < count {
        return None;
    }
    picked.sort_unstable();
    Some(picked)
}

/// Units of `req` to grant on a node carrying `tasks` tasks over `sockets` sockets.
pub fn units_for_node(req: &GresRequest, tasks: u32, sockets: u32) -> u64 {
    req.per_node
        .max(req.per_task.saturating_mul(u64::from(tasks)))
        .max(req.per_socket.saturating_mul(u64::from(sockets)))
}

pub fn inventory_for<'a>(node: &'a Node, req: &GresRequest) -> Option<&'a GresInventory> {
    node.gres.iter().find(|g| matches(g, req))
}
