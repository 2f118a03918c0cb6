//! Node selection: choose which of the viable nodes the job receives.
//!
//! Required nodes go first. Remaining demand is met by best fit over runs
//! of consecutive node indices: the smallest run that satisfies what is
//! left, otherwise the largest run, repeated. `contiguous` restricts the
//! result to a single run; `lln` replaces run fitting with most-free-first.

use coregrid_core::{JobRequest, NodeId};
use tracing::trace;

use crate::avail::AvailRes;
use crate::error::{SelectError, SelectResult};

/// Aggregate demand of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub cpus: u64,
    pub nodes: u32,
    pub max_nodes: u32,
}

impl Demand {
    pub fn of(req: &JobRequest) -> Self {
        let cpt = u64::from(req.cpus_per_task());
        let task_cpus = if req.overcommit {
            cpt
        } else {
            u64::from(req.num_tasks) * cpt
        };
        let mut nodes = req.min_nodes.max(req.req_nodes.min(req.max_nodes_bound()));
        if req.ntasks_per_node > 0 && req.num_tasks > 0 {
            nodes = nodes.max(req.num_tasks.div_ceil(u32::from(req.ntasks_per_node)));
        }
        Self {
            cpus: u64::from(req.min_cpus).max(task_cpus).max(1),
            nodes: nodes.max(1),
            max_nodes: req.max_nodes_bound(),
        }
    }
}

struct Need {
    cpus: u64,
    nodes: u32,
}

impl Need {
    fn done(&self) -> bool {
        self.cpus == 0 && self.nodes == 0
    }

    fn take(&mut self, cpus: u32) {
        self.cpus = self.cpus.saturating_sub(u64::from(cpus));
        self.nodes = self.nodes.saturating_sub(1);
    }
}

/// Pick nodes from `avail` (indexed by node id, `None` = not viable).
pub fn eval_nodes(
    req: &JobRequest,
    avail: &[Option<AvailRes>],
    lln: bool,
) -> SelectResult<Vec<NodeId>> {
    if req.max_nodes > 0 && req.min_nodes > req.max_nodes {
        return Err(SelectError::InvalidRequest(format!(
            "min_nodes {} exceeds max_nodes {}",
            req.min_nodes, req.max_nodes
        )));
    }
    let demand = Demand::of(req);
    if demand.nodes > demand.max_nodes {
        return Err(SelectError::InvalidRequest(format!(
            "{} nodes needed but at most {} allowed",
            demand.nodes, demand.max_nodes
        )));
    }
    let mut need = Need {
        cpus: demand.cpus,
        nodes: demand.nodes,
    };
    let mut picked = vec![false; avail.len()];
    let mut count = 0u32;

    if let Some(required) = &req.required_nodes {
        for idx in required.iter_set() {
            let Some(a) = avail.get(idx).and_then(Option::as_ref) else {
                return Err(SelectError::NoResources(format!("required node {idx} has no room")));
            };
            picked[idx] = true;
            count += 1;
            need.take(a.avail_cpus);
        }
        if count > demand.max_nodes {
            return Err(SelectError::InvalidRequest(format!(
                "{count} required nodes exceed max_nodes {}",
                demand.max_nodes
            )));
        }
    }

    if !need.done() {
        if req.contiguous {
            contiguous_pick(avail, &mut picked, &mut need, &mut count, demand.max_nodes);
        } else if lln {
            lln_pick(avail, &mut picked, &mut need, &mut count, demand.max_nodes);
        } else {
            best_fit_pick(avail, &mut picked, &mut need, &mut count, demand.max_nodes);
        }
    }

    if !need.done() {
        trace!(job = req.job_id, cpus_left = need.cpus, nodes_left = need.nodes, "node selection fell short");
        return Err(SelectError::NoResources(format!(
            "{} CPUs on {} nodes requested, not enough available",
            demand.cpus, demand.nodes
        )));
    }
    Ok(picked
        .iter()
        .enumerate()
        .filter(|(_, p)| **p)
        .map(|(i, _)| i as NodeId)
        .collect())
}

fn cpus_of(avail: &[Option<AvailRes>], idx: usize) -> u32 {
    avail[idx].as_ref().map_or(0, |a| a.avail_cpus)
}

/// Maximal runs `[lo, hi)` of consecutive viable, unpicked nodes.
fn runs(avail: &[Option<AvailRes>], picked: &[bool]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = None;
    for i in 0..=avail.len() {
        let usable = i < avail.len() && avail[i].is_some() && !picked[i];
        match (usable, start) {
            (true, None) => start = Some(i),
            (false, Some(lo)) => {
                out.push((lo, i));
                start = None;
            }
            _ => {}
        }
    }
    out
}

fn take_from(
    avail: &[Option<AvailRes>],
    range: impl Iterator<Item = usize>,
    picked: &mut [bool],
    need: &mut Need,
    count: &mut u32,
    max_nodes: u32,
) {
    for i in range {
        if need.done() || *count >= max_nodes {
            break;
        }
        if picked[i] || avail[i].is_none() {
            continue;
        }
        picked[i] = true;
        *count += 1;
        need.take(cpus_of(avail, i));
    }
}

fn best_fit_pick(
    avail: &[Option<AvailRes>],
    picked: &mut [bool],
    need: &mut Need,
    count: &mut u32,
    max_nodes: u32,
) {
    while !need.done() && *count < max_nodes {
        let candidates = runs(avail, picked);
        if candidates.is_empty() {
            return;
        }
        let room = max_nodes - *count;
        let total = |&(lo, hi): &(usize, usize)| -> u64 {
            (lo..hi)
                .take(room as usize)
                .map(|i| u64::from(cpus_of(avail, i)))
                .sum()
        };
        let sufficient = candidates
            .iter()
            .filter(|r| total(r) >= need.cpus && (r.1 - r.0) as u32 >= need.nodes.min(room))
            .min_by_key(|r| (total(r), r.0));
        let run = match sufficient {
            Some(r) => *r,
            None => match candidates.iter().max_by_key(|r| (total(r), std::cmp::Reverse(r.0))) {
                Some(r) => *r,
                None => return,
            },
        };
        // A single node that finishes the request beats spreading over the run.
        let single = (run.0..run.1)
            .filter(|i| u64::from(cpus_of(avail, *i)) >= need.cpus)
            .min_by_key(|i| (cpus_of(avail, *i), *i));
        match single {
            Some(i) if need.nodes <= 1 => take_from(avail, i..i + 1, picked, need, count, max_nodes),
            _ => take_from(avail, run.0..run.1, picked, need, count, max_nodes),
        }
    }
}

fn lln_pick(
    avail: &[Option<AvailRes>],
    picked: &mut [bool],
    need: &mut Need,
    count: &mut u32,
    max_nodes: u32,
) {
    let mut order: Vec<usize> = (0..avail.len())
        .filter(|i| avail[*i].is_some() && !picked[*i])
        .collect();
    order.sort_by_key(|i| (std::cmp::Reverse(cpus_of(avail, *i)), *i));
    take_from(avail, order.into_iter(), picked, need, count, max_nodes);
}

/// Smallest window of consecutive viable nodes that covers the required
/// nodes and the remaining demand.
fn contiguous_pick(
    avail: &[Option<AvailRes>],
    picked: &mut [bool],
    need: &mut Need,
    count: &mut u32,
    max_nodes: u32,
) {
    let required: Vec<usize> = (0..picked.len()).filter(|i| picked[*i]).collect();
    let (req_lo, req_hi) = match (required.first(), required.last()) {
        (Some(lo), Some(hi)) => (Some(*lo), Some(*hi)),
        _ => (None, None),
    };
    let mut best: Option<(usize, usize)> = None;
    for lo in 0..avail.len() {
        if avail[lo].is_none() || req_lo.is_some_and(|r| lo > r) {
            continue;
        }
        let mut nodes = 0u32;
        let mut extra_cpus = 0u64;
        let mut extra_nodes = 0u32;
        for hi in lo..avail.len() {
            if avail[hi].is_none() || nodes >= max_nodes {
                break;
            }
            nodes += 1;
            if !picked[hi] {
                extra_cpus += u64::from(cpus_of(avail, hi));
                extra_nodes += 1;
            }
            let covers = req_hi.is_none_or(|r| hi >= r);
            if covers && extra_cpus >= need.cpus && extra_nodes >= need.nodes {
                if best.is_none_or(|(blo, bhi)| hi - lo < bhi - blo) {
                    best = Some((lo, hi + 1));
                }
                break;
            }
        }
    }
    if let Some((lo, hi)) = best {
        take_from(avail, lo..hi, picked, need, count, max_nodes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gres::GresFit;
    use coregrid_core::Bitmap;

    fn res(node: u32, cpus: u32) -> Option<AvailRes> {
        Some(AvailRes {
            node,
            free_cores: Bitmap::new(cpus as usize),
            sock_cores: vec![cpus],
            sock_cpus: vec![cpus],
            vpus: 1,
            avail_cpus: cpus,
            max_tasks: cpus,
            min_cpus: 1,
            gres: GresFit::unconstrained(),
            mem_free: 0,
            whole: false,
        })
    }

    fn tasks(n: u32) -> JobRequest {
        JobRequest {
            num_tasks: n,
            ..JobRequest::default()
        }
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_run() {
        // Runs: [0,1] with 8 CPUs, [3] with 4 CPUs.
        let avail = vec![res(0, 4), res(1, 4), None, res(3, 4)];
        assert_eq!(eval_nodes(&tasks(3), &avail, false).unwrap(), vec![3]);
        assert_eq!(eval_nodes(&tasks(6), &avail, false).unwrap(), vec![0, 1]);
    }

    #[test]
    fn falls_back_to_largest_run_then_continues() {
        // No run covers 5 CPUs: take [2,3], then the smallest run covering the last one.
        let avail = vec![res(0, 2), None, res(2, 2), res(3, 2), None, res(5, 1)];
        assert_eq!(eval_nodes(&tasks(5), &avail, false).unwrap(), vec![2, 3, 5]);
    }

    #[test]
    fn required_nodes_come_first() {
        let avail = vec![res(0, 4), res(1, 4), res(2, 4)];
        let mut req = tasks(6);
        req.required_nodes = Some(Bitmap::from_indices(3, [2]).unwrap());
        let nodes = eval_nodes(&req, &avail, false).unwrap();
        assert!(nodes.contains(&2));
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn max_nodes_bounds_the_selection() {
        let avail = vec![res(0, 2), res(1, 2), res(2, 2)];
        let mut req = tasks(6);
        req.max_nodes = 2;
        assert!(matches!(eval_nodes(&req, &avail, false), Err(SelectError::NoResources(_))));
    }

    #[test]
    fn contiguous_needs_a_single_run() {
        let avail = vec![res(0, 2), None, res(2, 2), res(3, 2)];
        let mut req = tasks(4);
        req.contiguous = true;
        assert_eq!(eval_nodes(&req, &avail, false).unwrap(), vec![2, 3]);
        req.num_tasks = 6;
        assert!(eval_nodes(&req, &avail, false).is_err());
    }

    #[test]
    fn lln_takes_most_free_first() {
        let avail = vec![res(0, 2), res(1, 8), res(2, 4)];
        assert_eq!(eval_nodes(&tasks(4), &avail, true).unwrap(), vec![1]);
    }

    #[test]
    fn min_nodes_above_max_is_invalid() {
        let avail = vec![res(0, 2)];
        let mut req = tasks(1);
        req.min_nodes = 3;
        req.max_nodes = 2;
        assert!(matches!(eval_nodes(&req, &avail, false), Err(SelectError::InvalidRequest(_))));
    }
}
