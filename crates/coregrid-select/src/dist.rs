//! Task distributor: spread a job's tasks over its selected nodes.
//!
//! Each node is seeded with one task, which counts as the first task of
//! that node's first chunk. The rest go round-robin in chunks of the plane
//! size (one for non-plane layouts). Overcommit lets the walk continue past
//! CPU capacity; otherwise running out of room is an error.

use coregrid_core::JobRequest;
use tracing::warn;

use crate::avail::AvailRes;
use crate::error::{SelectError, SelectResult};

/// Tasks and CPUs per selected node, in selection order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub tasks: Vec<u32>,
    pub cpus: Vec<u32>,
}

impl Layout {
    pub fn total_tasks(&self) -> u32 {
        self.tasks.iter().sum()
    }
}

/// Task count for a request spread over `nodes` nodes.
pub fn task_count(req: &JobRequest, nodes: usize) -> u32 {
    let nodes = u32::try_from(nodes).unwrap_or(u32::MAX);
    let count = if req.num_tasks > 0 {
        req.num_tasks
    } else if req.overcommit {
        1
    } else if req.ntasks_per_node > 0 {
        u32::from(req.ntasks_per_node).saturating_mul(nodes)
    } else {
        req.min_cpus / req.cpus_per_task()
    };
    count.max(nodes)
}

/// Hand `remaining` tasks out in whole chunks, round-robin from the first
/// node, then the partial chunk to the next node in turn.
fn overcommit(tasks: &mut [u32], remaining: u32, chunk: u32) {
    let n = tasks.len() as u32;
    let chunks = remaining / chunk;
    let (each, extra) = (chunks / n, chunks % n);
    for (i, t) in tasks.iter_mut().enumerate() {
        let mine = each + u32::from((i as u32) < extra);
        *t = t.saturating_add(mine.saturating_mul(chunk));
    }
    let partial = remaining % chunk;
    if partial > 0 {
        let next = extra as usize;
        tasks[next] = tasks[next].saturating_add(partial);
    }
}

pub fn distribute(req: &JobRequest, nodes: &[&AvailRes]) -> SelectResult<Layout> {
    if nodes.is_empty() {
        return Err(SelectError::NoResources("no nodes selected".to_string()));
    }
    let cpt = req.cpus_per_task();
    let total = task_count(req, nodes.len());
    let chunk = req.task_dist.chunk().max(1);
    let cap: Vec<u32> = nodes.iter().map(|a| a.avail_cpus).collect();
    let mut tasks = vec![1u32; nodes.len()];
    let mut remaining = total.saturating_sub(nodes.len() as u32);

    let mut first_round = true;
    while remaining > 0 {
        let mut progress = false;
        for (i, a) in nodes.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let slots = if first_round { chunk - 1 } else { chunk };
            let fits = a.max_tasks.saturating_sub(tasks[i]);
            let give = slots.min(remaining).min(fits);
            tasks[i] += give;
            remaining -= give;
            progress |= give > 0;
        }
        if !progress && !first_round {
            break;
        }
        first_round = false;
    }

    if remaining > 0 {
        if !req.overcommit {
            return Err(SelectError::NoResources(format!(
                "{total} tasks of {cpt} CPUs do not fit the selected nodes"
            )));
        }
        warn!(job = req.job_id, tasks = remaining, "overcommitting tasks beyond available CPUs");
        overcommit(&mut tasks, remaining, chunk);
    }

    let mut cpus: Vec<u32> = tasks
        .iter()
        .zip(&cap)
        .map(|(t, c)| t.saturating_mul(cpt).min(*c).max(cpt.min(*c)))
        .collect();
    for (i, a) in nodes.iter().enumerate() {
        cpus[i] = if a.whole { a.avail_cpus } else { cpus[i].max(a.min_cpus).min(a.avail_cpus) };
    }

    // Extra CPUs for min_cpus beyond what the tasks need.
    let mut extra = u64::from(req.min_cpus).saturating_sub(cpus.iter().map(|c| u64::from(*c)).sum());
    while extra > 0 {
        let mut progress = false;
        for i in 0..nodes.len() {
            if extra == 0 {
                break;
            }
            if cpus[i] < cap[i] {
                cpus[i] += 1;
                extra -= 1;
                progress = true;
            }
        }
        if !progress {
            return Err(SelectError::NoResources(format!(
                "{} CPUs requested, selected nodes hold fewer",
                req.min_cpus
            )));
        }
    }

    Ok(Layout { tasks, cpus })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gres::GresFit;
    use coregrid_core::{Bitmap, TaskDist};

    fn node(cpus: u32) -> AvailRes {
        AvailRes {
            node: 0,
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
        }
    }

    fn req(tasks: u32) -> JobRequest {
        JobRequest {
            num_tasks: tasks,
            ..JobRequest::default()
        }
    }

    #[test]
    fn plane_chunks_fill_each_node_in_turn() {
        let (a, b) = (node(4), node(4));
        let mut r = req(6);
        r.task_dist = TaskDist::plane(3);
        let layout = distribute(&r, &[&a, &b]).unwrap();
        assert_eq!(layout.tasks, vec![3, 3]);
        assert_eq!(layout.cpus, vec![3, 3]);
    }

    #[test]
    fn round_robin_skips_full_nodes() {
        let (a, b) = (node(2), node(8));
        let layout = distribute(&req(6), &[&a, &b]).unwrap();
        assert_eq!(layout.tasks, vec![2, 4]);
    }

    #[test]
    fn too_many_tasks_without_overcommit_fail() {
        let a = node(2);
        assert!(matches!(distribute(&req(3), &[&a]), Err(SelectError::NoResources(_))));
    }

    #[test]
    fn overcommit_oversubscribes_in_chunks() {
        let (a, b) = (node(1), node(1));
        let mut r = req(5);
        r.overcommit = true;
        let layout = distribute(&r, &[&a, &b]).unwrap();
        assert_eq!(layout.total_tasks(), 5);
        assert_eq!(layout.tasks, vec![3, 2]);
        assert_eq!(layout.cpus, vec![1, 1]);
    }

    #[test]
    fn overcommit_without_tasks_runs_one() {
        let a = node(4);
        let mut r = req(0);
        r.overcommit = true;
        assert_eq!(task_count(&r, 1), 1);
        assert_eq!(distribute(&r, &[&a]).unwrap().tasks, vec![1]);
    }

    #[test]
    fn min_cpus_adds_extra_cpus_round_robin() {
        let (a, b) = (node(4), node(4));
        let mut r = req(2);
        r.min_cpus = 5;
        let layout = distribute(&r, &[&a, &b]).unwrap();
        assert_eq!(layout.tasks, vec![1, 1]);
        assert_eq!(layout.cpus, vec![3, 2]);
    }

    #[test]
    fn cpus_per_task_scales_node_cpus() {
        let mut a = node(8);
        a.max_tasks = 4;
        let mut r = req(3);
        r.cpus_per_task = 2;
        let layout = distribute(&r, &[&a]).unwrap();
        assert_eq!(layout.cpus, vec![6]);
    }

    #[test]
    fn per_node_task_cap_limits_the_fill() {
        let mut a = node(8);
        a.max_tasks = 2;
        let b = node(8);
        let layout = distribute(&req(6), &[&a, &b]).unwrap();
        assert_eq!(layout.tasks, vec![2, 4]);
    }

    #[test]
    fn huge_overcommit_does_not_overflow_node_cpus() {
        // One 8-CPU task fits; the rest are overcommitted.
        let mut a = node(8);
        a.max_tasks = 1;
        let mut r = req(600_000_000);
        r.cpus_per_task = 8;
        r.overcommit = true;
        let layout = distribute(&r, &[&a]).unwrap();
        assert_eq!(layout.tasks, vec![600_000_000]);
        assert_eq!(layout.cpus, vec![8]);

        let b = a.clone();
        let layout = distribute(&r, &[&a, &b]).unwrap();
        assert_eq!(layout.tasks, vec![300_000_000, 300_000_000]);
        assert_eq!(layout.cpus, vec![8, 8]);
    }

    #[test]
    fn overcommit_plane_chunks_leave_the_partial_chunk_last() {
        let a = node(1);
        let b = node(1);
        let c = node(1);
        let mut r = req(10);
        r.task_dist = TaskDist::plane(2);
        r.overcommit = true;
        let layout = distribute(&r, &[&a, &b, &c]).unwrap();
        // Seeds take one each; 7 left are three chunks of two and one task.
        assert_eq!(layout.tasks, vec![4, 3, 3]);
    }
}
