//! Cyclic chooser: visit sockets round-robin, highest socket first.

use coregrid_core::{Bitmap, Node};

use super::{socket_budget, take_cores};
use crate::avail::AvailRes;

/// Pick cores for `cpus` CPUs, walking sockets in turn. When a task needs
/// more CPUs than a core offers, each visit takes a whole task's cores so
/// the task stays on one socket; if no socket can hold a whole task the
/// walk falls back to one core per visit.
pub fn pick(node: &Node, avail: &AvailRes, cpus: u32, cpus_per_task: u32) -> Option<Bitmap> {
    let vpus = u32::from(avail.vpus.max(1));
    let mut budget = socket_budget(avail);
    let mut out = Bitmap::new(node.tot_cores() as usize);
    let mut remaining = cpus;
    let mut group = if cpus_per_task > vpus { cpus_per_task.div_ceil(vpus) } else { 1 };

    while remaining > 0 {
        let mut progress = false;
        for s in (0..node.sockets).rev() {
            if remaining == 0 {
                break;
            }
            let want = group.min(remaining.div_ceil(vpus));
            let slot = &mut budget[usize::from(s)];
            if *slot < want {
                continue;
            }
            let got = take_cores(node, &avail.free_cores, s, want, &mut out);
            *slot -= got;
            remaining = remaining.saturating_sub(got * vpus);
            progress |= got > 0;
        }
        if !progress {
            if group > 1 {
                group = 1;
                continue;
            }
            return None;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avail::node_avail;
    use coregrid_core::{JobRequest, NodeConfig, SelectConfig};

    fn node(sockets: u16, cores: u16, threads: u16) -> Node {
        let cfg = NodeConfig {
            name: "y0".to_string(),
            boards: 1,
            sockets,
            cores_per_socket: cores,
            threads_per_core: threads,
            real_memory: 8192,
            mem_spec_limit: 0,
            core_spec_count: 0,
            gres: Vec::new(),
        };
        Node::from_config(0, &cfg).unwrap()
    }

    fn avail(n: &Node, req: &JobRequest, busy: &[usize]) -> AvailRes {
        let busy = Bitmap::from_indices(n.tot_cores() as usize, busy.iter().copied()).unwrap();
        node_avail(n, None, &busy, req, &SelectConfig::default(), 8192).unwrap()
    }

    #[test]
    fn alternates_sockets() {
        let n = node(2, 4, 1);
        let a = avail(&n, &JobRequest::default(), &[]);
        let cores = pick(&n, &a, 3, 1).unwrap();
        assert_eq!(cores.fmt_ranges(), "3,6-7");
    }

    #[test]
    fn per_socket_cap_stops_the_walk() {
        let n = node(2, 4, 1);
        let mut req = JobRequest::default();
        req.ntasks_per_socket = 2;
        let a = avail(&n, &req, &[]);
        assert_eq!(pick(&n, &a, 4, 1).unwrap().count(), 4);
        assert!(pick(&n, &a, 6, 1).is_none());
    }

    #[test]
    fn multi_core_tasks_stay_on_one_socket() {
        let n = node(2, 4, 1);
        let a = avail(&n, &JobRequest::default(), &[]);
        let cores = pick(&n, &a, 4, 2).unwrap();
        assert_eq!(cores.fmt_ranges(), "2-3,6-7");
    }

    #[test]
    fn falls_back_to_single_cores_when_tasks_do_not_fit_a_socket() {
        let n = node(2, 4, 1);
        // One free core per socket.
        let a = avail(&n, &JobRequest::default(), &[1, 2, 3, 5, 6, 7]);
        let cores = pick(&n, &a, 2, 2).unwrap();
        assert_eq!(cores.fmt_ranges(), "0,4");
    }

    #[test]
    fn hyperthreads_count_per_core_visit() {
        let n = node(2, 2, 2);
        let a = avail(&n, &JobRequest::default(), &[]);
        assert_eq!(a.vpus, 2);
        let cores = pick(&n, &a, 4, 1).unwrap();
        assert_eq!(cores.fmt_ranges(), "1,3");
    }
}
