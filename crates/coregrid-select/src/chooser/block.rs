//! Block chooser: fewest boards, then fewest sockets, then best fit.

use coregrid_core::{Bitmap, Node};

use super::{socket_budget, take_cores};
use crate::avail::AvailRes;

/// Lexicographic `k`-combinations of `0..n`.
struct Combinations {
    n: usize,
    idx: Vec<usize>,
    done: bool,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            idx: (0..k).collect(),
            done: k > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let out = self.idx.clone();
        let k = self.idx.len();
        let mut i = k;
        loop {
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
            if self.idx[i] < self.n - k + i {
                self.idx[i] += 1;
                for j in i + 1..k {
                    self.idx[j] = self.idx[j - 1] + 1;
                }
                break;
            }
        }
        Some(out)
    }
}

/// Sockets needed to cover `need` cores when filled largest first.
fn sockets_to_cover(mut budgets: Vec<u32>, need: u32) -> Option<u32> {
    budgets.sort_unstable_by(|a, b| b.cmp(a));
    let mut covered = 0;
    for (i, b) in budgets.iter().enumerate() {
        if covered >= need {
            return Some(i as u32);
        }
        covered += b;
    }
    (covered >= need).then_some(budgets.len() as u32)
}

/// Pick `needed` cores on `node`. Boards beyond [`coregrid_core::MAX_BOARDS`]
/// are viewed as a single board.
pub fn pick(node: &Node, avail: &AvailRes, needed: u32) -> Option<Bitmap> {
    let budget = socket_budget(avail);
    if needed == 0 || budget.iter().sum::<u32>() < needed {
        return None;
    }
    let boards = usize::from(node.effective_boards());
    let spb = usize::from(node.sockets_per_board().max(1));
    let board_sockets = |b: usize| b * spb..((b + 1) * spb).min(budget.len());
    let board_free: Vec<u32> = (0..boards)
        .map(|b| budget[board_sockets(b)].iter().sum())
        .collect();

    let mut sorted = board_free.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let mut acc = 0;
    let b_min = sorted
        .iter()
        .position(|f| {
            acc += f;
            acc >= needed
        })
        .map(|p| p + 1)?;

    // (sockets required, residual cores); ties go to the later combination,
    // which holds the higher-numbered boards.
    let mut best: Option<((u32, u32), Vec<usize>)> = None;
    for combo in Combinations::new(boards, b_min) {
        let free: u32 = combo.iter().map(|b| board_free[*b]).sum();
        if free < needed {
            continue;
        }
        let socks: Vec<u32> = combo
            .iter()
            .flat_map(|b| budget[board_sockets(*b)].iter().copied())
            .collect();
        let Some(required) = sockets_to_cover(socks, needed) else { continue };
        let key = (required, free - needed);
        if best.as_ref().is_none_or(|(k, _)| key <= *k) {
            best = Some((key, combo));
        }
    }
    let (_, combo) = best?;

    let mut left: Vec<(u16, u32)> = combo
        .iter()
        .flat_map(|b| board_sockets(*b))
        .filter(|s| budget[*s] > 0)
        .map(|s| (s as u16, budget[s]))
        .collect();
    left.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));

    let mut out = Bitmap::new(node.tot_cores() as usize);
    let mut remaining = needed;
    while remaining > 0 && !left.is_empty() {
        // Smallest socket that finishes the job, else the largest one.
        let pos = left
            .iter()
            .enumerate()
            .filter(|(_, (_, free))| *free >= remaining)
            .min_by(|(_, a), (_, b)| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let (s, free) = left.remove(pos);
        remaining -= take_cores(node, &avail.free_cores, s, free.min(remaining), &mut out);
    }
    (remaining == 0).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avail::node_avail;
    use coregrid_core::{JobRequest, NodeConfig, SelectConfig};

    fn node(boards: u16, sockets: u16, cores: u16) -> Node {
        let cfg = NodeConfig {
            name: "b0".to_string(),
            boards,
            sockets,
            cores_per_socket: cores,
            threads_per_core: 1,
            real_memory: 8192,
            mem_spec_limit: 0,
            core_spec_count: 0,
            gres: Vec::new(),
        };
        Node::from_config(0, &cfg).unwrap()
    }

    fn avail(n: &Node, busy: &[usize]) -> AvailRes {
        let busy = Bitmap::from_indices(n.tot_cores() as usize, busy.iter().copied()).unwrap();
        node_avail(n, None, &busy, &JobRequest::default(), &SelectConfig::default(), 8192).unwrap()
    }

    #[test]
    fn combinations_are_lexicographic() {
        let all: Vec<Vec<usize>> = Combinations::new(4, 2).collect();
        assert_eq!(all.len(), 6);
        assert_eq!(all[0], vec![0, 1]);
        assert_eq!(all[5], vec![2, 3]);
        assert_eq!(Combinations::new(8, 3).count(), 56);
        assert_eq!(Combinations::new(2, 3).count(), 0);
    }

    #[test]
    fn fills_both_sockets_when_all_cores_needed() {
        let n = node(1, 2, 4);
        let cores = pick(&n, &avail(&n, &[]), 8).unwrap();
        assert_eq!(cores.count(), 8);
    }

    #[test]
    fn best_fit_prefers_the_tighter_socket() {
        let n = node(1, 2, 4);
        // Socket 0 has 2 free cores, socket 1 has 4.
        let cores = pick(&n, &avail(&n, &[0, 1]), 2).unwrap();
        assert_eq!(cores.fmt_ranges(), "2-3");
    }

    #[test]
    fn equal_sockets_break_ties_toward_higher_numbers() {
        let n = node(1, 2, 4);
        let cores = pick(&n, &avail(&n, &[]), 3).unwrap();
        assert_eq!(cores.fmt_ranges(), "5-7");
    }

    #[test]
    fn spans_sockets_largest_first() {
        let n = node(1, 2, 4);
        let cores = pick(&n, &avail(&n, &[0]), 6).unwrap();
        // Socket 1 fully, then the two highest free cores of socket 0.
        assert_eq!(cores.fmt_ranges(), "2-7");
    }

    #[test]
    fn picks_a_single_board_when_one_suffices() {
        let n = node(2, 4, 2);
        // Board 0 (sockets 0-1) has one busy core; board 1 is idle.
        let cores = pick(&n, &avail(&n, &[0]), 4).unwrap();
        assert_eq!(cores.fmt_ranges(), "4-7");
    }

    #[test]
    fn eight_boards_enumerate_every_combination() {
        let n = node(8, 8, 2);
        // Leave one free core on every board except board 5, which keeps both.
        let busy: Vec<usize> = (0..8).filter(|b| *b != 5).map(|b| b * 2).collect();
        let cores = pick(&n, &avail(&n, &busy), 3).unwrap();
        assert_eq!(cores.count(), 3);
        assert!(cores.test(10) && cores.test(11));
    }

    #[test]
    fn nine_boards_collapse_to_one() {
        let n = node(9, 9, 2);
        assert_eq!(n.effective_boards(), 1);
        let cores = pick(&n, &avail(&n, &[]), 18).unwrap();
        assert_eq!(cores.count(), 18);
    }

    #[test]
    fn too_few_free_cores_is_no_progress() {
        let n = node(1, 1, 4);
        assert!(pick(&n, &avail(&n, &[0, 1, 2]), 2).is_none());
    }
}
