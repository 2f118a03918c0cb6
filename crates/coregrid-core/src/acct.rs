//! Step accounting record.
//!
//! A [`JobAcct`] carries CPU times, frequency and energy, plus for each
//! tracked TRES the `max`/`min` values together with the node and task
//! that produced them, and a running total. Both an "in" direction
//! (consumption, reads) and an "out" direction (writes) are kept.
//!
//! Node and task slots use [`UNSET`] until a sample has been merged.

use serde::{Deserialize, Serialize};

use crate::tres::{TRES_CPU, TRES_MEM, TRES_VMEM, TresId, TresVec, UNSET, add_value};

/// Per-direction usage arrays, all of the same width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TresUsage {
    pub max: TresVec,
    pub max_node: TresVec,
    pub max_task: TresVec,
    pub min: TresVec,
    pub min_node: TresVec,
    pub min_task: TresVec,
    pub tot: TresVec,
}

impl TresUsage {
    pub fn unset(width: usize) -> Self {
        Self {
            max: TresVec::unset(width),
            max_node: TresVec::unset(width),
            max_task: TresVec::unset(width),
            min: TresVec::unset(width),
            min_node: TresVec::unset(width),
            min_task: TresVec::unset(width),
            tot: TresVec::unset(width),
        }
    }

    pub fn width(&self) -> usize {
        self.tot.width()
    }

    fn resize(&mut self, width: usize) {
        for v in self.vectors_mut() {
            v.resize(width, UNSET);
        }
    }

    fn vectors_mut(&mut self) -> [&mut TresVec; 7] {
        [
            &mut self.max,
            &mut self.max_node,
            &mut self.max_task,
            &mut self.min,
            &mut self.min_node,
            &mut self.min_task,
            &mut self.tot,
        ]
    }

    /// Record a single-task sample: `min = max = tot = sample`, with the
    /// producing node and task stamped on both extremes.
    pub fn set_sample(&mut self, index: usize, value: u64, node: u64, task: u64) {
        if index >= self.width() {
            return;
        }
        self.max.set(index, value);
        self.min.set(index, value);
        self.tot.set(index, value);
        self.max_node.set(index, node);
        self.max_task.set(index, task);
        self.min_node.set(index, node);
        self.min_task.set(index, task);
    }

    /// Fold `other` into `self`; extremes keep the node and task that
    /// produced them, totals add.
    pub fn aggregate(&mut self, other: &TresUsage) {
        let width = self.width().min(other.width());
        for i in 0..width {
            let theirs = other.max.get(i);
            let ours = self.max.get(i);
            if theirs != UNSET && (ours == UNSET || theirs > ours) {
                self.max.set(i, theirs);
                self.max_node.set(i, other.max_node.get(i));
                self.max_task.set(i, other.max_task.get(i));
            }

            let theirs = other.min.get(i);
            let ours = self.min.get(i);
            if theirs != UNSET && (ours == UNSET || theirs < ours) {
                self.min.set(i, theirs);
                self.min_node.set(i, other.min_node.get(i));
                self.min_task.set(i, other.min_task.get(i));
            }

            self.tot.set(i, add_value(self.tot.get(i), other.tot.get(i)));
        }
    }
}

/// Accounting record for one task, or an aggregate over many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAcct {
    pub pid: u32,
    pub node_id: u32,
    pub task_id: u32,
    pub user_cpu_sec: u64,
    pub user_cpu_usec: u32,
    pub sys_cpu_sec: u64,
    pub sys_cpu_usec: u32,
    /// kHz.
    pub act_cpufreq: u32,
    /// Joules.
    pub energy_consumed: u64,
    /// TRES id of each slot; slot `i` describes `tres_ids[i]`.
    pub tres_ids: Vec<TresId>,
    pub usage_in: TresUsage,
    pub usage_out: TresUsage,
}

impl JobAcct {
    /// Empty record tracking `tres_ids`.
    pub fn new(tres_ids: Vec<TresId>) -> Self {
        let width = tres_ids.len();
        Self {
            pid: 0,
            node_id: 0,
            task_id: 0,
            user_cpu_sec: 0,
            user_cpu_usec: 0,
            sys_cpu_sec: 0,
            sys_cpu_usec: 0,
            act_cpufreq: 0,
            energy_consumed: 0,
            tres_ids,
            usage_in: TresUsage::unset(width),
            usage_out: TresUsage::unset(width),
        }
    }

    pub fn for_task(tres_ids: Vec<TresId>, pid: u32, node_id: u32, task_id: u32) -> Self {
        Self {
            pid,
            node_id,
            task_id,
            ..Self::new(tres_ids)
        }
    }

    pub fn width(&self) -> usize {
        self.tres_ids.len()
    }

    /// Slot holding TRES `id`.
    pub fn index_of(&self, id: TresId) -> Option<usize> {
        self.tres_ids.iter().position(|t| *t == id)
    }

    /// Start tracking `id` if not already present.
    pub fn track(&mut self, id: TresId) -> usize {
        if let Some(i) = self.index_of(id) {
            return i;
        }
        self.tres_ids.push(id);
        let width = self.tres_ids.len();
        self.usage_in.resize(width);
        self.usage_out.resize(width);
        width - 1
    }

    pub fn has_data(&self) -> bool {
        self.usage_in.tot.as_slice().iter().any(|v| *v != UNSET)
            || self.usage_out.tot.as_slice().iter().any(|v| *v != UNSET)
            || self.user_cpu_sec > 0
            || self.user_cpu_usec > 0
            || self.sys_cpu_sec > 0
            || self.sys_cpu_usec > 0
    }

    /// Total CPU time in seconds.
    pub fn total_cpu_secs(&self) -> f64 {
        self.user_cpu_sec as f64
            + self.sys_cpu_sec as f64
            + (f64::from(self.user_cpu_usec) + f64::from(self.sys_cpu_usec)) / 1e6
    }

    /// Set the "in" sample of `id` for this record's own node and task.
    pub fn set_in_sample(&mut self, id: TresId, value: u64) {
        if let Some(i) = self.index_of(id) {
            let (node, task) = (u64::from(self.node_id), u64::from(self.task_id));
            self.usage_in.set_sample(i, value, node, task);
        }
    }

    pub fn set_out_sample(&mut self, id: TresId, value: u64) {
        if let Some(i) = self.index_of(id) {
            let (node, task) = (u64::from(self.node_id), u64::from(self.task_id));
            self.usage_out.set_sample(i, value, node, task);
        }
    }

    /// Merge a record from another task or node into this aggregate.
    ///
    /// CPU times, frequency and energy add; TRES slots are matched by id.
    pub fn aggregate(&mut self, other: &JobAcct) {
        let user_usec = u64::from(self.user_cpu_usec) + u64::from(other.user_cpu_usec);
        self.user_cpu_sec += other.user_cpu_sec + user_usec / 1_000_000;
        self.user_cpu_usec = (user_usec % 1_000_000) as u32;
        let sys_usec = u64::from(self.sys_cpu_usec) + u64::from(other.sys_cpu_usec);
        self.sys_cpu_sec += other.sys_cpu_sec + sys_usec / 1_000_000;
        self.sys_cpu_usec = (sys_usec % 1_000_000) as u32;

        self.act_cpufreq = self.act_cpufreq.saturating_add(other.act_cpufreq);
        self.energy_consumed = self.energy_consumed.saturating_add(other.energy_consumed);

        if self.tres_ids == other.tres_ids {
            self.usage_in.aggregate(&other.usage_in);
            self.usage_out.aggregate(&other.usage_out);
            return;
        }
        for id in &other.tres_ids {
            self.track(*id);
        }
        let realigned = other.realign(&self.tres_ids);
        self.usage_in.aggregate(&realigned.usage_in);
        self.usage_out.aggregate(&realigned.usage_out);
    }

    /// Copy of `self` whose slots follow `ids`; missing slots are unset.
    pub fn realign(&self, ids: &[TresId]) -> JobAcct {
        let mut out = JobAcct {
            tres_ids: ids.to_vec(),
            usage_in: TresUsage::unset(ids.len()),
            usage_out: TresUsage::unset(ids.len()),
            ..self.clone()
        };
        for (dst, id) in ids.iter().enumerate() {
            let Some(src) = self.index_of(*id) else { continue };
            copy_slot(&self.usage_in, src, &mut out.usage_in, dst);
            copy_slot(&self.usage_out, src, &mut out.usage_out, dst);
        }
        out
    }

    /// Average of a gauge over `polls` samples.
    pub fn ave(&self, id: TresId, polls: u64) -> Option<u64> {
        let i = self.index_of(id)?;
        let tot = self.usage_in.tot.get(i);
        if tot == UNSET || polls == 0 {
            return None;
        }
        Some(tot / polls)
    }

    pub fn max_rss(&self) -> Option<u64> {
        self.in_max(TRES_MEM as TresId)
    }

    pub fn max_vmem(&self) -> Option<u64> {
        self.in_max(TRES_VMEM as TresId)
    }

    pub fn cpu_time_ms(&self) -> Option<u64> {
        let i = self.index_of(TRES_CPU as TresId)?;
        let tot = self.usage_in.tot.get(i);
        (tot != UNSET).then_some(tot)
    }

    fn in_max(&self, id: TresId) -> Option<u64> {
        let i = self.index_of(id)?;
        let v = self.usage_in.max.get(i);
        (v != UNSET).then_some(v)
    }
}

fn copy_slot(src: &TresUsage, from: usize, dst: &mut TresUsage, to: usize) {
    dst.max.set(to, src.max.get(from));
    dst.max_node.set(to, src.max_node.get(from));
    dst.max_task.set(to, src.max_task.get(from));
    dst.min.set(to, src.min.get(from));
    dst.min_node.set(to, src.min_node.get(from));
    dst.min_task.set(to, src.min_task.get(from));
    dst.tot.set(to, src.tot.get(from));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tres::{TRES_FS_DISK, TRES_STATIC_CNT};

    fn static_ids() -> Vec<TresId> {
        (0..TRES_STATIC_CNT as TresId).collect()
    }

    #[test]
    fn single_task_sample_sets_both_extremes() {
        let mut acct = JobAcct::for_task(static_ids(), 100, 2, 5);
        acct.set_in_sample(TRES_MEM as TresId, 4096);

        let i = TRES_MEM;
        assert_eq!(acct.usage_in.max.get(i), 4096);
        assert_eq!(acct.usage_in.min.get(i), 4096);
        assert_eq!(acct.usage_in.max_task.get(i), 5);
        assert_eq!(acct.usage_in.min_task.get(i), 5);
        assert_eq!(acct.usage_in.min_node.get(i), 2);
        assert!(!acct.usage_in.tot.is_set(TRES_CPU));
    }

    #[test]
    fn aggregate_tracks_extremes_and_sums() {
        let mut a = JobAcct::for_task(static_ids(), 1, 0, 0);
        a.set_in_sample(TRES_MEM as TresId, 100);
        a.user_cpu_sec = 1;
        a.user_cpu_usec = 600_000;

        let mut b = JobAcct::for_task(static_ids(), 2, 1, 3);
        b.set_in_sample(TRES_MEM as TresId, 300);
        b.user_cpu_usec = 500_000;

        let mut agg = JobAcct::new(static_ids());
        agg.aggregate(&a);
        agg.aggregate(&b);

        assert_eq!(agg.usage_in.max.get(TRES_MEM), 300);
        assert_eq!(agg.usage_in.max_node.get(TRES_MEM), 1);
        assert_eq!(agg.usage_in.max_task.get(TRES_MEM), 3);
        assert_eq!(agg.usage_in.min.get(TRES_MEM), 100);
        assert_eq!(agg.usage_in.min_task.get(TRES_MEM), 0);
        assert_eq!(agg.usage_in.tot.get(TRES_MEM), 400);
        assert_eq!((agg.user_cpu_sec, agg.user_cpu_usec), (2, 100_000));
    }

    #[test]
    fn unset_never_survives_a_real_sample() {
        let mut agg = JobAcct::new(static_ids());
        let mut a = JobAcct::for_task(static_ids(), 1, 0, 0);
        a.set_in_sample(TRES_FS_DISK as TresId, 0);
        agg.aggregate(&a);
        assert_eq!(agg.usage_in.max.get(TRES_FS_DISK), 0);
        assert_eq!(agg.usage_in.min.get(TRES_FS_DISK), 0);
        assert_eq!(agg.usage_in.tot.get(TRES_FS_DISK), 0);
    }

    #[test]
    fn aggregate_realigns_different_id_sets() {
        let mut agg = JobAcct::new(vec![0, 1]);
        let mut other = JobAcct::for_task(vec![1, 7], 9, 0, 1);
        other.set_in_sample(7, 55);
        other.set_in_sample(1, 10);

        agg.aggregate(&other);
        assert_eq!(agg.tres_ids, vec![0, 1, 7]);
        assert_eq!(agg.usage_in.max.get(2), 55);
        assert_eq!(agg.usage_in.max.get(1), 10);
        assert!(!agg.usage_in.max.is_set(0));
    }

    #[test]
    fn average_divides_total_by_polls() {
        let mut acct = JobAcct::for_task(static_ids(), 1, 0, 0);
        acct.set_in_sample(TRES_MEM as TresId, 900);
        assert_eq!(acct.ave(TRES_MEM as TresId, 3), Some(300));
        assert_eq!(acct.ave(TRES_CPU as TresId, 3), None);
        assert_eq!(acct.max_rss(), Some(900));
    }
}
