//! Accounting-record codec.
//!
//! Every record starts with a one-byte flag: 0 means no record follows.
//!
//! Current and previous releases send the TRES-vector layout:
//!
//! ```text
//!   flag u8 | user_sec u64 | user_usec u32 | sys_sec u64 | sys_usec u32
//!   | act_cpufreq u32 | energy u64 | pid u32 | node_id u32 | task_id u32
//!   | ids [u32] | in:  max, max_node, max_task, min, min_node, min_task, tot [u64]
//!               | out: max, max_node, max_task, min, min_node, min_task, tot [u64]
//! ```
//!
//! The release two back keys the same data by fixed TRES ids. For CPU,
//! MEM, VMEM, PAGES and FS_DISK (in that order) it sends the seven
//! in-direction values; node ids are `u32` and task ids `u16`, each with
//! all bits set for "unset". Only FS_DISK has an out-direction, carried
//! as max, max node, max task and total. Anything else is dropped.

use coregrid_core::tres::{TRES_CPU, TRES_FS_DISK, TRES_MEM, TRES_PAGES, TRES_VMEM, TresVec};
use coregrid_core::{JobAcct, TresId, TresUsage, UNSET};

use crate::error::{ProtoError, ProtoResult};
use crate::pack::{Packer, Unpacker};
use crate::version::ProtocolVersion;

/// TRES carried by the fixed-id layout, in wire order.
pub const LEGACY_TRES: [TresId; 5] = [
    TRES_CPU as TresId,
    TRES_MEM as TresId,
    TRES_VMEM as TresId,
    TRES_PAGES as TresId,
    TRES_FS_DISK as TresId,
];

const LEGACY_NODE_UNSET: u32 = u32::MAX;
const LEGACY_TASK_UNSET: u16 = u16::MAX;

pub fn encode_acct(acct: Option<&JobAcct>, version: ProtocolVersion, p: &mut Packer) {
    let Some(acct) = acct else {
        p.u8(0);
        return;
    };
    p.u8(1);
    p.u64(acct.user_cpu_sec);
    p.u32(acct.user_cpu_usec);
    p.u64(acct.sys_cpu_sec);
    p.u32(acct.sys_cpu_usec);
    p.u32(acct.act_cpufreq);
    p.u64(acct.energy_consumed);
    if version.legacy_acct() {
        encode_legacy(acct, p);
    } else {
        p.u32(acct.pid);
        p.u32(acct.node_id);
        p.u32(acct.task_id);
        p.u32_array(&acct.tres_ids);
        encode_usage(&acct.usage_in, p);
        encode_usage(&acct.usage_out, p);
    }
}

pub fn decode_acct(version: ProtocolVersion, u: &mut Unpacker) -> ProtoResult<Option<JobAcct>> {
    match u.u8("acct flag")? {
        0 => return Ok(None),
        1 => {}
        other => return Err(ProtoError::invalid("acct flag", other.to_string())),
    }
    let user_cpu_sec = u.u64("user_cpu_sec")?;
    let user_cpu_usec = u.u32("user_cpu_usec")?;
    let sys_cpu_sec = u.u64("sys_cpu_sec")?;
    let sys_cpu_usec = u.u32("sys_cpu_usec")?;
    let act_cpufreq = u.u32("act_cpufreq")?;
    let energy_consumed = u.u64("energy_consumed")?;
    let mut acct = if version.legacy_acct() {
        decode_legacy(u)?
    } else {
        let pid = u.u32("pid")?;
        let node_id = u.u32("node_id")?;
        let task_id = u.u32("task_id")?;
        let tres_ids = u.u32_array("tres_ids")?;
        let width = tres_ids.len();
        let mut acct = JobAcct::for_task(tres_ids, pid, node_id, task_id);
        acct.usage_in = decode_usage(u, width)?;
        acct.usage_out = decode_usage(u, width)?;
        acct
    };
    acct.user_cpu_sec = user_cpu_sec;
    acct.user_cpu_usec = user_cpu_usec;
    acct.sys_cpu_sec = sys_cpu_sec;
    acct.sys_cpu_usec = sys_cpu_usec;
    acct.act_cpufreq = act_cpufreq;
    acct.energy_consumed = energy_consumed;
    Ok(Some(acct))
}

fn encode_usage(usage: &TresUsage, p: &mut Packer) {
    for v in [
        &usage.max,
        &usage.max_node,
        &usage.max_task,
        &usage.min,
        &usage.min_node,
        &usage.min_task,
        &usage.tot,
    ] {
        p.u64_array(v.as_slice());
    }
}

fn decode_usage(u: &mut Unpacker, width: usize) -> ProtoResult<TresUsage> {
    let mut next = |what: &'static str| -> ProtoResult<TresVec> {
        let values = u.u64_array(what)?;
        if values.len() != width {
            return Err(ProtoError::invalid(what, format!("{} values for {width} TRES", values.len())));
        }
        Ok(TresVec::from_vec(values))
    };
    Ok(TresUsage {
        max: next("max")?,
        max_node: next("max_node")?,
        max_task: next("max_task")?,
        min: next("min")?,
        min_node: next("min_node")?,
        min_task: next("min_task")?,
        tot: next("tot")?,
    })
}

fn legacy_node(v: u64) -> u32 {
    if v == UNSET {
        LEGACY_NODE_UNSET
    } else {
        v.min(u64::from(LEGACY_NODE_UNSET - 1)) as u32
    }
}

fn legacy_task(v: u64) -> u16 {
    if v == UNSET {
        LEGACY_TASK_UNSET
    } else {
        v.min(u64::from(LEGACY_TASK_UNSET - 1)) as u16
    }
}

fn from_legacy_node(v: u32) -> u64 {
    if v == LEGACY_NODE_UNSET { UNSET } else { u64::from(v) }
}

fn from_legacy_task(v: u16) -> u64 {
    if v == LEGACY_TASK_UNSET { UNSET } else { u64::from(v) }
}

const FS_SLOT: usize = 4;

fn encode_legacy(acct: &JobAcct, p: &mut Packer) {
    let fixed = acct.realign(&LEGACY_TRES);
    let usage = &fixed.usage_in;
    for i in 0..LEGACY_TRES.len() {
        p.u64(usage.max.get(i));
        p.u32(legacy_node(usage.max_node.get(i)));
        p.u16(legacy_task(usage.max_task.get(i)));
        p.u64(usage.min.get(i));
        p.u32(legacy_node(usage.min_node.get(i)));
        p.u16(legacy_task(usage.min_task.get(i)));
        p.u64(usage.tot.get(i));
    }
    let out = &fixed.usage_out;
    p.u64(out.max.get(FS_SLOT));
    p.u32(legacy_node(out.max_node.get(FS_SLOT)));
    p.u16(legacy_task(out.max_task.get(FS_SLOT)));
    p.u64(out.tot.get(FS_SLOT));
}

fn decode_legacy(u: &mut Unpacker) -> ProtoResult<JobAcct> {
    let mut acct = JobAcct::new(LEGACY_TRES.to_vec());
    for i in 0..LEGACY_TRES.len() {
        let usage = &mut acct.usage_in;
        usage.max.set(i, u.u64("legacy max")?);
        usage.max_node.set(i, from_legacy_node(u.u32("legacy max_node")?));
        usage.max_task.set(i, from_legacy_task(u.u16("legacy max_task")?));
        usage.min.set(i, u.u64("legacy min")?);
        usage.min_node.set(i, from_legacy_node(u.u32("legacy min_node")?));
        usage.min_task.set(i, from_legacy_task(u.u16("legacy min_task")?));
        usage.tot.set(i, u.u64("legacy tot")?);
    }
    let out = &mut acct.usage_out;
    out.max.set(FS_SLOT, u.u64("legacy disk write max")?);
    out.max_node.set(FS_SLOT, from_legacy_node(u.u32("legacy disk write node")?));
    out.max_task.set(FS_SLOT, from_legacy_task(u.u16("legacy disk write task")?));
    out.tot.set(FS_SLOT, u.u64("legacy disk write tot")?);
    Ok(acct)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobAcct {
        let ids = vec![TRES_CPU as TresId, TRES_MEM as TresId, TRES_FS_DISK as TresId];
        let mut acct = JobAcct::for_task(ids, 0, 0, 0);
        acct.user_cpu_sec = 1;
        acct.user_cpu_usec = 500_000;
        acct.sys_cpu_usec = 250_000;
        acct.act_cpufreq = 2_400_000;
        acct.energy_consumed = 123;
        acct.set_in_sample(TRES_CPU as TresId, 400);
        acct.set_in_sample(TRES_MEM as TresId, 2048);
        acct.set_in_sample(TRES_FS_DISK as TresId, 1_048_576);
        acct
    }

    fn round_trip(acct: Option<&JobAcct>, version: ProtocolVersion) -> Option<JobAcct> {
        let mut p = Packer::new();
        encode_acct(acct, version, &mut p);
        let mut u = Unpacker::new(p.finish());
        let decoded = decode_acct(version, &mut u).unwrap();
        u.finish("acct").unwrap();
        decoded
    }

    #[test]
    fn vector_layout_round_trips() {
        let acct = record();
        for v in [ProtocolVersion::CURRENT, ProtocolVersion::PREVIOUS] {
            assert_eq!(round_trip(Some(&acct), v), Some(acct.clone()));
        }
    }

    #[test]
    fn absent_record_is_a_single_zero_byte() {
        let mut p = Packer::new();
        encode_acct(None, ProtocolVersion::CURRENT, &mut p);
        assert_eq!(&p.finish()[..], &[0]);
        assert_eq!(round_trip(None, ProtocolVersion::TWO_BACK), None);
    }

    #[test]
    fn legacy_layout_keeps_fixed_tres() {
        let acct = record();
        let legacy = round_trip(Some(&acct), ProtocolVersion::TWO_BACK).unwrap();
        assert_eq!(legacy.tres_ids, LEGACY_TRES.to_vec());
        assert_eq!(legacy.user_cpu_usec, 500_000);
        assert_eq!(legacy.energy_consumed, 123);

        // Back at the vector layout the three tracked TRES are intact.
        let back = legacy.realign(&acct.tres_ids);
        assert_eq!(back.usage_in, acct.usage_in);
        assert_eq!(back.cpu_time_ms(), Some(400));
        // VMEM was never sampled.
        assert_eq!(legacy.usage_in.tot.get(2), UNSET);
        assert_eq!(legacy.usage_in.max_task.get(2), UNSET);
    }

    #[test]
    fn legacy_drops_what_it_cannot_carry() {
        let mut acct = record();
        acct.set_out_sample(TRES_FS_DISK as TresId, 4096);
        acct.set_out_sample(TRES_MEM as TresId, 7);
        let extra = acct.track(1000);
        acct.usage_in.set_sample(extra, 99, 0, 0);

        let legacy = round_trip(Some(&acct), ProtocolVersion::TWO_BACK).unwrap();
        let back = legacy.realign(&acct.tres_ids);
        assert_eq!(back.usage_out.tot.get(2), 4096);
        assert_eq!(back.usage_out.max.get(2), 4096);
        assert_eq!(back.usage_out.min.get(2), UNSET);
        assert_eq!(back.usage_out.tot.get(1), UNSET);
        assert_eq!(back.usage_in.tot.get(extra), UNSET);
    }

    #[test]
    fn large_task_ids_saturate_in_legacy() {
        let mut acct = JobAcct::for_task(LEGACY_TRES.to_vec(), 0, 5, 70_000);
        acct.set_in_sample(TRES_CPU as TresId, 10);
        let legacy = round_trip(Some(&acct), ProtocolVersion::TWO_BACK).unwrap();
        assert_eq!(legacy.usage_in.max_node.get(0), 5);
        assert_eq!(legacy.usage_in.max_task.get(0), u64::from(u16::MAX - 1));
    }

    #[test]
    fn bad_flag_and_width_are_invalid() {
        let mut u = Unpacker::new(vec![2u8]);
        assert!(matches!(decode_acct(ProtocolVersion::CURRENT, &mut u), Err(ProtoError::Invalid { .. })));

        let mut p = Packer::new();
        encode_acct(Some(&record()), ProtocolVersion::CURRENT, &mut p);
        let mut bytes = p.finish().to_vec();
        bytes.truncate(bytes.len() - 8);
        let mut u = Unpacker::new(bytes);
        assert!(matches!(decode_acct(ProtocolVersion::CURRENT, &mut u), Err(ProtoError::Truncated { .. })));
    }
}
