//! Trackable resources (TRES).
//!
//! Every countable consumable the cluster tracks (CPU time, memory, energy,
//! disk I/O, GRES instances, interconnect traffic) gets a stable index in
//! the [`TresTable`]. Usage is carried in [`TresVec`], a fixed-width array
//! addressed by that index, and assignments (how much of each TRES a job
//! holds) in [`TresList`], a sorted sparse `(id, count)` list.
//!
//! The value [`UNSET`] (all ones) marks a slot that has not been sampled.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a TRES; equal to its index in the table.
pub type TresId = u32;

/// "Not yet sampled" marker for TRES scalars.
pub const UNSET: u64 = u64::MAX;

pub const TRES_CPU: usize = 0;
pub const TRES_MEM: usize = 1;
pub const TRES_ENERGY: usize = 2;
pub const TRES_FS_DISK: usize = 3;
pub const TRES_VMEM: usize = 4;
pub const TRES_PAGES: usize = 5;
/// Number of built-in TRES; dynamic entries are appended after these.
pub const TRES_STATIC_CNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TresError {
    #[error("TRES vector width mismatch: {left} != {right}")]
    WidthMismatch { left: usize, right: usize },

    #[error("malformed TRES string: {0}")]
    Parse(String),

    #[error("unknown TRES: {0}")]
    Unknown(String),
}

pub type TresResult<T> = Result<T, TresError>;

// ── Table ──────────────────────────────────────────────────────────

/// Definition of one trackable resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TresDef {
    pub id: TresId,
    /// Resource class: `cpu`, `mem`, `energy`, `fs`, `vmem`, `pages`, `gres`, `ic`.
    pub kind: String,
    /// Sub-name for classed resources (`disk`, `gpu`, `lustre`, ...).
    pub name: Option<String>,
}

impl TresDef {
    /// Display name: `cpu`, `fs/disk`, `gres/gpu`.
    pub fn full_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{}/{}", self.kind, name),
            None => self.kind.clone(),
        }
    }
}

/// Registry mapping TRES ids to names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TresTable {
    defs: Vec<TresDef>,
}

impl Default for TresTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TresTable {
    /// Table holding only the built-in resources.
    pub fn new() -> Self {
        let statics: [(&str, Option<&str>); TRES_STATIC_CNT] = [
            ("cpu", None),
            ("mem", None),
            ("energy", None),
            ("fs", Some("disk")),
            ("vmem", None),
            ("pages", None),
        ];
        let defs = statics
            .iter()
            .enumerate()
            .map(|(i, (kind, name))| TresDef {
                id: i as TresId,
                kind: kind.to_string(),
                name: name.map(str::to_string),
            })
            .collect();
        Self { defs }
    }

    /// Process-wide table. Readers take the shared lock for lookups and
    /// stringification; only a configuration reload takes the write lock.
    pub fn global() -> &'static RwLock<TresTable> {
        static TABLE: OnceLock<RwLock<TresTable>> = OnceLock::new();
        TABLE.get_or_init(|| RwLock::new(TresTable::new()))
    }

    /// Register `kind/name`, returning the existing id when already present.
    pub fn register(&mut self, kind: &str, name: Option<&str>) -> TresId {
        if let Some(def) = self
            .defs
            .iter()
            .find(|d| d.kind == kind && d.name.as_deref() == name)
        {
            return def.id;
        }
        let id = self.defs.len() as TresId;
        self.defs.push(TresDef {
            id,
            kind: kind.to_string(),
            name: name.map(str::to_string),
        });
        id
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn get(&self, id: TresId) -> Option<&TresDef> {
        self.defs.get(id as usize)
    }

    /// Look up by full name (`cpu`, `gres/gpu`).
    pub fn id_by_name(&self, full_name: &str) -> Option<TresId> {
        let (kind, name) = match full_name.split_once('/') {
            Some((k, n)) => (k, Some(n)),
            None => (full_name, None),
        };
        self.defs
            .iter()
            .find(|d| d.kind == kind && d.name.as_deref() == name)
            .map(|d| d.id)
    }

    pub fn name_of(&self, id: TresId) -> Option<String> {
        self.get(id).map(TresDef::full_name)
    }

    /// Ids of all registered resources, in index order.
    pub fn ids(&self) -> Vec<TresId> {
        self.defs.iter().map(|d| d.id).collect()
    }

    /// Render a list with names instead of ids: `cpu=4,mem=2048,gres/gpu=2`.
    pub fn format_named(&self, list: &TresList) -> String {
        list.iter()
            .map(|c| match self.name_of(c.id) {
                Some(name) => format!("{name}={}", c.count),
                None => format!("{}={}", c.id, c.count),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse a named list (`cpu=4,gres/gpu=2`); numeric ids are accepted too.
    pub fn parse_named(&self, s: &str) -> TresResult<TresList> {
        let mut map = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| TresError::Parse(part.to_string()))?;
            let id = match key.parse::<TresId>() {
                Ok(id) => id,
                Err(_) => self
                    .id_by_name(key)
                    .ok_or_else(|| TresError::Unknown(key.to_string()))?,
            };
            let count = value
                .parse::<i64>()
                .map_err(|_| TresError::Parse(part.to_string()))?;
            map.insert(id, count);
        }
        Ok(TresList::from_map(map))
    }
}

// ── Fixed-width vector ─────────────────────────────────────────────

/// Usage values indexed by TRES index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TresVec(Vec<u64>);

impl TresVec {
    /// A vector of `width` unset slots.
    pub fn unset(width: usize) -> Self {
        Self(vec![UNSET; width])
    }

    /// A vector of `width` zero slots.
    pub fn zeroed(width: usize) -> Self {
        Self(vec![0; width])
    }

    pub fn from_vec(values: Vec<u64>) -> Self {
        Self(values)
    }

    pub fn width(&self) -> usize {
        self.0.len()
    }

    /// Value at `index`; out-of-range reads as [`UNSET`].
    pub fn get(&self, index: usize) -> u64 {
        self.0.get(index).copied().unwrap_or(UNSET)
    }

    pub fn set(&mut self, index: usize, value: u64) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = value;
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.get(index) != UNSET
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u64> {
        self.0
    }

    /// Grow to `width` slots, filling new ones with `fill`.
    pub fn resize(&mut self, width: usize, fill: u64) {
        self.0.resize(width, fill);
    }

    fn check_width(&self, other: &TresVec) -> TresResult<()> {
        if self.width() != other.width() {
            return Err(TresError::WidthMismatch {
                left: self.width(),
                right: other.width(),
            });
        }
        Ok(())
    }

    /// Element-wise maximum; an unset slot takes the other side's value.
    pub fn merge_max(&mut self, other: &TresVec) -> TresResult<()> {
        self.check_width(other)?;
        for (a, &b) in self.0.iter_mut().zip(&other.0) {
            *a = merge_max_value(*a, b);
        }
        Ok(())
    }

    /// Element-wise minimum; an unset slot takes the other side's value.
    pub fn merge_min(&mut self, other: &TresVec) -> TresResult<()> {
        self.check_width(other)?;
        for (a, &b) in self.0.iter_mut().zip(&other.0) {
            *a = merge_min_value(*a, b);
        }
        Ok(())
    }

    /// Add `sample` into the running totals. Unset samples contribute nothing.
    pub fn accumulate_total(&mut self, sample: &TresVec) -> TresResult<()> {
        self.check_width(sample)?;
        for (a, &b) in self.0.iter_mut().zip(&sample.0) {
            *a = add_value(*a, b);
        }
        Ok(())
    }

    /// `id=count` pairs for every set slot, e.g. `0=400,1=2048`.
    pub fn to_simple_string(&self) -> String {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != UNSET)
            .map(|(i, v)| format!("{i}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the output of [`TresVec::to_simple_string`] into a vector of
    /// `width` slots; slots not mentioned stay unset.
    pub fn from_string(s: &str, width: usize) -> TresResult<Self> {
        let mut vec = Self::unset(width);
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (id, value) = part
                .split_once('=')
                .ok_or_else(|| TresError::Parse(part.to_string()))?;
            let id: usize = id.parse().map_err(|_| TresError::Parse(part.to_string()))?;
            let value: u64 = value
                .parse()
                .map_err(|_| TresError::Parse(part.to_string()))?;
            if id >= width {
                return Err(TresError::Unknown(id.to_string()));
            }
            vec.0[id] = value;
        }
        Ok(vec)
    }
}

/// Maximum of two scalars where [`UNSET`] yields to the other operand.
pub fn merge_max_value(a: u64, b: u64) -> u64 {
    match (a, b) {
        (UNSET, b) => b,
        (a, UNSET) => a,
        (a, b) => a.max(b),
    }
}

/// Minimum of two scalars where [`UNSET`] yields to the other operand.
pub fn merge_min_value(a: u64, b: u64) -> u64 {
    match (a, b) {
        (UNSET, b) => b,
        (a, UNSET) => a,
        (a, b) => a.min(b),
    }
}

/// Saturating sum where [`UNSET`] yields to the other operand.
pub fn add_value(a: u64, b: u64) -> u64 {
    match (a, b) {
        (UNSET, b) => b,
        (a, UNSET) => a,
        (a, b) => a.saturating_add(b).min(UNSET - 1),
    }
}

// ── Sparse assignment list ─────────────────────────────────────────

/// One `(id, count)` entry. A count of `-1` in a diff means "removed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TresCount {
    pub id: TresId,
    pub count: i64,
}

/// Sorted, duplicate-free list of TRES counts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TresList(Vec<TresCount>);

impl TresList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    fn from_map(map: BTreeMap<TresId, i64>) -> Self {
        Self(
            map.into_iter()
                .map(|(id, count)| TresCount { id, count })
                .collect(),
        )
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (TresId, i64)>) -> Self {
        Self::from_map(pairs.into_iter().collect())
    }

    pub fn get(&self, id: TresId) -> Option<i64> {
        self.0
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|i| self.0[i].count)
    }

    /// Insert or replace the count for `id`.
    pub fn set(&mut self, id: TresId, count: i64) {
        match self.0.binary_search_by_key(&id, |c| c.id) {
            Ok(i) => self.0[i].count = count,
            Err(i) => self.0.insert(i, TresCount { id, count }),
        }
    }

    pub fn remove(&mut self, id: TresId) -> Option<i64> {
        match self.0.binary_search_by_key(&id, |c| c.id) {
            Ok(i) => Some(self.0.remove(i).count),
            Err(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TresCount> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse `id=count,id=count`.
    pub fn from_string(s: &str) -> TresResult<Self> {
        let mut map = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (id, count) = part
                .split_once('=')
                .ok_or_else(|| TresError::Parse(part.to_string()))?;
            let id: TresId = id.parse().map_err(|_| TresError::Parse(part.to_string()))?;
            let count: i64 = count
                .parse()
                .map_err(|_| TresError::Parse(part.to_string()))?;
            map.insert(id, count);
        }
        Ok(Self::from_map(map))
    }

    /// Minimal update turning `old` into `new`: changed or added ids carry
    /// their new count, removed ids carry `-1`, unchanged ids are omitted.
    pub fn diff_assignment(old: &TresList, new: &TresList) -> TresList {
        let mut out = TresList::new();
        for c in new.iter() {
            if old.get(c.id) != Some(c.count) {
                out.set(c.id, c.count);
            }
        }
        for c in old.iter() {
            if new.get(c.id).is_none() {
                out.set(c.id, -1);
            }
        }
        out
    }

    /// Apply a diff produced by [`TresList::diff_assignment`].
    pub fn apply(&mut self, diff: &TresList) {
        for c in diff.iter() {
            if c.count == -1 {
                self.remove(c.id);
            } else {
                self.set(c.id, c.count);
            }
        }
    }
}

impl fmt::Display for TresList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|c| format!("{}={}", c.id, c.count))
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_names() {
        let table = TresTable::new();
        assert_eq!(table.len(), TRES_STATIC_CNT);
        assert_eq!(table.name_of(TRES_CPU as TresId).as_deref(), Some("cpu"));
        assert_eq!(table.name_of(TRES_FS_DISK as TresId).as_deref(), Some("fs/disk"));
        assert_eq!(table.id_by_name("vmem"), Some(TRES_VMEM as TresId));
    }

    #[test]
    fn register_is_idempotent() {
        let mut table = TresTable::new();
        let gpu = table.register("gres", Some("gpu"));
        assert_eq!(gpu as usize, TRES_STATIC_CNT);
        assert_eq!(table.register("gres", Some("gpu")), gpu);
        assert_eq!(table.id_by_name("gres/gpu"), Some(gpu));
    }

    #[test]
    fn merge_treats_unset_as_absent() {
        let mut a = TresVec::from_vec(vec![UNSET, 5, 10]);
        let b = TresVec::from_vec(vec![3, UNSET, 12]);

        let mut max = a.clone();
        max.merge_max(&b).unwrap();
        assert_eq!(max.as_slice(), &[3, 5, 12]);

        a.merge_min(&b).unwrap();
        assert_eq!(a.as_slice(), &[3, 5, 10]);
    }

    #[test]
    fn accumulate_starts_from_first_sample() {
        let mut tot = TresVec::unset(2);
        tot.accumulate_total(&TresVec::from_vec(vec![4, UNSET])).unwrap();
        tot.accumulate_total(&TresVec::from_vec(vec![6, UNSET])).unwrap();
        assert_eq!(tot.as_slice(), &[10, UNSET]);
    }

    #[test]
    fn width_mismatch_is_an_error() {
        let mut a = TresVec::unset(2);
        assert!(matches!(
            a.merge_max(&TresVec::unset(3)),
            Err(TresError::WidthMismatch { left: 2, right: 3 })
        ));
    }

    #[test]
    fn simple_string_skips_unset() {
        let v = TresVec::from_vec(vec![400, UNSET, 7]);
        assert_eq!(v.to_simple_string(), "0=400,2=7");
        assert_eq!(TresVec::from_string("0=400,2=7", 3).unwrap(), v);
        assert!(TresVec::from_string("9=1", 3).is_err());
        assert!(TresVec::from_string("0:1", 3).is_err());
    }

    #[test]
    fn diff_marks_removed_ids() {
        let old = TresList::from_string("1=4,2=100,4=1").unwrap();
        let new = TresList::from_string("1=4,2=200,6=2").unwrap();
        let diff = TresList::diff_assignment(&old, &new);
        assert_eq!(diff.to_string(), "2=200,4=-1,6=2");
    }

    #[test]
    fn apply_diff_reaches_target() {
        let cases = [
            ("1=4,2=100,4=1", "1=4,2=200,6=2"),
            ("", "1=1"),
            ("1=1,2=2", ""),
            ("3=3", "3=3"),
        ];
        for (current, target) in cases {
            let mut cur = TresList::from_string(current).unwrap();
            let tgt = TresList::from_string(target).unwrap();
            let diff = TresList::diff_assignment(&cur, &tgt);
            cur.apply(&diff);
            assert_eq!(cur, tgt, "{current} -> {target}");
        }
    }

    #[test]
    fn named_format_uses_table() {
        let mut table = TresTable::new();
        let gpu = table.register("gres", Some("gpu"));
        let list = table.parse_named("cpu=4,gres/gpu=2").unwrap();
        assert_eq!(list.get(gpu), Some(2));
        assert_eq!(table.format_named(&list), "cpu=4,gres/gpu=2");
        assert!(matches!(table.parse_named("bogus=1"), Err(TresError::Unknown(_))));
    }
}
