//! Fixed-width resource bitmaps for nodes and cores.
//!
//! A [`Bitmap`] never changes size after creation. Every operation that
//! combines two bitmaps checks the sizes first and fails with
//! [`BitmapError::SizeMismatch`] instead of silently truncating.
//!
//! The combining operations (`and`, `or`, `and_not`, `overlap_count`) run
//! over the backing `u64` words directly; the scheduler calls them for every
//! candidate node on every pass.

use std::fmt;

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by bitmap operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitmapError {
    #[error("bitmap size mismatch: {left} != {right}")]
    SizeMismatch { left: usize, right: usize },

    #[error("bit {index} out of range for bitmap of size {size}")]
    OutOfRange { index: usize, size: usize },

    #[error("invalid range expression: {0}")]
    Parse(String),
}

pub type BitmapResult<T> = Result<T, BitmapError>;

/// Dense fixed-size bitset.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "BitmapRepr", try_from = "BitmapRepr")]
pub struct Bitmap {
    bits: BitVec<u64, Lsb0>,
}

/// Serialized form: the size plus a range expression (`"0-3,7"`).
#[derive(Serialize, Deserialize)]
struct BitmapRepr {
    size: usize,
    set: String,
}

impl From<Bitmap> for BitmapRepr {
    fn from(map: Bitmap) -> Self {
        Self {
            size: map.size(),
            set: map.fmt_ranges(),
        }
    }
}

impl TryFrom<BitmapRepr> for Bitmap {
    type Error = BitmapError;

    fn try_from(repr: BitmapRepr) -> Result<Self, Self::Error> {
        Bitmap::from_ranges(repr.size, &repr.set)
    }
}

impl Bitmap {
    /// Create an all-clear bitmap of `size` bits.
    pub fn new(size: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; size],
        }
    }

    /// Create an all-set bitmap of `size` bits.
    pub fn full(size: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 1; size],
        }
    }

    /// Build a bitmap of `size` bits with the given indices set.
    pub fn from_indices(size: usize, indices: impl IntoIterator<Item = usize>) -> BitmapResult<Self> {
        let mut map = Self::new(size);
        for i in indices {
            map.try_set(i)?;
        }
        Ok(map)
    }

    pub fn size(&self) -> usize {
        self.bits.len()
    }

    /// Set bit `i`. Out-of-range indices are ignored in release builds.
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.size(), "bit {i} out of range {}", self.size());
        if i < self.size() {
            self.bits.set(i, true);
        }
    }

    /// Set bit `i`, reporting out-of-range indices.
    pub fn try_set(&mut self, i: usize) -> BitmapResult<()> {
        if i >= self.size() {
            return Err(BitmapError::OutOfRange {
                index: i,
                size: self.size(),
            });
        }
        self.bits.set(i, true);
        Ok(())
    }

    pub fn clear(&mut self, i: usize) {
        if i < self.size() {
            self.bits.set(i, false);
        }
    }

    /// Test bit `i`; out-of-range bits read as clear.
    pub fn test(&self, i: usize) -> bool {
        self.bits.get(i).map(|b| *b).unwrap_or(false)
    }

    /// Set bits in `[lo, hi)`.
    pub fn set_range(&mut self, lo: usize, hi: usize) {
        let hi = hi.min(self.size());
        if lo < hi {
            self.bits[lo..hi].fill(true);
        }
    }

    /// Clear bits in `[lo, hi)`.
    pub fn clear_range(&mut self, lo: usize, hi: usize) {
        let hi = hi.min(self.size());
        if lo < hi {
            self.bits[lo..hi].fill(false);
        }
    }

    pub fn set_all(&mut self) {
        self.bits.fill(true);
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }

    /// Number of set bits in `[lo, hi)`.
    pub fn count_range(&self, lo: usize, hi: usize) -> usize {
        let hi = hi.min(self.size());
        if lo >= hi {
            return 0;
        }
        self.bits[lo..hi].count_ones()
    }

    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    pub fn last_set(&self) -> Option<usize> {
        self.bits.last_one()
    }

    /// Index of the `n`th set bit (zero-based).
    pub fn nth_set(&self, n: usize) -> Option<usize> {
        self.bits.iter_ones().nth(n)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn any(&self) -> bool {
        self.bits.any()
    }

    pub fn iter_set(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    fn check_size(&self, other: &Bitmap) -> BitmapResult<()> {
        if self.size() != other.size() {
            return Err(BitmapError::SizeMismatch {
                left: self.size(),
                right: other.size(),
            });
        }
        Ok(())
    }

    /// `self &= other`
    pub fn and(&mut self, other: &Bitmap) -> BitmapResult<()> {
        self.check_size(other)?;
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a &= *b;
        }
        Ok(())
    }

    /// `self |= other`
    pub fn or(&mut self, other: &Bitmap) -> BitmapResult<()> {
        self.check_size(other)?;
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a |= *b;
        }
        Ok(())
    }

    /// `self &= !other`
    pub fn and_not(&mut self, other: &Bitmap) -> BitmapResult<()> {
        self.check_size(other)?;
        for (a, b) in self
            .bits
            .as_raw_mut_slice()
            .iter_mut()
            .zip(other.bits.as_raw_slice())
        {
            *a &= !*b;
        }
        Ok(())
    }

    /// Overwrite `self` with the contents of `other`.
    pub fn copy_from(&mut self, other: &Bitmap) -> BitmapResult<()> {
        self.check_size(other)?;
        self.bits.copy_from_bitslice(&other.bits);
        Ok(())
    }

    /// Number of bits set in both bitmaps.
    pub fn overlap_count(&self, other: &Bitmap) -> BitmapResult<usize> {
        self.check_size(other)?;
        let mut total = 0usize;
        for (a, b) in self.bits.as_raw_slice().iter().zip(other.bits.as_raw_slice()) {
            total += (a & b).count_ones() as usize;
        }
        // `full` may leave bits past `size` set in the last raw word.
        let tail = self.size() % 64;
        if tail != 0 {
            let words = self.bits.as_raw_slice();
            let others = other.bits.as_raw_slice();
            if let (Some(a), Some(b)) = (words.last(), others.last()) {
                let dead = !((1u64 << tail) - 1);
                total -= ((a & b) & dead).count_ones() as usize;
            }
        }
        Ok(total)
    }

    pub fn overlaps(&self, other: &Bitmap) -> BitmapResult<bool> {
        Ok(self.overlap_count(other)? > 0)
    }

    /// True when every bit set in `other` is also set in `self`.
    pub fn is_superset(&self, other: &Bitmap) -> BitmapResult<bool> {
        self.check_size(other)?;
        Ok(other.iter_set().all(|i| self.test(i)))
    }

    /// Flip every bit.
    pub fn invert(&mut self) {
        let len = self.size();
        for i in 0..len {
            let v = self.test(i);
            self.bits.set(i, !v);
        }
    }

    /// Copy bits `[lo, hi)` into a new bitmap of size `hi - lo`.
    pub fn slice(&self, lo: usize, hi: usize) -> Bitmap {
        let hi = hi.min(self.size());
        if lo >= hi {
            return Bitmap::new(0);
        }
        Bitmap {
            bits: self.bits[lo..hi].to_bitvec(),
        }
    }

    /// Write `src` into `self` starting at bit `offset`.
    pub fn splice(&mut self, offset: usize, src: &Bitmap) -> BitmapResult<()> {
        if offset + src.size() > self.size() {
            return Err(BitmapError::OutOfRange {
                index: offset + src.size(),
                size: self.size(),
            });
        }
        self.bits[offset..offset + src.size()].copy_from_bitslice(&src.bits);
        Ok(())
    }

    /// Append `other` to the end of `self`, growing it.
    pub fn append(&mut self, other: &Bitmap) {
        self.bits.extend_from_bitslice(&other.bits);
    }

    /// Format set bits as a compact range list, e.g. `0-3,7,9-10`.
    pub fn fmt_ranges(&self) -> String {
        let mut out = String::new();
        let mut iter = self.iter_set().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{start}-{end}"));
            }
        }
        out
    }

    /// Parse a range list produced by [`Bitmap::fmt_ranges`].
    pub fn from_ranges(size: usize, expr: &str) -> BitmapResult<Self> {
        let mut map = Self::new(size);
        for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (parse_index(lo)?, parse_index(hi)?),
                None => {
                    let i = parse_index(part)?;
                    (i, i)
                }
            };
            if lo > hi {
                return Err(BitmapError::Parse(part.to_string()));
            }
            if hi >= size {
                return Err(BitmapError::OutOfRange { index: hi, size });
            }
            map.set_range(lo, hi + 1);
        }
        Ok(map)
    }
}

fn parse_index(s: &str) -> BitmapResult<usize> {
    s.trim()
        .parse::<usize>()
        .map_err(|_| BitmapError::Parse(s.to_string()))
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fmt_ranges())
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap[{}]({})", self.size(), self.fmt_ranges())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_clear_and_test() {
        let mut map = Bitmap::new(70);
        map.set(0);
        map.set(65);
        assert!(map.test(0));
        assert!(map.test(65));
        assert!(!map.test(1));
        assert!(!map.test(500));
        map.clear(65);
        assert!(!map.test(65));
        assert_eq!(map.count(), 1);
    }

    #[test]
    fn first_and_last_set() {
        let mut map = Bitmap::new(128);
        assert_eq!(map.first_set(), None);
        map.set(3);
        map.set(100);
        assert_eq!(map.first_set(), Some(3));
        assert_eq!(map.last_set(), Some(100));
        assert_eq!(map.nth_set(1), Some(100));
    }

    #[test]
    fn word_ops_combine_bits() {
        let mut a = Bitmap::from_indices(80, [1, 2, 70]).unwrap();
        let b = Bitmap::from_indices(80, [2, 3, 70]).unwrap();

        let mut and = a.clone();
        and.and(&b).unwrap();
        assert_eq!(and.iter_set().collect::<Vec<_>>(), vec![2, 70]);

        let mut or = a.clone();
        or.or(&b).unwrap();
        assert_eq!(or.iter_set().collect::<Vec<_>>(), vec![1, 2, 3, 70]);

        a.and_not(&b).unwrap();
        assert_eq!(a.iter_set().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn mismatched_sizes_fail() {
        let mut a = Bitmap::new(8);
        let b = Bitmap::new(9);
        assert_eq!(
            a.and(&b),
            Err(BitmapError::SizeMismatch { left: 8, right: 9 })
        );
        assert!(a.or(&b).is_err());
        assert!(a.and_not(&b).is_err());
        assert!(a.copy_from(&b).is_err());
        assert!(a.overlap_count(&b).is_err());
    }

    #[test]
    fn overlap_ignores_bits_past_size() {
        let a = Bitmap::full(10);
        let b = Bitmap::full(10);
        assert_eq!(a.overlap_count(&b).unwrap(), 10);
    }

    #[test]
    fn range_format_roundtrips() {
        let map = Bitmap::from_indices(16, [0, 1, 2, 3, 7, 9, 10]).unwrap();
        assert_eq!(map.fmt_ranges(), "0-3,7,9-10");
        let parsed = Bitmap::from_ranges(16, "0-3,7,9-10").unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn range_parse_rejects_out_of_range() {
        assert!(matches!(
            Bitmap::from_ranges(4, "2-5"),
            Err(BitmapError::OutOfRange { index: 5, size: 4 })
        ));
        assert!(matches!(Bitmap::from_ranges(4, "x"), Err(BitmapError::Parse(_))));
    }

    #[test]
    fn slice_splice_and_append() {
        let map = Bitmap::from_indices(12, [4, 5, 9]).unwrap();
        let part = map.slice(4, 8);
        assert_eq!(part.size(), 4);
        assert_eq!(part.iter_set().collect::<Vec<_>>(), vec![0, 1]);

        let mut dst = Bitmap::new(12);
        dst.splice(8, &part).unwrap();
        assert_eq!(dst.iter_set().collect::<Vec<_>>(), vec![8, 9]);

        let mut grown = Bitmap::new(2);
        grown.append(&part);
        assert_eq!(grown.size(), 6);
        assert_eq!(grown.iter_set().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn serde_uses_range_string() {
        let map = Bitmap::from_indices(8, [1, 2, 3]).unwrap();
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"size":8,"set":"1-3"}"#);
        let back: Bitmap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
