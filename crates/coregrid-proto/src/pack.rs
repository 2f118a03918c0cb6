//! Big-endian pack/unpack primitives.
//!
//! ```text
//!   integers      fixed width, network order
//!   string        [len+1: u32][bytes][0x00]     len 0 = absent
//!   byte blob     [len: u32][bytes]
//!   array         [count: u32][elements]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, ProtoResult};

/// Upper bound on any array count read from the wire.
pub const MAX_ARRAY_LEN: u32 = 1 << 20;

#[derive(Debug, Default)]
pub struct Packer {
    buf: BytesMut,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    fn count(&mut self, n: usize) {
        self.u32(u32::try_from(n).unwrap_or(u32::MAX));
    }

    pub fn str(&mut self, s: &str) {
        self.count(s.len() + 1);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    pub fn opt_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) => self.str(s),
            None => self.u32(0),
        }
    }

    pub fn blob(&mut self, b: &[u8]) {
        self.count(b.len());
        self.buf.put_slice(b);
    }

    pub fn u32_array(&mut self, values: &[u32]) {
        self.count(values.len());
        for v in values {
            self.buf.put_u32(*v);
        }
    }

    pub fn u64_array(&mut self, values: &[u64]) {
        self.count(values.len());
        for v in values {
            self.buf.put_u64(*v);
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct Unpacker {
    buf: Bytes,
}

impl Unpacker {
    pub fn new(buf: impl Into<Bytes>) -> Self {
        Self { buf: buf.into() }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize, what: &'static str) -> ProtoResult<()> {
        let have = self.buf.remaining();
        if have < n {
            return Err(ProtoError::Truncated {
                what,
                needed: n - have,
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, what: &'static str) -> ProtoResult<u8> {
        self.need(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self, what: &'static str) -> ProtoResult<u16> {
        self.need(2, what)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self, what: &'static str) -> ProtoResult<u32> {
        self.need(4, what)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self, what: &'static str) -> ProtoResult<u64> {
        self.need(8, what)?;
        Ok(self.buf.get_u64())
    }

    pub fn i64(&mut self, what: &'static str) -> ProtoResult<i64> {
        self.need(8, what)?;
        Ok(self.buf.get_i64())
    }

    fn count(&mut self, what: &'static str) -> ProtoResult<usize> {
        let n = self.u32(what)?;
        if n > MAX_ARRAY_LEN {
            return Err(ProtoError::invalid(what, format!("count {n} exceeds {MAX_ARRAY_LEN}")));
        }
        Ok(n as usize)
    }

    fn take(&mut self, n: usize, what: &'static str) -> ProtoResult<Bytes> {
        self.need(n, what)?;
        Ok(self.buf.split_to(n))
    }

    pub fn opt_str(&mut self, what: &'static str) -> ProtoResult<Option<String>> {
        let n = self.count(what)?;
        if n == 0 {
            return Ok(None);
        }
        let raw = self.take(n, what)?;
        let Some((&0, text)) = raw.split_last() else {
            return Err(ProtoError::invalid(what, "missing terminator"));
        };
        String::from_utf8(text.to_vec())
            .map(Some)
            .map_err(|e| ProtoError::invalid(what, e.to_string()))
    }

    pub fn str(&mut self, what: &'static str) -> ProtoResult<String> {
        self.opt_str(what)?
            .ok_or_else(|| ProtoError::invalid(what, "required string is absent"))
    }

    pub fn blob(&mut self, what: &'static str) -> ProtoResult<Bytes> {
        let n = self.count(what)?;
        self.take(n, what)
    }

    pub fn u32_array(&mut self, what: &'static str) -> ProtoResult<Vec<u32>> {
        let n = self.count(what)?;
        self.need(n * 4, what)?;
        Ok((0..n).map(|_| self.buf.get_u32()).collect())
    }

    pub fn u64_array(&mut self, what: &'static str) -> ProtoResult<Vec<u64>> {
        let n = self.count(what)?;
        self.need(n * 8, what)?;
        Ok((0..n).map(|_| self.buf.get_u64()).collect())
    }

    /// Fail if bytes are left over after a complete message.
    pub fn finish(self, what: &'static str) -> ProtoResult<()> {
        if self.buf.has_remaining() {
            return Err(ProtoError::invalid(what, format!("{} trailing bytes", self.buf.remaining())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_carry_a_terminator() {
        let mut p = Packer::new();
        p.str("abc");
        p.opt_str(None);
        let bytes = p.finish();
        assert_eq!(&bytes[..], &[0, 0, 0, 4, b'a', b'b', b'c', 0, 0, 0, 0, 0]);

        let mut u = Unpacker::new(bytes);
        assert_eq!(u.str("s").unwrap(), "abc");
        assert_eq!(u.opt_str("o").unwrap(), None);
        u.finish("strings").unwrap();
    }

    #[test]
    fn short_input_is_truncated() {
        let mut u = Unpacker::new(vec![0u8, 1]);
        assert_eq!(
            u.u32("job_id"),
            Err(ProtoError::Truncated {
                what: "job_id",
                needed: 2
            })
        );
    }

    #[test]
    fn oversized_counts_are_rejected() {
        let mut p = Packer::new();
        p.u32(MAX_ARRAY_LEN + 1);
        let mut u = Unpacker::new(p.finish());
        assert!(matches!(u.u64_array("tot"), Err(ProtoError::Invalid { .. })));
    }

    #[test]
    fn unterminated_string_is_invalid() {
        let mut p = Packer::new();
        p.blob(b"ab");
        let mut u = Unpacker::new(p.finish());
        assert!(matches!(u.str("name"), Err(ProtoError::Invalid { .. })));
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let u = Unpacker::new(vec![1u8]);
        assert!(u.finish("msg").is_err());
    }
}
