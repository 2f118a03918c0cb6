//! Protocol version numbers.
//!
//! A version is `(major << 8) | 0`. A peer may speak the current release
//! or one of the two before it; anything else is refused.

use std::fmt;

use crate::error::{ProtoError, ProtoResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self::from_major(42);
    pub const PREVIOUS: Self = Self::from_major(41);
    pub const TWO_BACK: Self = Self::from_major(40);
    pub const MIN_SUPPORTED: Self = Self::TWO_BACK;

    pub const fn from_major(major: u8) -> Self {
        Self((major as u16) << 8)
    }

    pub const fn major(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Accept a version number received from a peer.
    pub fn negotiate(raw: u16) -> ProtoResult<Self> {
        let v = Self(raw);
        if v < Self::MIN_SUPPORTED || v > Self::CURRENT || raw & 0xff != 0 {
            return Err(ProtoError::UnsupportedVersion(raw));
        }
        Ok(v)
    }

    /// Whether accounting records use the fixed-id layout.
    pub fn legacy_acct(self) -> bool {
        self < Self::PREVIOUS
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.0", self.major())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_releases_are_accepted() {
        for v in [ProtocolVersion::CURRENT, ProtocolVersion::PREVIOUS, ProtocolVersion::TWO_BACK] {
            assert_eq!(ProtocolVersion::negotiate(v.raw()), Ok(v));
        }
        assert_eq!(ProtocolVersion::CURRENT.raw(), 42 << 8);
    }

    #[test]
    fn older_and_unknown_versions_are_refused() {
        let old = ProtocolVersion::from_major(39).raw();
        assert_eq!(ProtocolVersion::negotiate(old), Err(ProtoError::UnsupportedVersion(old)));
        let newer = ProtocolVersion::from_major(43).raw();
        assert!(ProtocolVersion::negotiate(newer).is_err());
        assert!(ProtocolVersion::negotiate((42 << 8) | 1).is_err());
    }

    #[test]
    fn only_two_back_is_legacy() {
        assert!(ProtocolVersion::TWO_BACK.legacy_acct());
        assert!(!ProtocolVersion::PREVIOUS.legacy_acct());
        assert!(!ProtocolVersion::CURRENT.legacy_acct());
        assert_eq!(ProtocolVersion::CURRENT.to_string(), "42.0");
    }
}
