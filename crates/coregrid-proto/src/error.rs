use thiserror::Error;

/// Errors raised while encoding or decoding protocol messages. Any of
/// them closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("truncated message: needed {needed} more bytes for {what}")]
    Truncated { what: &'static str, needed: usize },

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },

    #[error("body length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: u32, actual: usize },
}

pub type ProtoResult<T> = Result<T, ProtoError>;

impl ProtoError {
    pub(crate) fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            what,
            reason: reason.into(),
        }
    }
}
