//! Accounting error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::options::OptionsError;
use crate::sampler::StepKey;

#[derive(Debug, Error)]
pub enum AcctError {
    #[error("accounting is shutting down")]
    ShutdownInProgress,

    #[error("bad pid {0}")]
    BadPid(u32),

    #[error("unknown step {0}")]
    UnknownStep(StepKey),

    #[error("step {0} already has a sampler")]
    StepExists(StepKey),

    /// A `/proc` or sysfs file could not be read, usually because the
    /// process exited between enumeration and read.
    #[error("reading {path}: {source}")]
    SamplerIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("step {step} exceeded its memory limit: {used} > {limit} bytes")]
    MemoryLimitExceeded { step: StepKey, used: u64, limit: u64 },

    #[error("signal delivery failed: {0}")]
    Signal(String),

    #[error(transparent)]
    Options(#[from] OptionsError),
}

pub type AcctResult<T> = Result<T, AcctError>;

impl AcctError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AcctError::SamplerIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        AcctError::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the process simply went away.
    pub fn is_vanished(&self) -> bool {
        match self {
            AcctError::SamplerIo { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) || source.raw_os_error() == Some(libc::ESRCH),
            _ => false,
        }
    }
}
