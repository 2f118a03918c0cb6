//! Step control: how the sampler tells a step it is over its limits.

use tracing::{debug, warn};

use crate::error::{AcctError, AcctResult};
use crate::sampler::StepKey;

pub trait StepControl: Send + Sync {
    /// Deliver a message to the step's user.
    fn notify(&self, step: StepKey, message: &str);

    /// Signal every process of the step.
    fn cancel(&self, step: StepKey, signal: i32, pids: &[u32]) -> AcctResult<()>;
}

/// Signals local processes with `kill(2)`. Notifications go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalControl;

impl StepControl for LocalControl {
    fn notify(&self, step: StepKey, message: &str) {
        warn!(step = %step, "{message}");
    }

    fn cancel(&self, step: StepKey, signal: i32, pids: &[u32]) -> AcctResult<()> {
        let mut failed = Vec::new();
        for &pid in pids {
            let Ok(target) = libc::pid_t::try_from(pid) else {
                failed.push(pid);
                continue;
            };
            if target <= 0 {
                failed.push(pid);
                continue;
            }
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(target, signal) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ESRCH) {
                    debug!(step = %step, pid, "process already gone");
                } else {
                    failed.push(pid);
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(AcctError::Signal(format!("step {step}: could not signal pids {failed:?}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pid_is_refused() {
        // pid 0 would signal our own process group.
        let err = LocalControl.cancel(StepKey::new(1, 0), 0, &[0]).unwrap_err();
        assert!(matches!(err, AcctError::Signal(_)));
    }

    #[test]
    fn signal_zero_reaches_own_process() {
        let me = std::process::id();
        LocalControl.cancel(StepKey::new(1, 0), 0, &[me]).unwrap();
    }
}
