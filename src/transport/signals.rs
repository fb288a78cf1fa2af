//! Decoding of worker process termination for diagnostics.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Reaped elsewhere, or a status that does not mean termination.
    Unknown,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig:?}"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

impl From<WaitStatus> for TerminationReason {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Self::Signaled(signal),
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_wait_status_decoding() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            TerminationReason::from(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            TerminationReason::from(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
        assert_eq!(
            TerminationReason::from(WaitStatus::StillAlive),
            TerminationReason::Unknown
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            TerminationReason::Exited(2).to_string(),
            "exited with code 2"
        );
        assert!(
            TerminationReason::Signaled(Signal::SIGTERM)
                .to_string()
                .contains("SIGTERM")
        );
    }
}
