//! Liveness and termination control for spawned worker processes.

use super::ProcessControl;
use super::signals::TerminationReason;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Poll interval while waiting for a worker to exit on its own.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Control handle for a child process identified by pid.
///
/// The child is reaped at most once; after that every probe reports it dead
/// and no signal is ever sent to the (possibly reused) pid again.
#[derive(Debug)]
pub struct ProcControl {
    pid: Pid,
    /// Set once the process has been reaped.
    reaped: Mutex<Option<TerminationReason>>,
}

impl ProcControl {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            reaped: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<TerminationReason>> {
        self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking reap. Returns true if the process is still running.
    fn poll(&self, state: &mut Option<TerminationReason>) -> bool {
        if state.is_some() {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(status) => {
                *state = Some(status.into());
                false
            }
            Err(_) => {
                *state = Some(TerminationReason::Unknown);
                false
            }
        }
    }

    fn kill_locked(&self, state: &mut Option<TerminationReason>) {
        if state.is_some() {
            return;
        }
        if let Err(e) = signal::kill(self.pid, Signal::SIGKILL) {
            trace!(pid = self.pid.as_raw(), error = %e, "SIGKILL failed");
        }
        *state = Some(match waitpid(self.pid, None) {
            Ok(status) => status.into(),
            Err(_) => TerminationReason::Unknown,
        });
    }
}

impl ProcessControl for ProcControl {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn is_alive(&self) -> bool {
        let mut state = self.state();
        self.poll(&mut state)
    }

    fn shutdown(&self, grace: Duration) {
        let start = Instant::now();
        while start.elapsed() < grace {
            if !self.is_alive() {
                return;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
        debug!(
            pid = self.pid.as_raw(),
            grace_ms = grace.as_millis(),
            "Worker did not exit within grace period, killing"
        );
        self.kill();
    }

    fn kill(&self) {
        let mut state = self.state();
        self.kill_locked(&mut state);
    }

    fn termination(&self) -> Option<TerminationReason> {
        *self.state()
    }
}

impl Drop for ProcControl {
    fn drop(&mut self) {
        let state = self.reaped.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.is_none() {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            *state = Some(TerminationReason::Signaled(Signal::SIGKILL));
        }
    }
}
