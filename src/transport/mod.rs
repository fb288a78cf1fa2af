//! Process transport consumed by the pool.
//!
//! The pool never touches processes directly. It asks a [`WorkerTransport`] to
//! spawn a worker for a key and gets back three independently owned parts:
//!
//! ```text
//!   SpawnedProcess
//!   ├── control: Arc<dyn ProcessControl>   liveness probe, shutdown, kill
//!   ├── writer:  Box<dyn RequestWriter>    framed requests  -> worker stdin
//!   └── reader:  Box<dyn ResponseReader>   framed responses <- worker stdout
//! ```
//!
//! Splitting them lets a multiplexed worker hand the reader to a dedicated
//! demultiplexing thread while callers share the writer under a lock, and lets
//! the pool kill a process whose handle is currently borrowed.

mod ipc;
mod proc;
pub mod protocol;
mod signals;
mod spawn;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::Result;
use crate::pool::{WorkerId, WorkerKey};
use std::sync::Arc;
use std::time::Duration;

pub use ipc::{LineReader, LineWriter, PipeFd};
pub use proc::ProcControl;
pub use protocol::{SINGLEPLEX_REQUEST_ID, WorkRequest, WorkResponse};
pub use signals::TerminationReason;
pub use spawn::{CommandTransport, PERSISTENT_WORKER_FLAG};

/// Starts worker processes.
pub trait WorkerTransport: Send + Sync {
    /// Start a new physical worker process for `key`.
    fn spawn(&self, key: &WorkerKey, id: WorkerId) -> Result<SpawnedProcess>;
}

/// Lifecycle control over one running process.
pub trait ProcessControl: Send + Sync {
    fn pid(&self) -> u32;

    /// Non-blocking liveness probe.
    fn is_alive(&self) -> bool;

    /// Wait up to `grace` for the process to exit by itself (its stdin has
    /// already been closed), then kill it.
    fn shutdown(&self, grace: Duration);

    /// Kill the process immediately and reap it.
    fn kill(&self);

    /// How the process ended, once known.
    fn termination(&self) -> Option<TerminationReason> {
        None
    }
}

/// Write half of a worker's request/response channel.
pub trait RequestWriter: Send {
    fn send(&mut self, request: &WorkRequest) -> Result<()>;
}

/// Read half of a worker's request/response channel.
pub trait ResponseReader: Send {
    /// Next response, or `None` once the worker closed its output.
    fn recv(&mut self) -> Result<Option<WorkResponse>>;
}

/// A freshly started worker process.
pub struct SpawnedProcess {
    pub control: Arc<dyn ProcessControl>,
    pub writer: Box<dyn RequestWriter>,
    pub reader: Box<dyn ResponseReader>,
}
