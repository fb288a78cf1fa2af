//! Borrowable worker handles.

use super::events::DestroyReason;
use super::key::WorkerKey;
use super::multiplex::Multiplexer;
use super::sub_pool::SubPool;
use crate::error::{PoolError, Result};
use crate::transport::{
    ProcessControl, RequestWriter, ResponseReader, SINGLEPLEX_REQUEST_ID, SpawnedProcess,
    WorkRequest, WorkResponse,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Identity of a worker handle, unique for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(u32);

impl WorkerId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkOutput {
    pub exit_code: i32,
    pub output: String,
}

impl WorkOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

pub(crate) enum Channel {
    /// Exclusive process: one request at a time over its own pipes.
    Singleplex {
        control: Arc<dyn ProcessControl>,
        writer: Box<dyn RequestWriter>,
        reader: Box<dyn ResponseReader>,
    },
    /// Logical lease on a shared multiplex process.
    Proxy { process: Arc<Multiplexer> },
}

/// A leased worker.
///
/// While borrowed the caller owns it exclusively; hand it back with
/// [`WorkerPool::return_worker`](super::WorkerPool::return_worker) or
/// [`WorkerPool::invalidate_worker`](super::WorkerPool::invalidate_worker).
/// Dropping a borrowed worker invalidates it.
pub struct Worker {
    id: WorkerId,
    key: WorkerKey,
    channel: Option<Channel>,
    /// Set while borrowed; the sub-pool to give the worker back to.
    lease: Option<Arc<SubPool>>,
    requests: u64,
    broken: bool,
}

impl Worker {
    pub(crate) fn singleplex(id: WorkerId, key: WorkerKey, spawned: SpawnedProcess) -> Self {
        let SpawnedProcess {
            control,
            writer,
            reader,
        } = spawned;
        Self::with_channel(
            id,
            key,
            Channel::Singleplex {
                control,
                writer,
                reader,
            },
        )
    }

    pub(crate) fn proxy(id: WorkerId, key: WorkerKey, process: Arc<Multiplexer>) -> Self {
        Self::with_channel(id, key, Channel::Proxy { process })
    }

    fn with_channel(id: WorkerId, key: WorkerKey, channel: Channel) -> Self {
        Self {
            id,
            key,
            channel: Some(channel),
            lease: None,
            requests: 0,
            broken: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn is_multiplex(&self) -> bool {
        matches!(self.channel, Some(Channel::Proxy { .. }))
    }

    /// Pid of the physical process behind this handle.
    pub fn pid(&self) -> Option<u32> {
        match self.channel.as_ref()? {
            Channel::Singleplex { control, .. } => Some(control.pid()),
            Channel::Proxy { process } => Some(process.pid()),
        }
    }

    /// Number of requests this handle has completed.
    pub fn requests_served(&self) -> u64 {
        self.requests
    }

    /// Liveness probe used before an idle worker is reused.
    pub fn is_alive(&self) -> bool {
        if self.broken {
            return false;
        }
        match &self.channel {
            Some(Channel::Singleplex { control, .. }) => control.is_alive(),
            Some(Channel::Proxy { process }) => process.is_alive(),
            None => false,
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A fatal error (see [`PoolError::is_fatal`]) marks the worker broken; it
    /// will be discarded instead of reused.
    pub fn do_work(&mut self, arguments: Vec<String>) -> Result<WorkOutput> {
        let result = self.exchange(arguments);
        match &result {
            Ok(_) => self.requests += 1,
            Err(e) if e.is_fatal() => self.broken = true,
            Err(_) => {}
        }
        result
    }

    fn exchange(&mut self, arguments: Vec<String>) -> Result<WorkOutput> {
        let response = match self.channel.as_mut() {
            Some(Channel::Singleplex {
                control,
                writer,
                reader,
            }) => {
                writer.send(&WorkRequest::work(SINGLEPLEX_REQUEST_ID, arguments))?;
                match reader.recv()? {
                    Some(response) if response.request_id() == SINGLEPLEX_REQUEST_ID => response,
                    Some(response) => {
                        return Err(PoolError::Protocol(format!(
                            "singleplex worker answered request {}",
                            response.request_id()
                        )));
                    }
                    None => {
                        let reason = control
                            .termination()
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "closed its output".into());
                        return Err(PoolError::Transport(format!(
                            "worker process {} {reason}",
                            control.pid()
                        )));
                    }
                }
            }
            Some(Channel::Proxy { process }) => process.submit(arguments)?.wait()?,
            None => return Err(PoolError::Transport("worker already destroyed".into())),
        };

        trace!(worker_id = %self.id, mnemonic = self.key.mnemonic(), "Work response received");
        match response {
            WorkResponse::Result {
                exit_code, output, ..
            } => Ok(WorkOutput { exit_code, output }),
            WorkResponse::Error { message, .. } => Err(PoolError::Rejected(message)),
        }
    }

    pub(crate) fn lease_to(&mut self, home: Arc<SubPool>) {
        self.lease = Some(home);
    }

    /// Sub-pool this worker is leased from, clearing the lease.
    pub(crate) fn take_lease(&mut self) -> Option<Arc<SubPool>> {
        self.lease.take()
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease = None;
    }

    pub(crate) fn take_channel(&mut self) -> Option<Channel> {
        self.lease = None;
        self.channel.take()
    }

    /// Tear down a singleplex worker's process. Proxies own nothing here; the
    /// sub-pool decides when their shared process goes.
    pub(crate) fn destroy(mut self, grace: Duration) {
        if let Some(Channel::Singleplex {
            control, writer, ..
        }) = self.take_channel()
        {
            drop(writer);
            control.shutdown(grace);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("mnemonic", &self.key.mnemonic())
            .field("multiplex", &self.is_multiplex())
            .field("pid", &self.pid())
            .field("requests", &self.requests)
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let Some(home) = self.take_lease() else {
            return;
        };
        let orphan = Worker {
            id: self.id,
            key: self.key.clone(),
            channel: self.channel.take(),
            lease: None,
            requests: self.requests,
            broken: true,
        };
        home.invalidate(orphan, DestroyReason::Dropped);
    }
}
