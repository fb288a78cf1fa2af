//! Lifecycle notifications for metrics collection.

use super::WorkerId;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{debug, info, warn};

/// Why a worker handle was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// The borrower invalidated it.
    Invalidated,
    /// Found dead when about to be reused.
    Dead,
    /// Torn down by `reset` or `close`.
    Reset,
    /// Returned to a sub-pool that was reset since it was borrowed.
    Stale,
    /// The borrower dropped it without returning it.
    Dropped,
    /// Idle and chosen by `evict_workers`.
    Evicted,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Invalidated => "invalidated",
            Self::Dead => "dead",
            Self::Reset => "reset",
            Self::Stale => "stale",
            Self::Dropped => "dropped",
            Self::Evicted => "evicted",
        };
        f.write_str(s)
    }
}

/// Something the pool did that a metrics collector may care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    WorkerCreated {
        id: WorkerId,
        mnemonic: String,
        pid: u32,
        multiplex: bool,
    },
    WorkerDestroyed {
        id: WorkerId,
        mnemonic: String,
        reason: DestroyReason,
    },
    WorkerEvicted {
        id: WorkerId,
        mnemonic: String,
    },
    /// A borrower started waiting because the key had no capacity left.
    QuotaExhausted { mnemonic: String, max_total: usize },
}

/// Receiver of [`PoolEvent`]s.
///
/// Called without any pool lock held. Implementations must not block for long;
/// a panicking sink is logged and otherwise ignored.
pub trait PoolEventSink: Send + Sync {
    fn notify(&self, event: &PoolEvent);
}

/// Default sink: turns events into log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl PoolEventSink for TracingEventSink {
    fn notify(&self, event: &PoolEvent) {
        match event {
            PoolEvent::WorkerCreated {
                id,
                mnemonic,
                pid,
                multiplex,
            } => debug!(worker_id = %id, mnemonic, pid, multiplex, "Worker created"),
            PoolEvent::WorkerDestroyed {
                id,
                mnemonic,
                reason,
            } => debug!(worker_id = %id, mnemonic, reason = %reason, "Worker destroyed"),
            PoolEvent::WorkerEvicted { id, mnemonic } => {
                info!(worker_id = %id, mnemonic, "Worker evicted")
            }
            PoolEvent::QuotaExhausted {
                mnemonic,
                max_total,
            } => debug!(mnemonic, max_total, "Worker quota exhausted, waiting"),
        }
    }
}

pub(crate) fn emit(sink: &dyn PoolEventSink, event: PoolEvent) {
    if catch_unwind(AssertUnwindSafe(|| sink.notify(&event))).is_err() {
        warn!(?event, "Pool event sink panicked");
    }
}
