//! Pool of persistent worker processes.
//!
//! Workers are partitioned by [`WorkerKey`]. Each key gets a sub-pool, created
//! on first borrow, that enforces the key's process quota and keeps returned
//! workers around for reuse:
//!
//! ```text
//!   WorkerPool
//!   └── RwLock<HashMap<WorkerKey, Arc<SubPool>>>
//!         ├── Javac  (singleplex)  idle: [w3, w1]   active: {w2}
//!         └── Scalac (multiplex)   process 4 ── proxies w4, w5, w6
//! ```
//!
//! Only [`WorkerPool::borrow_worker`] blocks. Sub-pools never share a lock, so
//! traffic on one key does not slow another.

mod cancel;
mod events;
mod key;
mod multiplex;
mod sub_pool;
mod worker;

pub use cancel::CancelToken;
pub use events::{DestroyReason, PoolEvent, PoolEventSink, TracingEventSink};
pub use key::{WorkerKey, WorkerKeyBuilder};
pub use sub_pool::KeyStats;
pub use worker::{WorkOutput, Worker, WorkerId};

use crate::config::WorkerPoolConfig;
use crate::error::{PoolError, Result, report_bug};
use crate::transport::WorkerTransport;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use sub_pool::{Lease, Limits, PoolContext, SubPool};
use tracing::{debug, info, instrument};

/// Registry of per-key sub-pools.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    ctx: Arc<PoolContext>,
    sub_pools: RwLock<HashMap<WorkerKey, Arc<SubPool>>>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool that logs lifecycle events through `tracing`.
    pub fn new(config: WorkerPoolConfig, transport: Arc<dyn WorkerTransport>) -> Result<Self> {
        Self::with_event_sink(config, transport, Arc::new(TracingEventSink))
    }

    pub fn with_event_sink(
        config: WorkerPoolConfig,
        transport: Arc<dyn WorkerTransport>,
        events: Arc<dyn PoolEventSink>,
    ) -> Result<Self> {
        config.validate()?;
        debug!(
            max_instances = config.max_instances.default,
            max_multiplex_processes = config.max_multiplex_processes.default,
            max_multiplex_instances = config.max_multiplex_instances.default,
            "Initializing worker pool"
        );
        let ctx = Arc::new(PoolContext {
            transport,
            events,
            next_id: AtomicU32::new(1),
            shutdown_grace: config.shutdown_grace(),
        });
        Ok(Self {
            config,
            ctx,
            sub_pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    fn existing(&self, key: &WorkerKey) -> Option<Arc<SubPool>> {
        self.sub_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn all(&self) -> Vec<Arc<SubPool>> {
        self.sub_pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Sub-pool for `key`, created on first use.
    fn sub_pool(&self, key: &WorkerKey) -> Result<Arc<SubPool>> {
        if let Some(sub_pool) = self.existing(key) {
            return Ok(sub_pool);
        }
        let mut sub_pools = self
            .sub_pools
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Checked under the write lock so close() cannot miss a new sub-pool
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        let sub_pool = sub_pools.entry(key.clone()).or_insert_with(|| {
            let limits = Limits {
                multiplex: self.config.uses_multiplex(key),
                max_processes: self.config.max_processes_per_key(key),
                proxies_per_process: self.config.instances_per_process(key),
            };
            debug!(key = %key, max_processes = limits.max_processes, "Creating sub-pool");
            SubPool::new(key.clone(), limits, self.ctx.clone())
        });
        Ok(sub_pool.clone())
    }

    /// Configured ceiling on handles for `key`; proxies count for multiplex keys.
    pub fn max_total_per_key(&self, key: &WorkerKey) -> usize {
        self.config.max_total_per_key(key)
    }

    /// Handles currently borrowed under `key`.
    pub fn num_active(&self, key: &WorkerKey) -> usize {
        self.existing(key).map_or(0, |sub_pool| sub_pool.num_active())
    }

    /// Whether a borrow for `key` issued now would return without blocking.
    pub fn has_available_quota(&self, key: &WorkerKey) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match self.existing(key) {
            Some(sub_pool) => sub_pool.has_available_quota(),
            None => self.max_total_per_key(key) > 0,
        }
    }

    /// Borrow a worker for `key`, blocking while the key is at quota.
    pub fn borrow_worker(&self, key: &WorkerKey) -> Result<Worker> {
        self.borrow_worker_cancellable(key, &CancelToken::new())
    }

    /// Like [`borrow_worker`](Self::borrow_worker), but gives up with
    /// [`PoolError::Interrupted`] once `cancel` fires.
    #[instrument(level = "debug", skip(self, cancel), fields(mnemonic = key.mnemonic()))]
    pub fn borrow_worker_cancellable(&self, key: &WorkerKey, cancel: &CancelToken) -> Result<Worker> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PoolError::Closed);
            }
            match self.sub_pool(key)?.borrow(cancel)? {
                Lease::Granted(worker) => return Ok(worker),
                // Reset under us; the next lookup creates a fresh sub-pool
                Lease::Retired => continue,
            }
        }
    }

    /// Hand a borrowed worker back for reuse.
    pub fn return_worker(&self, key: &WorkerKey, mut worker: Worker) {
        if worker.key() != key {
            report_bug!(
                worker_id = %worker.id(),
                expected = %key,
                actual = %worker.key(),
                "Worker returned under a different key, using its own"
            );
        }
        match worker.take_lease() {
            Some(home) => home.give_back(worker),
            None => {
                report_bug!(worker_id = %worker.id(), "Returned worker is not on lease, destroying it");
                worker.destroy(self.ctx.shutdown_grace);
            }
        }
    }

    /// Destroy a borrowed worker. For a multiplex proxy the shared process
    /// goes only with its last proxy.
    pub fn invalidate_worker(&self, mut worker: Worker) {
        match worker.take_lease() {
            Some(home) => home.invalidate(worker, DestroyReason::Invalidated),
            None => worker.destroy(self.ctx.shutdown_grace),
        }
    }

    /// Destroy the idle workers among `ids`. Workers borrowed in the meantime
    /// are skipped; the result lists what was actually evicted.
    #[instrument(level = "debug", skip_all, fields(requested = ids.len()))]
    pub fn evict_workers(&self, ids: &HashSet<WorkerId>) -> HashSet<WorkerId> {
        let mut evicted = HashSet::new();
        if ids.is_empty() {
            return evicted;
        }
        for sub_pool in self.all() {
            evicted.extend(sub_pool.evict(ids));
        }
        if !evicted.is_empty() {
            info!(requested = ids.len(), evicted = evicted.len(), "Evicted idle workers");
        }
        evicted
    }

    /// Snapshot of idle worker ids across all keys.
    pub fn idle_workers(&self) -> HashSet<WorkerId> {
        self.all()
            .iter()
            .flat_map(|sub_pool| sub_pool.idle_ids())
            .collect()
    }

    /// Idle workers unused for at least `age`, for idle-timeout eviction.
    pub fn idle_workers_older_than(&self, age: Duration) -> HashSet<WorkerId> {
        self.all()
            .iter()
            .flat_map(|sub_pool| sub_pool.idle_ids_older_than(age))
            .collect()
    }

    /// Per-key bookkeeping snapshot, sorted by mnemonic.
    pub fn stats(&self) -> Vec<KeyStats> {
        let mut stats: Vec<KeyStats> = self.all().iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.mnemonic.cmp(&b.mnemonic));
        stats
    }

    /// Destroy every process. The pool stays usable; the next borrow for a key
    /// starts a fresh process.
    #[instrument(level = "debug", skip(self))]
    pub fn reset(&self) {
        let retired: Vec<Arc<SubPool>> = self
            .sub_pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, sub_pool)| sub_pool)
            .collect();
        for sub_pool in &retired {
            sub_pool.retire();
        }
        if !retired.is_empty() {
            info!(sub_pools = retired.len(), "Worker pool reset");
        }
    }

    /// Destroy every process and refuse all further borrows.
    pub fn close(&self) {
        {
            let _guard = self
                .sub_pools
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.reset();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
