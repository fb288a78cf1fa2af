//! Per-key worker bookkeeping and admission.
//!
//! All state for one key lives behind a single mutex so the counters that make
//! up the quota move together. Borrowers queue on a ticket line and only the
//! head of the line may take capacity, which gives first-blocked-first-served
//! ordering. Waiting happens on a condvar with a short timeout so a cancelled
//! borrower notices promptly.

use super::cancel::CancelToken;
use super::events::{self, DestroyReason, PoolEvent, PoolEventSink};
use super::key::WorkerKey;
use super::multiplex::Multiplexer;
use super::worker::{Channel, Worker, WorkerId};
use crate::error::{PoolError, Result, report_bug};
use crate::transport::{ProcessControl, WorkerTransport};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a blocked borrower re-checks its cancel token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Collaborators shared by every sub-pool of one pool.
pub(crate) struct PoolContext {
    pub transport: Arc<dyn WorkerTransport>,
    pub events: Arc<dyn PoolEventSink>,
    pub next_id: AtomicU32,
    pub shutdown_grace: Duration,
}

impl PoolContext {
    fn allocate_id(&self) -> WorkerId {
        WorkerId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn emit(&self, event: PoolEvent) {
        events::emit(self.events.as_ref(), event);
    }
}

/// Capacity limits for one key.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    /// Serve the key with shared multiplex processes.
    pub multiplex: bool,
    /// Ceiling on live physical processes.
    pub max_processes: usize,
    /// Concurrent proxies per multiplex process.
    pub proxies_per_process: usize,
}

impl Limits {
    /// Ceiling on handles, borrowed plus idle.
    pub fn max_handles(&self) -> usize {
        if self.multiplex {
            self.max_processes.saturating_mul(self.proxies_per_process)
        } else {
            self.max_processes
        }
    }
}

/// Outcome of a borrow on one sub-pool.
pub(crate) enum Lease {
    Granted(Worker),
    /// The sub-pool was reset or closed; look it up again.
    Retired,
}

struct IdleWorker {
    worker: Worker,
    since: Instant,
}

struct MuxSlot {
    process: Arc<Multiplexer>,
    /// Idle plus borrowed proxies on this process.
    proxies: usize,
}

/// A handle on its way out, torn down after the lock is released.
struct Doomed {
    worker: Worker,
    /// Shared process to shut down because its last proxy is going.
    process: Option<Arc<Multiplexer>>,
    reason: DestroyReason,
    /// Whether a physical process is being destroyed (counted in `tearing_down`).
    owns_process: bool,
}

enum Admitted {
    /// An idle worker, or a new proxy on a running process.
    Granted(Worker, Option<PoolEvent>),
    /// Capacity reserved for a new process.
    Spawn(WorkerId),
}

enum Step {
    Admit(Admitted),
    Discard(Doomed),
    Wait,
}

#[derive(Default)]
struct State {
    retired: bool,
    /// Most recently returned last.
    idle: Vec<IdleWorker>,
    active: HashSet<WorkerId>,
    /// Every live singleplex process, idle or borrowed.
    singleplex: HashMap<WorkerId, Arc<dyn ProcessControl>>,
    /// Live multiplex processes, keyed by the id of the proxy that spawned them.
    multiplex: HashMap<WorkerId, MuxSlot>,
    /// Process each live proxy belongs to.
    proxy_process: HashMap<WorkerId, WorkerId>,
    /// Spawns in flight.
    reserved: usize,
    /// Processes being destroyed outside the lock.
    tearing_down: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    created: u64,
    destroyed: u64,
    evicted: u64,
}

impl State {
    fn process_count(&self) -> usize {
        self.singleplex.len() + self.multiplex.len() + self.reserved + self.tearing_down
    }

    /// Handles that exist or are being spawned.
    fn handle_count(&self) -> usize {
        self.active.len() + self.idle.len() + self.reserved
    }

    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.waiters.push_back(ticket);
        ticket
    }

    fn dequeue(&mut self, ticket: u64) {
        self.waiters.retain(|t| *t != ticket);
    }

    /// Remove a handle from all bookkeeping.
    fn detach(&mut self, worker: Worker, reason: DestroyReason) -> Doomed {
        let id = worker.id();
        self.destroyed += 1;
        let mut process = None;
        let owns_process = if worker.is_multiplex() {
            if let Some(serial) = self.proxy_process.remove(&id)
                && let Some(slot) = self.multiplex.get_mut(&serial)
            {
                slot.proxies = slot.proxies.saturating_sub(1);
                if slot.proxies == 0 {
                    process = self.multiplex.remove(&serial).map(|slot| slot.process);
                }
            }
            process.is_some()
        } else {
            self.singleplex.remove(&id).is_some()
        };
        if owns_process {
            self.tearing_down += 1;
        }
        Doomed {
            worker,
            process,
            reason,
            owns_process,
        }
    }
}

/// Snapshot of one key's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub mnemonic: String,
    pub multiplex: bool,
    pub max_total: usize,
    pub max_processes: usize,
    pub active: usize,
    pub idle: usize,
    pub processes: usize,
    pub waiting: usize,
    pub created: u64,
    pub destroyed: u64,
    pub evicted: u64,
}

/// Bounded set of workers for one [`WorkerKey`].
pub(crate) struct SubPool {
    key: WorkerKey,
    limits: Limits,
    ctx: Arc<PoolContext>,
    state: Mutex<State>,
    changed: Condvar,
}

impl SubPool {
    pub fn new(key: WorkerKey, limits: Limits, ctx: Arc<PoolContext>) -> Arc<Self> {
        Arc::new(Self {
            key,
            limits,
            ctx,
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn num_active(&self) -> usize {
        self.lock().active.len()
    }

    /// Whether a borrow issued right now would be served without blocking.
    pub fn has_available_quota(&self) -> bool {
        let state = self.lock();
        !state.retired
            && state.waiters.is_empty()
            && (!state.idle.is_empty()
                || (state.handle_count() < self.limits.max_handles()
                    && (self.spare_proxy_slot(&state).is_some()
                        || state.process_count() < self.limits.max_processes)))
    }

    pub fn idle_ids(&self) -> Vec<WorkerId> {
        self.lock().idle.iter().map(|e| e.worker.id()).collect()
    }

    pub fn idle_ids_older_than(&self, age: Duration) -> Vec<WorkerId> {
        self.lock()
            .idle
            .iter()
            .filter(|e| e.since.elapsed() >= age)
            .map(|e| e.worker.id())
            .collect()
    }

    pub fn stats(&self) -> KeyStats {
        let state = self.lock();
        KeyStats {
            mnemonic: self.key.mnemonic().to_string(),
            multiplex: self.limits.multiplex,
            max_total: self.limits.max_handles(),
            max_processes: self.limits.max_processes,
            active: state.active.len(),
            idle: state.idle.len(),
            processes: state.singleplex.len() + state.multiplex.len(),
            waiting: state.waiters.len(),
            created: state.created,
            destroyed: state.destroyed,
            evicted: state.evicted,
        }
    }

    /// Live multiplex process with room for another proxy, least loaded first.
    fn spare_proxy_slot(&self, state: &State) -> Option<WorkerId> {
        if !self.limits.multiplex {
            return None;
        }
        state
            .multiplex
            .iter()
            .filter(|(_, slot)| {
                slot.proxies < self.limits.proxies_per_process && slot.process.is_alive()
            })
            .min_by_key(|(_, slot)| slot.proxies)
            .map(|(serial, _)| *serial)
    }

    /// Try to take capacity for the head of the line.
    fn admit(&self, state: &mut State) -> Step {
        if let Some(entry) = state.idle.pop() {
            if entry.worker.is_alive() {
                state.active.insert(entry.worker.id());
                return Step::Admit(Admitted::Granted(entry.worker, None));
            }
            debug!(
                worker_id = %entry.worker.id(),
                mnemonic = self.key.mnemonic(),
                "Idle worker failed validation, discarding"
            );
            return Step::Discard(state.detach(entry.worker, DestroyReason::Dead));
        }

        // Proxies of a dead multiplex process stay borrowed until their holders
        // give them up, and still count against the handle ceiling.
        if state.handle_count() >= self.limits.max_handles() {
            return Step::Wait;
        }

        if let Some(serial) = self.spare_proxy_slot(state)
            && let Some(slot) = state.multiplex.get_mut(&serial)
        {
            slot.proxies += 1;
            let process = slot.process.clone();
            let id = self.ctx.allocate_id();
            state.proxy_process.insert(id, serial);
            state.active.insert(id);
            state.created += 1;
            let event = PoolEvent::WorkerCreated {
                id,
                mnemonic: self.key.mnemonic().to_string(),
                pid: process.pid(),
                multiplex: true,
            };
            let proxy = Worker::proxy(id, self.key.clone(), process);
            return Step::Admit(Admitted::Granted(proxy, Some(event)));
        }

        if state.process_count() < self.limits.max_processes {
            state.reserved += 1;
            return Step::Admit(Admitted::Spawn(self.ctx.allocate_id()));
        }

        Step::Wait
    }

    /// Borrow a worker, blocking until capacity frees up.
    pub fn borrow(self: &Arc<Self>, cancel: &CancelToken) -> Result<Lease> {
        let mut state = self.lock();
        let ticket = state.enqueue();
        let mut announced = false;

        let admitted = loop {
            if state.retired {
                state.dequeue(ticket);
                return Ok(Lease::Retired);
            }
            if cancel.is_cancelled() {
                state.dequeue(ticket);
                drop(state);
                self.changed.notify_all();
                debug!(mnemonic = self.key.mnemonic(), "Borrow cancelled while waiting");
                return Err(PoolError::Interrupted);
            }

            let step = if state.waiters.front() == Some(&ticket) {
                self.admit(&mut state)
            } else {
                Step::Wait
            };

            match step {
                Step::Discard(doomed) => {
                    drop(state);
                    self.teardown(vec![doomed]);
                    state = self.lock();
                }
                Step::Wait if !announced => {
                    announced = true;
                    drop(state);
                    self.ctx.emit(PoolEvent::QuotaExhausted {
                        mnemonic: self.key.mnemonic().to_string(),
                        max_total: self.limits.max_handles(),
                    });
                    state = self.lock();
                }
                Step::Wait => {
                    state = self
                        .changed
                        .wait_timeout(state, CANCEL_POLL_INTERVAL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                Step::Admit(admitted) => {
                    state.dequeue(ticket);
                    break admitted;
                }
            }
        };
        drop(state);
        // The next in line may be admissible too
        self.changed.notify_all();

        match admitted {
            Admitted::Granted(worker, event) => {
                if let Some(event) = event {
                    self.ctx.emit(event);
                }
                Ok(Lease::Granted(self.lease(worker)))
            }
            Admitted::Spawn(id) => self.create(id),
        }
    }

    fn lease(self: &Arc<Self>, mut worker: Worker) -> Worker {
        worker.lease_to(Arc::clone(self));
        worker
    }

    /// Release a reservation after a failed spawn.
    fn unreserve(&self) {
        self.lock().reserved -= 1;
        self.changed.notify_all();
    }

    /// Start a new physical process for a reserved slot.
    fn create(self: &Arc<Self>, id: WorkerId) -> Result<Lease> {
        let spawned = match self.ctx.transport.spawn(&self.key, id) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.unreserve();
                warn!(mnemonic = self.key.mnemonic(), error = %e, "Failed to start worker");
                return Err(e);
            }
        };
        let control = spawned.control.clone();
        let pid = control.pid();

        let worker = if self.limits.multiplex {
            let this = Arc::downgrade(self);
            let label = format!("{}-{}", self.key.mnemonic(), id);
            let started = Multiplexer::start(spawned, label, move || {
                if let Some(sub_pool) = this.upgrade() {
                    sub_pool.on_process_exit(id);
                }
            });
            let process = match started {
                Ok(process) => process,
                Err(e) => {
                    control.kill();
                    self.unreserve();
                    return Err(PoolError::spawn(self.key.mnemonic(), e));
                }
            };

            let mut state = self.lock();
            state.reserved -= 1;
            if state.retired {
                drop(state);
                process.kill();
                return Ok(Lease::Retired);
            }
            state.multiplex.insert(
                id,
                MuxSlot {
                    process: process.clone(),
                    proxies: 1,
                },
            );
            state.proxy_process.insert(id, id);
            state.active.insert(id);
            state.created += 1;
            Worker::proxy(id, self.key.clone(), process)
        } else {
            let mut state = self.lock();
            state.reserved -= 1;
            if state.retired {
                drop(state);
                control.kill();
                return Ok(Lease::Retired);
            }
            state.singleplex.insert(id, control);
            state.active.insert(id);
            state.created += 1;
            Worker::singleplex(id, self.key.clone(), spawned)
        };
        // Waiters behind us may now fit on the new multiplex process
        self.changed.notify_all();

        self.ctx.emit(PoolEvent::WorkerCreated {
            id,
            mnemonic: self.key.mnemonic().to_string(),
            pid,
            multiplex: self.limits.multiplex,
        });
        Ok(Lease::Granted(self.lease(worker)))
    }

    /// Put a borrowed worker back on the idle list.
    pub fn give_back(&self, mut worker: Worker) {
        worker.clear_lease();
        let id = worker.id();
        let mut state = self.lock();

        if state.retired {
            drop(state);
            self.destroy_untracked(worker, DestroyReason::Stale);
            return;
        }
        if !state.active.remove(&id) {
            drop(state);
            report_bug!(
                worker_id = %id,
                mnemonic = self.key.mnemonic(),
                "Returned worker is not active in its pool, destroying it"
            );
            self.destroy_untracked(worker, DestroyReason::Invalidated);
            return;
        }
        if worker.is_multiplex()
            && !state
                .proxy_process
                .get(&id)
                .is_some_and(|serial| state.multiplex.contains_key(serial))
        {
            // Its process died while it was out
            state.proxy_process.remove(&id);
            state.destroyed += 1;
            drop(state);
            self.changed.notify_all();
            self.destroy_untracked(worker, DestroyReason::Dead);
            return;
        }

        state.idle.push(IdleWorker {
            worker,
            since: Instant::now(),
        });
        drop(state);
        self.changed.notify_all();
    }

    /// Destroy a borrowed worker.
    pub fn invalidate(&self, mut worker: Worker, reason: DestroyReason) {
        worker.clear_lease();
        let mut state = self.lock();
        if state.retired {
            drop(state);
            self.destroy_untracked(worker, DestroyReason::Stale);
            return;
        }
        if !state.active.remove(&worker.id()) {
            report_bug!(
                worker_id = %worker.id(),
                mnemonic = self.key.mnemonic(),
                "Invalidated worker is not active in its pool"
            );
        }
        let doomed = state.detach(worker, reason);
        drop(state);
        self.teardown(vec![doomed]);
    }

    /// Destroy the idle workers among `ids`; anything borrowed is left alone.
    pub fn evict(&self, ids: &HashSet<WorkerId>) -> Vec<WorkerId> {
        let mut state = self.lock();
        if state.retired {
            return Vec::new();
        }
        let (chosen, kept): (Vec<IdleWorker>, Vec<IdleWorker>) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition(|e| ids.contains(&e.worker.id()));
        state.idle = kept;
        if chosen.is_empty() {
            return Vec::new();
        }

        state.evicted += chosen.len() as u64;
        let doomed: Vec<Doomed> = chosen
            .into_iter()
            .map(|e| state.detach(e.worker, DestroyReason::Evicted))
            .collect();
        drop(state);

        let evicted = doomed.iter().map(|d| d.worker.id()).collect();
        self.teardown(doomed);
        evicted
    }

    /// Tear down detached handles and release their quota.
    fn teardown(&self, doomed: Vec<Doomed>) {
        let mut processes = 0;
        for Doomed {
            worker,
            process,
            reason,
            owns_process,
        } in doomed
        {
            let id = worker.id();
            worker.destroy(self.ctx.shutdown_grace);
            if let Some(process) = process {
                process.shutdown(self.ctx.shutdown_grace);
            }
            if owns_process {
                processes += 1;
            }

            let mnemonic = self.key.mnemonic().to_string();
            self.ctx.emit(match reason {
                DestroyReason::Evicted => PoolEvent::WorkerEvicted { id, mnemonic },
                reason => PoolEvent::WorkerDestroyed {
                    id,
                    mnemonic,
                    reason,
                },
            });
        }

        if processes > 0 {
            self.lock().tearing_down -= processes;
        }
        self.changed.notify_all();
    }

    /// Destroy a worker the bookkeeping no longer knows about.
    fn destroy_untracked(&self, mut worker: Worker, reason: DestroyReason) {
        let id = worker.id();
        match worker.take_channel() {
            Some(Channel::Singleplex {
                control, writer, ..
            }) => {
                drop(writer);
                control.shutdown(self.ctx.shutdown_grace);
            }
            Some(Channel::Proxy { .. }) | None => {}
        }
        self.ctx.emit(PoolEvent::WorkerDestroyed {
            id,
            mnemonic: self.key.mnemonic().to_string(),
            reason,
        });
    }

    /// Called from a multiplex reader thread when its process is gone.
    fn on_process_exit(&self, serial: WorkerId) {
        let mut state = self.lock();
        let Some(slot) = state.multiplex.remove(&serial) else {
            // Deliberately shut down, or already reset
            return;
        };
        let (orphans, kept): (Vec<IdleWorker>, Vec<IdleWorker>) = std::mem::take(&mut state.idle)
            .into_iter()
            .partition(|e| state.proxy_process.get(&e.worker.id()) == Some(&serial));
        state.idle = kept;
        for orphan in &orphans {
            state.proxy_process.remove(&orphan.worker.id());
        }
        state.destroyed += orphans.len() as u64;
        drop(state);
        self.changed.notify_all();

        warn!(
            mnemonic = self.key.mnemonic(),
            pid = slot.process.pid(),
            idle_proxies = orphans.len(),
            "Multiplex worker process exited, removing it from the pool"
        );
        slot.process.kill_detached();
        for orphan in orphans {
            self.destroy_untracked(orphan.worker, DestroyReason::Dead);
        }
    }

    /// Destroy every process and refuse further borrows.
    ///
    /// Borrowed singleplex processes are killed too; their holders see a
    /// transport error on the next request.
    pub fn retire(&self) {
        let (idle, controls, processes) = {
            let mut state = self.lock();
            state.retired = true;
            let idle = std::mem::take(&mut state.idle);
            let controls: Vec<_> = state.singleplex.drain().map(|(_, c)| c).collect();
            let processes: Vec<_> = state.multiplex.drain().map(|(_, s)| s.process).collect();
            state.proxy_process.clear();
            self.changed.notify_all();
            while state.tearing_down > 0 {
                state = self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            (idle, controls, processes)
        };

        let destroyed = idle.len() + controls.len() + processes.len();
        for control in &controls {
            control.kill();
        }
        for entry in idle {
            self.destroy_untracked(entry.worker, DestroyReason::Reset);
        }
        for process in processes {
            process.kill();
        }
        if destroyed > 0 {
            info!(
                mnemonic = self.key.mnemonic(),
                processes = controls.len(),
                multiplex_processes = destroyed - controls.len(),
                "Worker sub-pool torn down"
            );
        }
    }
}
