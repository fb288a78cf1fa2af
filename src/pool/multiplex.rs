//! Sharing one worker process between many concurrent requests.
//!
//! ```text
//!   proxy A ─┐  submit(id=1)                       ┌─> waiter 1
//!   proxy B ─┼─> [writer lock] ─> worker stdin     │
//!   proxy C ─┘  submit(id=2)                       ├─> waiter 2
//!                        worker stdout ─> reader ──┘   (routed by request_id)
//! ```
//!
//! Writes are serialized by a mutex shared by all proxies. A single reader
//! thread owns the worker's stdout and routes each response to the channel of
//! the request with the same id. When the stream ends every outstanding request
//! is failed, so no proxy waits forever on a dead process.

use crate::error::{PoolError, Result, report_bug};
use crate::transport::{
    ProcessControl, RequestWriter, ResponseReader, SpawnedProcess, WorkRequest, WorkResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

type Waiter = Sender<Result<WorkResponse>>;

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u32, Waiter>,
    /// Set once the reader has stopped; no new requests are accepted.
    failure: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One physical multiplex worker process.
pub(crate) struct Multiplexer {
    label: String,
    control: Arc<dyn ProcessControl>,
    /// `None` once the process is being torn down; dropping it closes stdin.
    writer: Mutex<Option<Box<dyn RequestWriter>>>,
    pending: Arc<Mutex<PendingTable>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_request_id: AtomicU32,
}

/// A request in flight on a [`Multiplexer`].
pub(crate) struct PendingResponse {
    request_id: u32,
    rx: Receiver<Result<WorkResponse>>,
}

impl PendingResponse {
    /// Block until the worker answers or the process goes away.
    pub fn wait(self) -> Result<WorkResponse> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(PoolError::Transport(format!(
                "worker went away before answering request {}",
                self.request_id
            )))
        })
    }
}

impl Multiplexer {
    /// Take ownership of a spawned process and start its reader thread.
    ///
    /// `on_exit` runs on the reader thread after all outstanding requests have
    /// been failed.
    pub fn start(
        spawned: SpawnedProcess,
        label: String,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Result<Arc<Self>> {
        let SpawnedProcess {
            control,
            writer,
            reader,
        } = spawned;
        let pending = Arc::new(Mutex::new(PendingTable::default()));

        let reader_pending = pending.clone();
        let reader_label = label.clone();
        let handle = thread::Builder::new()
            .name(format!("wpool-mux-{label}"))
            .spawn(move || {
                demultiplex(reader, &reader_pending, &reader_label);
                on_exit();
            })?;

        Ok(Arc::new(Self {
            label,
            control,
            writer: Mutex::new(Some(writer)),
            pending,
            reader: Mutex::new(Some(handle)),
            next_request_id: AtomicU32::new(1),
        }))
    }

    pub fn pid(&self) -> u32 {
        self.control.pid()
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.pending).failure.is_none() && self.control.is_alive()
    }

    /// Send one request and return a handle to wait for its response.
    pub fn submit(&self, arguments: Vec<String>) -> Result<PendingResponse> {
        let (tx, rx) = mpsc::channel();
        let request_id = {
            let mut table = lock(&self.pending);
            if let Some(failure) = &table.failure {
                return Err(PoolError::Transport(failure.clone()));
            }
            let id = self.allocate_id(&table);
            table.waiters.insert(id, tx);
            id
        };

        let sent = match lock(&self.writer).as_mut() {
            Some(writer) => writer.send(&WorkRequest::work(request_id, arguments)),
            None => Err(PoolError::Transport("worker is shutting down".into())),
        };
        if let Err(e) = sent {
            lock(&self.pending).waiters.remove(&request_id);
            return Err(e);
        }

        trace!(worker = %self.label, request_id, "Multiplexed request sent");
        Ok(PendingResponse { request_id, rx })
    }

    /// Next id that is non-zero and not in flight.
    fn allocate_id(&self, table: &PendingTable) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !table.waiters.contains_key(&id) {
                return id;
            }
        }
    }

    /// Close stdin, give the process `grace` to exit, then kill it and wait
    /// for the reader to drain.
    pub fn shutdown(&self, grace: Duration) {
        lock(&self.writer).take();
        self.control.shutdown(grace);
        self.join_reader();
    }

    /// Kill the process immediately and wait for the reader to drain.
    pub fn kill(&self) {
        lock(&self.writer).take();
        self.control.kill();
        self.join_reader();
    }

    /// Kill without joining; used from the reader thread itself.
    pub fn kill_detached(&self) {
        lock(&self.writer).take();
        self.control.kill();
    }

    fn join_reader(&self) {
        let Some(handle) = lock(&self.reader).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!(worker = %self.label, "Multiplex reader thread panicked");
        }
    }
}

fn demultiplex(mut reader: Box<dyn ResponseReader>, pending: &Mutex<PendingTable>, label: &str) {
    let failure = loop {
        match reader.recv() {
            Ok(Some(response)) => {
                let request_id = response.request_id();
                let waiter = lock(pending).waiters.remove(&request_id);
                match waiter {
                    Some(tx) => {
                        // The requester may have given up; nothing to do then
                        let _ = tx.send(Ok(response));
                    }
                    None => report_bug!(
                        worker = %label,
                        request_id,
                        "Response for a request that is not outstanding, dropping it"
                    ),
                }
            }
            Ok(None) => break "worker process exited".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    let orphans: Vec<Waiter> = {
        let mut table = lock(pending);
        table.failure = Some(failure.clone());
        table.waiters.drain().map(|(_, tx)| tx).collect()
    };
    if orphans.is_empty() {
        debug!(worker = %label, reason = %failure, "Multiplex reader stopped");
    } else {
        warn!(
            worker = %label,
            reason = %failure,
            outstanding = orphans.len(),
            "Multiplex worker lost with requests in flight"
        );
    }
    for tx in orphans {
        let _ = tx.send(Err(PoolError::Transport(failure.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{WorkerId, WorkerKey};
    use crate::transport::WorkerTransport;
    use crate::transport::testing::FakeTransport;
    use std::sync::atomic::AtomicBool;

    fn start(transport: &FakeTransport) -> (Arc<Multiplexer>, Arc<AtomicBool>) {
        let key = WorkerKey::builder("Mux", "fake").multiplex(true).build();
        let spawned = transport.spawn(&key, WorkerId::new(1)).unwrap();
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let mux = Multiplexer::start(spawned, "Mux-1".into(), move || {
            flag.store(true, Ordering::SeqCst)
        })
        .unwrap();
        (mux, exited)
    }

    #[test]
    fn test_out_of_order_responses_reach_their_callers() {
        let transport = FakeTransport::new();
        let (mux, _) = start(&transport);

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let mux = mux.clone();
                thread::spawn(move || {
                    // Earlier requests sleep longer so answers come back reversed
                    let args = vec![format!("req-{i}"), format!("sleep={}", (5 - i) * 40)];
                    let response = mux.submit(args.clone()).unwrap().wait().unwrap();
                    (args.join(" "), response)
                })
            })
            .collect();

        for handle in handles {
            let (expected, response) = handle.join().unwrap();
            match response {
                WorkResponse::Result { output, .. } => assert_eq!(output, expected),
                other => panic!("unexpected response {other:?}"),
            }
        }
        mux.kill();
    }

    #[test]
    fn test_process_death_fails_every_pending_request() {
        let transport = FakeTransport::new();
        let (mux, exited) = start(&transport);

        let a = mux.submit(vec!["sleep=300".into()]).unwrap();
        let b = mux.submit(vec!["sleep=300".into()]).unwrap();
        transport.process(0).crash();

        assert!(matches!(a.wait(), Err(PoolError::Transport(_))));
        assert!(matches!(b.wait(), Err(PoolError::Transport(_))));

        mux.join_reader();
        assert!(exited.load(Ordering::SeqCst));
        assert!(!mux.is_alive());
        assert!(matches!(
            mux.submit(vec!["late".into()]),
            Err(PoolError::Transport(_))
        ));
    }

    #[test]
    fn test_request_ids_are_unique_while_outstanding() {
        let transport = FakeTransport::new();
        let (mux, _) = start(&transport);

        let pending: Vec<_> = (0..10)
            .map(|_| mux.submit(vec!["sleep=100".into()]).unwrap())
            .collect();
        let mut ids: Vec<u32> = pending.iter().map(|p| p.request_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert!(!ids.contains(&0));

        for p in pending {
            p.wait().unwrap();
        }
        mux.kill();
    }

    #[test]
    fn test_allocation_skips_ids_in_flight() {
        let transport = FakeTransport::new();
        let (mux, _) = start(&transport);

        let first = mux.submit(vec!["sleep=300".into()]).unwrap();
        assert_eq!(first.request_id, 1);
        // Force the counter to wrap back onto the outstanding id
        mux.next_request_id.store(u32::MAX, Ordering::Relaxed);
        let second = mux.submit(vec!["x".into()]).unwrap();
        assert_eq!(second.request_id, u32::MAX);
        let third = mux.submit(vec!["y".into()]).unwrap();
        assert_eq!(third.request_id, 2);

        first.wait().unwrap();
        second.wait().unwrap();
        third.wait().unwrap();
        mux.kill();
    }
}
