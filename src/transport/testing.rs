//! In-memory transport for pool tests.
//!
//! Each fake process is a thread that echoes its arguments back. Every request
//! is answered from its own thread, so `sleep=<ms>` arguments make responses
//! arrive out of order. A `crash` argument kills the process without replying.

use super::protocol::{WorkRequest, WorkResponse};
use super::{ProcessControl, RequestWriter, ResponseReader, SpawnedProcess, WorkerTransport};
use crate::error::{PoolError, Result};
use crate::pool::{WorkerId, WorkerKey};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

enum Inbound {
    Request(WorkRequest),
    Kill,
}

pub(crate) struct FakeProcess {
    pid: u32,
    alive: Arc<AtomicBool>,
    inbox: Sender<Inbound>,
    killed: AtomicBool,
}

impl FakeProcess {
    /// Simulate the process dying on its own.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.inbox.send(Inbound::Kill);
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl ProcessControl for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn shutdown(&self, _grace: Duration) {
        self.kill();
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.crash();
    }
}

struct FakeWriter {
    inbox: Sender<Inbound>,
    alive: Arc<AtomicBool>,
}

impl RequestWriter for FakeWriter {
    fn send(&mut self, request: &WorkRequest) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(PoolError::Transport("broken pipe".into()));
        }
        self.inbox
            .send(Inbound::Request(request.clone()))
            .map_err(|_| PoolError::Transport("broken pipe".into()))
    }
}

struct FakeReader {
    responses: Receiver<WorkResponse>,
}

impl ResponseReader for FakeReader {
    fn recv(&mut self) -> Result<Option<WorkResponse>> {
        Ok(self.responses.recv().ok())
    }
}

fn serve(inbox: Receiver<Inbound>, responses: Sender<WorkResponse>, alive: Arc<AtomicBool>) {
    for message in inbox {
        let (request_id, arguments) = match message {
            Inbound::Request(WorkRequest::Work {
                request_id,
                arguments,
            }) => (request_id, arguments),
            Inbound::Request(WorkRequest::Exit) | Inbound::Kill => break,
        };
        if arguments.iter().any(|a| a == "crash") {
            break;
        }
        let delay = arguments
            .iter()
            .find_map(|a| a.strip_prefix("sleep="))
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis);
        let responses = responses.clone();
        let alive = alive.clone();
        thread::spawn(move || {
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            if alive.load(Ordering::SeqCst) {
                let _ = responses.send(WorkResponse::result(request_id, 0, arguments.join(" ")));
            }
        });
    }
    alive.store(false, Ordering::SeqCst);
}

/// Transport producing [`FakeProcess`]es.
#[derive(Default)]
pub(crate) struct FakeTransport {
    next_pid: AtomicU32,
    failures_pending: AtomicUsize,
    spawn_delay_ms: AtomicU32,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `n` spawns fail.
    pub fn fail_spawns(&self, n: usize) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Make every spawn take `delay` before returning.
    pub fn set_spawn_delay(&self, delay: Duration) {
        self.spawn_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    /// The `index`-th process spawned by this transport.
    pub fn process(&self, index: usize) -> Arc<FakeProcess> {
        self.processes.lock().unwrap()[index].clone()
    }

    pub fn live_count(&self) -> usize {
        self.processes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.is_alive())
            .count()
    }
}

impl WorkerTransport for FakeTransport {
    fn spawn(&self, key: &WorkerKey, _id: WorkerId) -> Result<SpawnedProcess> {
        let delay = self.spawn_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay as u64));
        }
        if self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PoolError::spawn(key.mnemonic(), "injected spawn failure"));
        }

        let (inbox_tx, inbox_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let process = Arc::new(FakeProcess {
            pid: 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: alive.clone(),
            inbox: inbox_tx.clone(),
            killed: AtomicBool::new(false),
        });

        let serve_alive = alive.clone();
        thread::spawn(move || serve(inbox_rx, resp_tx, serve_alive));

        self.processes.lock().unwrap().push(process.clone());
        Ok(SpawnedProcess {
            control: process,
            writer: Box::new(FakeWriter {
                inbox: inbox_tx,
                alive,
            }),
            reader: Box::new(FakeReader { responses: resp_rx }),
        })
    }
}
