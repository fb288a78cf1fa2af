//! Pool of long-lived persistent worker processes.
//!
//! A build tool that runs the same compiler over and over can keep the
//! compiler alive between actions. `wpool` manages those processes:
//!
//! - [`pool::WorkerPool`] partitions workers by [`pool::WorkerKey`], bounds
//!   each partition's process count, and hands out exclusive leases.
//! - Multiplex-capable workers serve many leases from one process, with
//!   requests correlated by id.
//! - [`transport`] starts processes and frames JSON-line requests over their
//!   stdin/stdout; swap in your own [`transport::WorkerTransport`] as needed.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wpool::config::WorkerPoolConfig;
//! use wpool::pool::{WorkerKey, WorkerPool};
//! use wpool::transport::CommandTransport;
//!
//! # fn main() -> wpool::Result<()> {
//! let pool = WorkerPool::new(WorkerPoolConfig::default(), Arc::new(CommandTransport::new()))?;
//! let key = WorkerKey::builder("Echo", "wpool").args(["worker"]).build();
//!
//! let mut worker = pool.borrow_worker(&key)?;
//! let output = worker.do_work(vec!["hello".into()])?;
//! assert_eq!(output.output, "hello");
//! pool.return_worker(&key, worker);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod transport;
pub mod worker_main;

pub use error::{PoolError, Result};
