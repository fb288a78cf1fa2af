//! Spawning worker processes from their key.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::proc::ProcControl;
use super::{SpawnedProcess, WorkerTransport};
use crate::error::{PoolError, Result};
use crate::pool::{WorkerId, WorkerKey};
use nix::unistd::Pid;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::debug;

/// Flag appended to every worker command line so the tool starts in
/// persistent mode instead of doing a one-shot invocation.
pub const PERSISTENT_WORKER_FLAG: &str = "--persistent_worker";

/// Transport that starts each worker as a child process speaking JSON lines on
/// its stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct CommandTransport {
    /// Directory receiving each worker's stderr; inherited when unset.
    log_dir: Option<PathBuf>,
}

impl CommandTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect worker stderr to `<dir>/<mnemonic>-<id>.log`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    fn stderr_for(&self, key: &WorkerKey, id: WorkerId) -> std::io::Result<Stdio> {
        match &self.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let file = File::create(dir.join(format!("{}-{}.log", key.mnemonic(), id)))?;
                Ok(Stdio::from(file))
            }
            None => Ok(Stdio::inherit()),
        }
    }

    fn command(&self, key: &WorkerKey) -> Command {
        let mut cmd = Command::new(key.executable());
        cmd.args(key.args())
            .arg(PERSISTENT_WORKER_FLAG)
            .envs(key.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if !key.exec_root().as_os_str().is_empty() {
            cmd.current_dir(key.exec_root());
        }
        cmd
    }
}

impl WorkerTransport for CommandTransport {
    fn spawn(&self, key: &WorkerKey, id: WorkerId) -> Result<SpawnedProcess> {
        let stderr = self
            .stderr_for(key, id)
            .map_err(|e| PoolError::spawn(key.mnemonic(), format!("worker log: {e}")))?;

        let mut child = self
            .command(key)
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                PoolError::spawn(
                    key.mnemonic(),
                    format!("{}: {e}", key.executable().display()),
                )
            })?;

        let control = Arc::new(ProcControl::new(Pid::from_raw(child.id() as i32)));
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            // Dropping the control kills and reaps the child
            return Err(PoolError::spawn(key.mnemonic(), "worker stdio not captured"));
        };

        debug!(
            worker_id = %id,
            mnemonic = key.mnemonic(),
            pid = child.id(),
            "Spawned worker process"
        );

        Ok(SpawnedProcess {
            control,
            writer: Box::new(LineWriter::new(PipeFd::new(stdin))),
            reader: Box::new(LineReader::new(PipeFd::new(stdout))),
        })
    }
}
