//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use wpool::config::{LimitEntry, WorkerPoolConfig};
use wpool::error::{PoolError, Result};

/// Run requests through a pool of persistent worker processes.
#[derive(Parser, Debug)]
#[command(name = "wpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send each stdin line as one request to a pool of workers.
    Run(RunArgs),

    /// Act as a persistent echo worker on stdin/stdout.
    Worker(WorkerArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Mnemonic naming the worker's partition.
    #[arg(long, env = "WPOOL_MNEMONIC", default_value = "Echo")]
    pub mnemonic: String,

    /// Process quota, as N or Mnemonic=N ("auto" = one per CPU). Repeatable.
    #[arg(long = "max-workers", env = "WPOOL_MAX_WORKERS", value_delimiter = ',')]
    pub max_workers: Vec<LimitEntry>,

    /// Share each worker process between concurrent requests.
    #[arg(long)]
    pub multiplex: bool,

    /// Concurrent requests per multiplex process, as N or Mnemonic=N.
    #[arg(long, env = "WPOOL_MAX_MULTIPLEX_INSTANCES", value_delimiter = ',')]
    pub max_multiplex_instances: Vec<LimitEntry>,

    /// Number of requests in flight at once.
    #[arg(short, long, env = "WPOOL_JOBS", default_value_t = 4,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub jobs: u32,

    /// JSON pool configuration; flags override its values.
    #[arg(long, env = "WPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory receiving each worker's stderr.
    #[arg(long, env = "WPOOL_WORKER_LOG_DIR")]
    pub worker_log_dir: Option<PathBuf>,

    /// Print per-key pool statistics as JSON on stderr when done.
    #[arg(long)]
    pub stats: bool,

    /// Worker command line, after `--`.
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}

impl RunArgs {
    /// Pool configuration from the optional config file plus flags.
    pub fn pool_config(&self) -> Result<WorkerPoolConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerPoolConfig::from_json_file(path)?,
            None => WorkerPoolConfig::default(),
        };

        let quota = if self.multiplex {
            config.multiplex_mnemonics.insert(self.mnemonic.clone());
            &mut config.max_multiplex_processes
        } else {
            &mut config.max_instances
        };
        for entry in &self.max_workers {
            quota.apply(entry.clone());
        }
        for entry in &self.max_multiplex_instances {
            config.max_multiplex_instances.apply(entry.clone());
        }
        if let Some(dir) = &self.worker_log_dir {
            config.worker_log_dir = Some(dir.clone());
        }

        config.validate()?;
        Ok(config)
    }

    /// Executable and fixed arguments of the worker command.
    pub fn worker_command(&self) -> Result<(&str, &[String])> {
        self.command
            .split_first()
            .map(|(exe, args)| (exe.as_str(), args))
            .ok_or_else(|| PoolError::InvalidConfig("missing worker command".into()))
    }
}

/// Arguments for the worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Serve requests concurrently, answering each as soon as it is done.
    #[arg(long)]
    pub multiplex: bool,

    /// Passed by pools when starting a worker; always implied here.
    #[arg(long = "persistent_worker", hide = true)]
    pub persistent_worker: bool,
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// -q: errors only.
    Quiet,
    /// Default: warnings and errors.
    Normal,
    /// -v: pool lifecycle info.
    Info,
    /// -vv: per-worker events.
    Debug,
}

impl Verbosity {
    pub fn level(self) -> Level {
        match self {
            Verbosity::Quiet => Level::ERROR,
            Verbosity::Normal => Level::WARN,
            Verbosity::Info => Level::INFO,
            Verbosity::Debug => Level::DEBUG,
        }
    }
}

impl Cli {
    /// Get the verbosity level based on -v/-q flags.
    pub fn verbosity(&self) -> Verbosity {
        match (self.quiet, self.verbose) {
            (true, _) => Verbosity::Quiet,
            (false, 0) => Verbosity::Normal,
            (false, 1) => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}
