//! Pool configuration.
//!
//! Limits are configured per mnemonic with a fallback default, the same way a
//! build tool's `--worker_max_instances=Javac=2` style flags work:
//!
//! ```text
//! "4"          default for every mnemonic
//! "=4"         same
//! "Javac=2"    override for one mnemonic
//! "Javac=auto" one per available CPU
//! ```

use crate::error::{PoolError, Result};
use crate::pool::WorkerKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAX_INSTANCES: usize = 4;
pub const DEFAULT_MAX_MULTIPLEX_PROCESSES: usize = 1;
pub const DEFAULT_MAX_MULTIPLEX_INSTANCES: usize = 8;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 500;

/// One `Mnemonic=N` entry. An empty mnemonic sets the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitEntry {
    pub mnemonic: String,
    pub value: usize,
}

impl FromStr for LimitEntry {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        let (mnemonic, raw) = match s.split_once('=') {
            Some((mnemonic, raw)) => (mnemonic.trim(), raw.trim()),
            None => ("", s.trim()),
        };
        let value = if raw.eq_ignore_ascii_case("auto") {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            raw.parse::<usize>().map_err(|_| {
                PoolError::InvalidConfig(format!("'{s}': expected Mnemonic=N or Mnemonic=auto"))
            })?
        };
        if value == 0 {
            return Err(PoolError::InvalidConfig(format!(
                "'{s}': limit must be at least 1"
            )));
        }
        Ok(Self {
            mnemonic: mnemonic.to_string(),
            value,
        })
    }
}

/// A limit with per-mnemonic overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MnemonicLimits {
    pub default: usize,
    #[serde(default)]
    pub overrides: BTreeMap<String, usize>,
}

impl MnemonicLimits {
    pub fn new(default: usize) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn get(&self, mnemonic: &str) -> usize {
        self.overrides.get(mnemonic).copied().unwrap_or(self.default)
    }

    pub fn apply(&mut self, entry: LimitEntry) {
        if entry.mnemonic.is_empty() {
            self.default = entry.value;
        } else {
            self.overrides.insert(entry.mnemonic, entry.value);
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.default == 0 {
            return Err(PoolError::InvalidConfig(format!(
                "{name}: default must be at least 1"
            )));
        }
        if let Some((mnemonic, _)) = self.overrides.iter().find(|(_, v)| **v == 0) {
            return Err(PoolError::InvalidConfig(format!(
                "{name}: limit for '{mnemonic}' must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Settings for a [`WorkerPool`](crate::pool::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Singleplex processes per mnemonic.
    pub max_instances: MnemonicLimits,
    /// Multiplex processes per mnemonic.
    pub max_multiplex_processes: MnemonicLimits,
    /// Concurrent proxies per multiplex process.
    pub max_multiplex_instances: MnemonicLimits,
    /// Mnemonics allowed to run multiplexed. A multiplex key whose mnemonic is
    /// not listed is served by singleplex processes.
    pub multiplex_mnemonics: BTreeSet<String>,
    /// Time a destroyed process gets to exit after its stdin closes.
    pub shutdown_grace_ms: u64,
    /// Directory receiving each worker's stderr.
    pub worker_log_dir: Option<PathBuf>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_instances: MnemonicLimits::new(DEFAULT_MAX_INSTANCES),
            max_multiplex_processes: MnemonicLimits::new(DEFAULT_MAX_MULTIPLEX_PROCESSES),
            max_multiplex_instances: MnemonicLimits::new(DEFAULT_MAX_MULTIPLEX_INSTANCES),
            multiplex_mnemonics: BTreeSet::new(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            worker_log_dir: None,
        }
    }
}

impl WorkerPoolConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.max_instances.validate("max_instances")?;
        self.max_multiplex_processes
            .validate("max_multiplex_processes")?;
        self.max_multiplex_instances
            .validate("max_multiplex_instances")?;
        if let Some(dir) = &self.worker_log_dir
            && dir.as_os_str().is_empty()
        {
            return Err(PoolError::InvalidConfig(
                "worker_log_dir must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn multiplex_enabled(&self, mnemonic: &str) -> bool {
        self.multiplex_mnemonics.contains(mnemonic)
    }

    /// Whether `key` will be served by shared multiplex processes.
    pub fn uses_multiplex(&self, key: &WorkerKey) -> bool {
        key.is_multiplex() && self.multiplex_enabled(key.mnemonic())
    }

    /// Ceiling on live physical processes for `key`.
    pub fn max_processes_per_key(&self, key: &WorkerKey) -> usize {
        if self.uses_multiplex(key) {
            self.max_multiplex_processes.get(key.mnemonic())
        } else {
            self.max_instances.get(key.mnemonic())
        }
    }

    /// Ceiling on handles, borrowed plus idle, for `key`.
    ///
    /// Equals the process ceiling unless the key is multiplexed, in which case
    /// every process may carry `instances_per_process` proxies.
    pub fn max_total_per_key(&self, key: &WorkerKey) -> usize {
        self.max_processes_per_key(key)
            .saturating_mul(self.instances_per_process(key))
    }

    /// Concurrent proxies per process for `key`; 1 when not multiplexed.
    pub fn instances_per_process(&self, key: &WorkerKey) -> usize {
        if self.uses_multiplex(key) {
            self.max_multiplex_instances.get(key.mnemonic())
        } else {
            1
        }
    }
}
