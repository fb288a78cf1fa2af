//! Pool partition identity.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, PartialEq, Eq, Hash)]
struct KeyParts {
    mnemonic: String,
    executable: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    exec_root: PathBuf,
    worker_files_hash: String,
    multiplex: bool,
}

/// Everything that must match for two actions to share a worker process.
///
/// Keys are immutable and cheap to clone. Two keys are equal iff every field is
/// equal, so a change in the worker's own tool files (reflected in
/// `worker_files_hash`) moves callers onto a fresh partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey(Arc<KeyParts>);

impl WorkerKey {
    /// Start building a key for `mnemonic` running `executable`.
    pub fn builder(mnemonic: impl Into<String>, executable: impl Into<PathBuf>) -> WorkerKeyBuilder {
        WorkerKeyBuilder {
            parts: KeyParts {
                mnemonic: mnemonic.into(),
                executable: executable.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
                exec_root: PathBuf::new(),
                worker_files_hash: String::new(),
                multiplex: false,
            },
        }
    }

    pub fn mnemonic(&self) -> &str {
        &self.0.mnemonic
    }

    pub fn executable(&self) -> &Path {
        &self.0.executable
    }

    /// Fixed startup arguments.
    pub fn args(&self) -> &[String] {
        &self.0.args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.0.env
    }

    pub fn exec_root(&self) -> &Path {
        &self.0.exec_root
    }

    pub fn worker_files_hash(&self) -> &str {
        &self.0.worker_files_hash
    }

    pub fn is_multiplex(&self) -> bool {
        self.0.multiplex
    }

    /// Combined SHA-256 over the worker's own input files.
    ///
    /// Paths are sorted first so the hash does not depend on the order the
    /// caller lists them in; each path and its content digest feed the hash.
    pub fn hash_worker_files<P: AsRef<Path>>(files: impl IntoIterator<Item = P>) -> io::Result<String> {
        let mut paths: Vec<PathBuf> = files.into_iter().map(|p| p.as_ref().to_path_buf()).collect();
        paths.sort();
        paths.dedup();

        let mut combined = Sha256::new();
        for path in &paths {
            combined.update(path.as_os_str().as_encoded_bytes());
            combined.update([0u8]);
            combined.update(file_digest(path)?);
        }
        Ok(format!("{:x}", combined.finalize()))
    }
}

fn file_digest(path: &Path) -> io::Result<Vec<u8>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.mnemonic(), self.executable().display())?;
        if self.is_multiplex() {
            write!(f, ", multiplex")?;
        }
        write!(f, ")")
    }
}

/// Builder for [`WorkerKey`].
#[derive(Debug)]
pub struct WorkerKeyBuilder {
    parts: KeyParts,
}

impl WorkerKeyBuilder {
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parts.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.env.insert(name.into(), value.into());
        self
    }

    pub fn exec_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.parts.exec_root = root.into();
        self
    }

    /// Set the combined hash of the worker's own files; see
    /// [`WorkerKey::hash_worker_files`].
    pub fn worker_files_hash(mut self, hash: impl Into<String>) -> Self {
        self.parts.worker_files_hash = hash.into();
        self
    }

    pub fn multiplex(mut self, multiplex: bool) -> Self {
        self.parts.multiplex = multiplex;
        self
    }

    pub fn build(self) -> WorkerKey {
        WorkerKey(Arc::new(self.parts))
    }
}
