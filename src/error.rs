//! Error types for wpool.

use thiserror::Error;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to start worker for mnemonic '{mnemonic}': {message}")]
    Spawn { mnemonic: String, message: String },

    #[error("Interrupted while waiting for a worker")]
    Interrupted,

    #[error("Worker transport failed: {0}")]
    Transport(String),

    #[error("Worker pool is closed")]
    Closed,

    #[error("Worker protocol error: {0}")]
    Protocol(String),

    #[error("Worker rejected request: {0}")]
    Rejected(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    /// Build a spawn failure for `mnemonic`.
    pub fn spawn(mnemonic: &str, message: impl std::fmt::Display) -> Self {
        Self::Spawn {
            mnemonic: mnemonic.to_string(),
            message: message.to_string(),
        }
    }

    /// Whether the error means the process behind a handle is gone for good.
    ///
    /// Callers holding a handle that produced a fatal error should invalidate it
    /// rather than return it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_) | Self::Io(_))
    }
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Report an internal consistency violation.
///
/// Bugs are surfaced on the `wpool::bug` target so operators can alert on them,
/// while the caller skips the offending entry and keeps going.
macro_rules! report_bug {
    ($($arg:tt)+) => {
        ::tracing::error!(target: "wpool::bug", $($arg)+)
    };
}
pub(crate) use report_bug;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_spawn_error_message() {
        let err = PoolError::spawn("Javac", "No such file or directory");
        let msg = err.to_string();
        assert!(msg.contains("Javac"));
        assert!(msg.contains("No such file"));
    }

    #[test]
    fn test_interrupted_error_message() {
        let msg = PoolError::Interrupted.to_string();
        assert!(msg.contains("Interrupted"));
    }

    #[test]
    fn test_closed_error_message() {
        assert_eq!(PoolError::Closed.to_string(), "Worker pool is closed");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PoolError::Transport("eof".into()).is_fatal());
        assert!(PoolError::Protocol("bad id".into()).is_fatal());
        assert!(!PoolError::Interrupted.is_fatal());
        assert!(!PoolError::Closed.is_fatal());
        assert!(!PoolError::Rejected("unknown flag".into()).is_fatal());
        assert!(!PoolError::spawn("Javac", "boom").is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: PoolError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }
}
