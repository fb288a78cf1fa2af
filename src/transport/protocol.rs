//! Wire protocol spoken with persistent workers.
//!
//! Messages are JSON-serialized and newline-delimited. Every work message carries
//! a `request_id`; singleplex workers always see id 0, multiplex workers see a
//! distinct non-zero id per outstanding request.

use serde::{Deserialize, Serialize};

/// Request id used for every singleplex exchange.
pub const SINGLEPLEX_REQUEST_ID: u32 = 0;

/// Request from pool to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Perform one unit of work.
    #[serde(rename = "work")]
    Work {
        /// Correlation id echoed back in the response.
        request_id: u32,
        /// Per-action arguments.
        arguments: Vec<String>,
    },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from worker to pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// The work finished (successfully or not) with an exit code.
    #[serde(rename = "result")]
    Result {
        request_id: u32,
        exit_code: i32,
        #[serde(default)]
        output: String,
    },

    /// The worker could not process the request at all.
    #[serde(rename = "error")]
    Error { request_id: u32, message: String },
}

impl WorkRequest {
    /// Create a work request.
    pub fn work(request_id: u32, arguments: Vec<String>) -> Self {
        Self::Work {
            request_id,
            arguments,
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    /// Create a result response.
    pub fn result(request_id: u32, exit_code: i32, output: impl Into<String>) -> Self {
        Self::Result {
            request_id,
            exit_code,
            output: output.into(),
        }
    }

    /// Create an error response.
    pub fn error(request_id: u32, message: impl Into<String>) -> Self {
        Self::Error {
            request_id,
            message: message.into(),
        }
    }

    /// Correlation id of the request this answers.
    pub fn request_id(&self) -> u32 {
        match self {
            Self::Result { request_id, .. } | Self::Error { request_id, .. } => *request_id,
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}
