//! Error taxonomy shared by every Outpost operation.
//!
//! Each variant maps to one failure class a caller may want to react to
//! differently. Remote command exit codes are never errors on their own; they
//! travel inside [`crate::exec::ExecutionResult`].

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Connection to {host} timed out after {}s", .after.as_secs())]
    ConnectTimeout { host: String, after: Duration },

    #[error("Transport error on {host}: {message}")]
    TransportError { host: String, message: String },

    #[error("Failed to execute command on {host}: {message}")]
    ExecFailed { host: String, message: String },

    #[error("Stream error on {host}: {message}")]
    StreamError { host: String, message: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Corrupt snapshot record {id}: {message}")]
    CorruptRecord { id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} has shut down")]
    Shutdown(&'static str),
}

impl RemoteError {
    /// Stable machine-readable name for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::UnknownHost(_) => "UnknownHost",
            RemoteError::ConnectTimeout { .. } => "ConnectTimeout",
            RemoteError::TransportError { .. } => "TransportError",
            RemoteError::ExecFailed { .. } => "ExecFailed",
            RemoteError::StreamError { .. } => "StreamError",
            RemoteError::JobNotFound(_) => "JobNotFound",
            RemoteError::SnapshotNotFound(_) => "SnapshotNotFound",
            RemoteError::CorruptRecord { .. } => "CorruptRecord",
            RemoteError::Config(_) => "Config",
            RemoteError::Io(_) => "Io",
            RemoteError::Json(_) => "Json",
            RemoteError::Shutdown(_) => "Shutdown",
        }
    }

    /// True for failures that mean the session itself is unusable.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::TransportError { .. } | RemoteError::StreamError { .. }
        )
    }

    pub(crate) fn exec_failed(host: &str, message: impl Into<String>) -> Self {
        RemoteError::ExecFailed {
            host: host.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn stream(host: &str, message: impl Into<String>) -> Self {
        RemoteError::StreamError {
            host: host.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn transport(host: &str, message: impl Into<String>) -> Self {
        RemoteError::TransportError {
            host: host.to_string(),
            message: message.into(),
        }
    }
}
