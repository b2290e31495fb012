//! Error types for cluster-worker.

use thiserror::Error;

/// Main error type for cluster-worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server failed to boot: {0}")]
    Boot(String),

    #[error("Server failed to start a generation: {0}")]
    ServerStart(String),

    #[error("Unable to fork worker {index}: {source}")]
    Fork {
        index: usize,
        #[source]
        source: nix::Error,
    },

    #[error("Invalid fork request: {0:?}")]
    InvalidForkRequest(String),

    #[error("Invalid IPC message: {0:?}")]
    InvalidMessage(String),

    #[error("Hook {hook} failed: {message}")]
    Hook { hook: &'static str, message: String },

    #[error("Invalid file descriptor {fd}: {source}")]
    BadDescriptor {
        fd: i32,
        #[source]
        source: nix::Error,
    },
}

/// Result type alias for cluster-worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
