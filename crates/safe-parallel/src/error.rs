//! Error types for safe-parallel.

use std::time::Duration;

use thiserror::Error;

/// Result type for worker control operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors raised by worker control operations.
///
/// Failures inside a work routine never surface here; they are captured as
/// [`CapturedException`](crate::CapturedException) data instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `stop` was called on a worker whose routine has no stop flag.
    #[error("worker {name}: stop is not available for routines without a stop flag")]
    UnsupportedOperation { name: String },

    /// A strict `stop` found the worker never became alive.
    #[error("worker {name}: not running")]
    NotRunning { name: String },

    /// `join` gave up while the work was still executing.
    #[error("worker {name}: still running after {timeout:?}")]
    JoinTimeout { name: String, timeout: Duration },

    /// The work finished but the underlying process or thread did not exit in time.
    #[error("worker {name}: finished but did not exit within {timeout:?}")]
    TeardownTimeout { name: String, timeout: Duration },

    /// Workers cannot be restarted.
    #[error("worker {name}: already started")]
    AlreadyStarted { name: String },

    /// The routine did not provide a work method and no target was given.
    #[error("routine must implement `run` when no target is supplied")]
    NotImplemented,

    /// Forking a process or spawning a thread failed.
    #[error("failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The exception channel misbehaved.
    #[error("exception channel error: {0}")]
    Channel(String),

    /// Encoding or decoding a cross-boundary message failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}
