//! Error types for procwork
//!
//! This module defines the error types surfaced by the transport, RPC, and
//! process-lifecycle layers, using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for procwork operations.
///
/// The public surface (per the error taxonomy) is `ChannelClosed`,
/// `Timeout`, and `WorkerFailure`. The remaining variants are internal:
/// they wrap I/O, serialization, and spawn failures that propagate up
/// rather than being recovered locally.
#[derive(Error, Debug)]
pub enum ProcworkError {
    /// A request or notification was sent on, or awaited a response from,
    /// a channel that has closed.
    #[error("channel closed")]
    ChannelClosed,

    /// A wait-style operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// A worker exited with a non-success status, observed via
    /// `WorkerGroup::wait_for_failure` or `WorkerGroup::failure`.
    #[error("worker {index} failed: {exit_status}")]
    WorkerFailure {
        /// Zero-based index of the failing worker.
        index: usize,
        /// Human-readable rendering of the platform exit status.
        exit_status: String,
    },

    /// The child process could not be spawned (e.g. executable not found).
    #[error("failed to spawn child process: {0}")]
    Spawn(String),

    /// Low-level I/O failure on a transport's pipe or socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be serialized to or deserialized from JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation; should never surface to a caller.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for procwork operations.
pub type Result<T> = std::result::Result<T, ProcworkError>;
