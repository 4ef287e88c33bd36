#![forbid(unsafe_code)]
//! Error types for the Strata buffer organizer.
//!
//! Defines `BoError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for callers that surface POSIX codes.

use thiserror::Error;

/// Unified error type for all buffer-organizer operations.
#[derive(Debug, Error)]
pub enum BoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A system library call failed. Fatal by contract: callers report and
    /// abort the task rather than retrying.
    #[error("library call {call} failed (errno {errno})")]
    LibraryCall { call: &'static str, errno: i32 },

    /// The distributed blob lock was held elsewhere; the task is abandoned
    /// without retry.
    #[error("blob {blob:#x} is locked elsewhere")]
    BlobLockContended { blob: u64 },

    #[error("buffer {buffer:#x} not resolvable on this node")]
    BufferUnresolved { buffer: u64 },

    #[error("no target has {needed} bytes of remaining capacity")]
    TargetsFull { needed: u64 },

    #[error("placement failed: {0}")]
    PlacementFailed(String),

    #[error("rpc to node {node} failed: {detail}")]
    Rpc { node: u32, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid task: {0}")]
    InvalidTask(&'static str),

    #[error("work queue is full")]
    QueueFull,

    #[error("work queue is shutting down")]
    ShuttingDown,

    #[error("wire format error: {0}")]
    WireFormat(String),
}

impl BoError {
    /// Build a `LibraryCall` error from a failed syscall wrapper.
    #[must_use]
    pub fn library_call(call: &'static str, err: &std::io::Error) -> Self {
        Self::LibraryCall {
            call,
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Convert this error into a POSIX errno for callers that speak errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::LibraryCall { errno, .. } => *errno,
            Self::BlobLockContended { .. } | Self::QueueFull => libc::EAGAIN,
            Self::BufferUnresolved { .. } | Self::NotFound(_) => libc::ENOENT,
            Self::TargetsFull { .. } => libc::ENOSPC,
            Self::PlacementFailed(_) | Self::Rpc { .. } => libc::EIO,
            Self::InvalidTask(_) | Self::WireFormat(_) => libc::EINVAL,
            Self::ShuttingDown => libc::ESHUTDOWN,
        }
    }

    /// True for the transient misses that skip one unit of work and let the
    /// outer loop continue.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BlobLockContended { .. }
                | Self::BufferUnresolved { .. }
                | Self::TargetsFull { .. }
                | Self::QueueFull
        )
    }
}

/// Result alias using `BoError`.
pub type Result<T> = std::result::Result<T, BoError>;
