// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication manager.
//!
//! Errors are grouped by where they come from: caller configuration,
//! the network mesh, the election protocol, and task supervision.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `InvalidArgument` | No | Bad configuration or call order |
//! | `AlreadyConfigured` | No | Local site set twice |
//! | `Busy` | No | Tasks still running or waiters outstanding |
//! | `Io` | Yes | Connection failure, recovered by reconnect |
//! | `Resolve` | Yes | Host name lookup failed |
//! | `ElectionTimeout` | Yes | Election rounds exhausted without quorum |
//! | `AckTimeout` | Yes | Ack policy not met before the deadline |
//! | `ThreadJoin` | No | A task panicked or was cancelled |
//! | `Apply` | No | Log-apply collaborator rejected a record |
//! | `Shutdown` | No | Manager is stopping |
//!
//! Network failures never reach the application from the background
//! tasks: the Connection Manager retries them. Configuration errors are
//! returned synchronously from the call that caused them.

use crate::site::Eid;
use thiserror::Error;

/// Result type alias for replication manager operations.
pub type Result<T> = std::result::Result<T, RepMgrError>;

/// Errors that can occur in the replication manager.
#[derive(Error, Debug)]
pub enum RepMgrError {
    /// Bad configuration or an operation called in the wrong order
    /// (empty host, zero threads, `start` twice, `start` before the
    /// local site is set, unknown policy name).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The local site address was already set.
    #[error("Already configured: {0}")]
    AlreadyConfigured(String),

    /// Tasks or waiters are still active.
    ///
    /// Returned by `wait()` when `stop()` has not been called yet.
    #[error("Busy: {0}")]
    Busy(String),

    /// Connection failure for a site.
    ///
    /// Recovered by reconnect with backoff; only surfaced to callers of
    /// a direct send.
    #[error("I/O error (site {eid}): {message}")]
    Io { eid: Eid, message: String },

    /// Host name resolution failed.
    #[error("Cannot resolve {host}: {message}")]
    Resolve { host: String, message: String },

    /// No quorum of votes was collected within the configured rounds.
    #[error("Election timed out after {rounds} rounds")]
    ElectionTimeout { rounds: u32 },

    /// The ack policy was not satisfied before the ack timeout.
    #[error("Timed out waiting for acknowledgements of LSN {lsn}")]
    AckTimeout { lsn: u64 },

    /// A supervised task panicked or was cancelled.
    #[error("Task {task} failed to join: {message}")]
    ThreadJoin { task: String, message: String },

    /// The log-apply collaborator failed.
    #[error("Apply engine error: {0}")]
    Apply(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl RepMgrError {
    /// Create an I/O error for a site.
    pub fn io(eid: Eid, message: impl Into<String>) -> Self {
        Self::Io {
            eid,
            message: message.into(),
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { .. } => true, // Reconnect with backoff
            Self::Resolve { .. } => true,
            Self::ElectionTimeout { .. } => true,
            Self::AckTimeout { .. } => true,
            Self::InvalidArgument(_) => false,
            Self::AlreadyConfigured(_) => false,
            Self::Busy(_) => false,
            Self::ThreadJoin { .. } => false,
            Self::Apply(_) => false,
            Self::Shutdown => false,
        }
    }

    /// Check if this is an `InvalidArgument` error.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}
