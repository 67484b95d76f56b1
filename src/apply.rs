// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log-apply collaborator integration traits.
//!
//! The replication manager coordinates sites but does not own the data.
//! The storage engine that produces and applies log records plugs in
//! through [`ReplicationApply`], and receives a [`Transport`] so it can
//! send its own protocol messages through the Connection Manager.
//!
//! # Example
//!
//! ```rust,no_run
//! use repmgr::apply::{ApplyResult, BoxFuture, ReplicationApply};
//! use repmgr::site::{Eid, SiteAddr};
//! use repmgr::RepRole;
//! use bytes::Bytes;
//!
//! struct MyEngine;
//!
//! impl ReplicationApply for MyEngine {
//!     fn rep_start(&self, _local: &SiteAddr, _role: RepRole) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn process_log(&self, _from: Eid, _lsn: u64, _payload: Bytes) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::error::Result;
use crate::manager::RepRole;
use crate::site::{Eid, SiteAddr};
use crate::wire::Message;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result type for collaborator operations.
pub type ApplyResult<T> = std::result::Result<T, ApplyError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ApplyResult<T>> + Send + 'a>>;

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Simplified error for collaborator operations.
#[derive(Debug, Clone)]
pub struct ApplyError(pub String);

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ApplyError {}

impl From<ApplyError> for crate::error::RepMgrError {
    fn from(e: ApplyError) -> Self {
        crate::error::RepMgrError::Apply(e.0)
    }
}

/// Outbound message path handed to the collaborator at start.
pub trait Transport: Send + Sync {
    /// Send one message to a site, connecting if needed.
    ///
    /// Waits while the site's send buffer is full; released with an error
    /// when the manager stops.
    fn send(&self, eid: Eid, msg: Message) -> TransportFuture<'_, ()>;

    /// Send one message to every connected site. Returns how many sites
    /// it was queued for.
    fn broadcast(&self, msg: Message) -> TransportFuture<'_, usize>;
}

/// What the replication manager needs from the storage engine.
pub trait ReplicationApply: Send + Sync + 'static {
    /// Receive the outbound transport. Called once during `start`, before
    /// [`rep_start`](Self::rep_start).
    fn set_transport(&self, _transport: Arc<dyn Transport>) {}

    /// Start replication in the given role.
    fn rep_start(&self, local: &SiteAddr, role: RepRole) -> BoxFuture<'_, ()>;

    /// This site won an election (or was started as master).
    fn become_master(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Another site became master.
    fn master_changed(&self, _master: Eid) {}

    /// Apply a log record received from `from`.
    ///
    /// An ack is sent back only when this returns `Ok`.
    fn process_log(&self, from: Eid, lsn: u64, payload: Bytes) -> BoxFuture<'_, ()>;
}

/// Collaborator that accepts everything and stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpApply;

impl ReplicationApply for NoOpApply {
    fn rep_start(&self, _local: &SiteAddr, _role: RepRole) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn process_log(&self, _from: Eid, _lsn: u64, _payload: Bytes) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepMgrError;

    #[tokio::test]
    async fn test_noop_accepts_everything() {
        let apply = NoOpApply;
        let local = SiteAddr::new("127.0.0.1", 5000).unwrap();

        assert!(apply.rep_start(&local, RepRole::Client).await.is_ok());
        assert!(apply.become_master().await.is_ok());
        assert!(apply
            .process_log(Eid(1), 10, Bytes::from_static(b"record"))
            .await
            .is_ok());
        apply.master_changed(Eid(1));
    }

    #[test]
    fn test_apply_error_converts() {
        let err: RepMgrError = ApplyError("disk full".to_string()).into();
        assert!(matches!(err, RepMgrError::Apply(ref m) if m == "disk full"));
        assert!(!err.is_retryable());
    }
}
