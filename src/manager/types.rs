//! Lifecycle and status types.
//!
//! # State Transitions
//!
//! ```text
//!            start()              stop()               wait()
//! Created ───────────→ Running ───────────→ Stopping ───────────→ Stopped
//!    │                                          ↑
//!    └──────────────────────────────────────────┘
//!                 stop() before start() is rejected
//! ```
//!
//! A stopped manager is never restarted: `start` may only be called once.

use crate::ack::AckPolicy;
use crate::election::ElectionPhase;
use crate::error::{RepMgrError, Result};
use crate::site::{Eid, Liveness};
use std::str::FromStr;

/// Lifecycle state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Configured but not started.
    Created,
    /// Tasks running.
    Running,
    /// `stop()` called; tasks winding down.
    Stopping,
    /// Every task joined.
    Stopped,
}

impl std::fmt::Display for ManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagerState::Created => write!(f, "Created"),
            ManagerState::Running => write!(f, "Running"),
            ManagerState::Stopping => write!(f, "Stopping"),
            ManagerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Replication role of the local site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepRole {
    Client,
    Master,
}

impl RepRole {
    pub fn as_str(self) -> &'static str {
        match self {
            RepRole::Client => "client",
            RepRole::Master => "master",
        }
    }
}

impl std::fmt::Display for RepRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How `start` brings the local site up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Start as a client and look for an existing master.
    Client,
    /// Start as a client and hold an election right away.
    Election,
    /// Become master immediately.
    Master,
}

impl StartMode {
    pub fn as_str(self) -> &'static str {
        match self {
            StartMode::Client => "client",
            StartMode::Election => "election",
            StartMode::Master => "master",
        }
    }
}

impl FromStr for StartMode {
    type Err = RepMgrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(StartMode::Client),
            "election" => Ok(StartMode::Election),
            "master" => Ok(StartMode::Master),
            other => Err(RepMgrError::invalid(format!("unknown start mode '{}'", other))),
        }
    }
}

/// Per-site entry in [`RepStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStatus {
    pub eid: Eid,
    pub address: String,
    pub is_peer: bool,
    pub priority: Option<u32>,
    pub liveness: Liveness,
}

/// Point-in-time snapshot of the replication manager.
///
/// Collected from in-memory state only; no network I/O.
#[derive(Debug, Clone)]
pub struct RepStatus {
    pub state: ManagerState,
    pub role: RepRole,
    /// Current master (`SELF_EID` when this site is master).
    pub master: Option<Eid>,
    pub term: u64,
    pub election_phase: ElectionPhase,
    pub ack_policy: AckPolicy,
    pub pending_acks: usize,
    pub queue_depth: usize,
    pub connected_sites: usize,
    /// Senders waiting on a full send buffer.
    pub blocked_senders: usize,
    pub sites: Vec<SiteStatus>,
}

impl RepStatus {
    pub fn is_master(&self) -> bool {
        self.role == RepRole::Master
    }
}
