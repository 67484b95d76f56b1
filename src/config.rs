//! Configuration for the replication manager.
//!
//! [`RepMgrConfig`] is passed to
//! [`ReplicationManager::new()`](crate::ReplicationManager::new) and can be
//! built programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use repmgr::config::RepMgrConfig;
//! use repmgr::ack::AckPolicy;
//!
//! let config = RepMgrConfig {
//!     ack_policy: AckPolicy::All,
//!     priority: 50,
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RepMgrConfig
//! ├── ack_policy / ack_timeout / ack_degrade   # durability
//! ├── priority                                 # election weight (0 = never master)
//! ├── connection: ConnectionConfig             # retry wait, buffers, frame limit
//! ├── election: ElectionConfig                 # timeout, retry wait, round bound
//! ├── heartbeat: HeartbeatConfig               # master liveness
//! └── queue_capacity                           # inbound message queue bound
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! ack_policy: quorum
//! ack_timeout: "1s"
//! priority: 100
//! connection:
//!   retry_wait_ms: 30000
//! election:
//!   timeout_ms: 2000
//!   retry_wait_ms: 10000
//!   max_rounds: 5
//! heartbeat:
//!   send_ms: 5000
//!   monitor_ms: 15000
//! ```

use crate::ack::{AckDegrade, AckPolicy};
use crate::error::{RepMgrError, Result};
use crate::resilience::RetrySchedule;
use crate::wire::LOG_HEADER_LEN;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationManager::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepMgrConfig {
    /// Initial ack policy. May be changed with `set_ack_policy` at any time.
    #[serde(default)]
    pub ack_policy: AckPolicy,

    /// How long a durable send waits for its ack policy, as a duration
    /// string (e.g. `"1s"`, `"500ms"`).
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: String,

    /// What happens to a pending ack requirement when a required site
    /// disconnects before acknowledging.
    #[serde(default)]
    pub ack_degrade: AckDegrade,

    /// Election priority of the local site. `0` means this site never
    /// becomes master.
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Connection Manager settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Election Manager settings.
    #[serde(default)]
    pub election: ElectionConfig,

    /// Master heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Maximum number of inbound messages waiting for a messenger.
    /// Messages arriving while the queue is full are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_ack_timeout() -> String {
    "1s".to_string()
}

fn default_priority() -> u32 {
    100
}

fn default_queue_capacity() -> usize {
    4096
}

impl Default for RepMgrConfig {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::default(),
            ack_timeout: default_ack_timeout(),
            ack_degrade: AckDegrade::default(),
            priority: default_priority(),
            connection: ConnectionConfig::default(),
            election: ElectionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl RepMgrConfig {
    /// Create a config with short timers for tests on localhost.
    pub fn for_testing() -> Self {
        Self {
            ack_timeout: "2s".to_string(),
            connection: ConnectionConfig {
                retry_wait_ms: 50,
                retry_max_ms: 500,
                connect_timeout_ms: 500,
                ..Default::default()
            },
            election: ElectionConfig {
                timeout_ms: 300,
                retry_wait_ms: 100,
                max_rounds: Some(50),
            },
            heartbeat: HeartbeatConfig {
                send_ms: 100,
                monitor_ms: 1000,
            },
            ..Default::default()
        }
    }

    /// Parse the ack timeout string to a Duration.
    pub fn ack_timeout_duration(&self) -> Result<Duration> {
        humantime::parse_duration(&self.ack_timeout).map_err(|e| {
            RepMgrError::invalid(format!("ack_timeout {:?}: {}", self.ack_timeout, e))
        })
    }

    /// Reject settings `start` cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.ack_timeout_duration()?;
        if self.connection.max_frame_len <= LOG_HEADER_LEN {
            return Err(RepMgrError::invalid(format!(
                "max_frame_len {} leaves no room for log records",
                self.connection.max_frame_len
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConnectionConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Connection Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Wait before the first reconnect attempt after a connection fails
    /// (milliseconds). Doubles on each further failure.
    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    /// Ceiling for the reconnect wait (milliseconds).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Timeout for a single TCP connect (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Frames buffered per connection before senders block.
    #[serde(default = "default_send_buffer_frames")]
    pub send_buffer_frames: usize,

    /// Largest frame accepted from a site (bytes).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_retry_wait_ms() -> u64 {
    30_000
}

fn default_retry_max_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_send_buffer_frames() -> usize {
    1024
}

fn default_max_frame_len() -> usize {
    16 * 1024 * 1024
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            retry_wait_ms: default_retry_wait_ms(),
            retry_max_ms: default_retry_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_buffer_frames: default_send_buffer_frames(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl ConnectionConfig {
    /// Reconnect schedule derived from these settings.
    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::new(
            Duration::from_millis(self.retry_wait_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ElectionConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Election Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// How long one round collects vote replies (milliseconds).
    #[serde(default = "default_election_timeout_ms")]
    pub timeout_ms: u64,

    /// Base wait between failed rounds (milliseconds).
    #[serde(default = "default_election_retry_wait_ms")]
    pub retry_wait_ms: u64,

    /// Rounds attempted before the election gives up.
    /// `None` retries until a master is found or the manager stops.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: Option<u32>,
}

fn default_election_timeout_ms() -> u64 {
    2_000
}

fn default_election_retry_wait_ms() -> u64 {
    10_000
}

fn default_max_rounds() -> Option<u32> {
    Some(5)
}

/// Backoff never grows past this multiple of `retry_wait_ms`.
const ELECTION_BACKOFF_MAX_MULTIPLIER: u32 = 8;

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_election_timeout_ms(),
            retry_wait_ms: default_election_retry_wait_ms(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl ElectionConfig {
    /// Reply-collection window for one round.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wait after the given number of failed rounds.
    /// Actual wait = retry_wait * min(2^(failed-1), 8).
    pub fn backoff_after(&self, failed_rounds: u32) -> Duration {
        RetrySchedule::capped_at(
            Duration::from_millis(self.retry_wait_ms),
            ELECTION_BACKOFF_MAX_MULTIPLIER,
        )
        .delay(failed_rounds)
    }

    /// Check whether another round is allowed after `rounds` attempts.
    pub fn allows_round(&self, rounds: u32) -> bool {
        self.max_rounds.map_or(true, |max| rounds < max)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HeartbeatConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Master heartbeat configuration. `0` disables either side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the master broadcasts a heartbeat (milliseconds).
    #[serde(default = "default_heartbeat_send_ms")]
    pub send_ms: u64,

    /// A client that hears nothing from its master for this long starts
    /// an election (milliseconds).
    #[serde(default = "default_heartbeat_monitor_ms")]
    pub monitor_ms: u64,
}

fn default_heartbeat_send_ms() -> u64 {
    5_000
}

fn default_heartbeat_monitor_ms() -> u64 {
    15_000
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            send_ms: default_heartbeat_send_ms(),
            monitor_ms: default_heartbeat_monitor_ms(),
        }
    }
}

impl HeartbeatConfig {
    /// Send interval, if heartbeats are enabled.
    pub fn send_interval(&self) -> Option<Duration> {
        (self.send_ms > 0).then(|| Duration::from_millis(self.send_ms))
    }

    /// Monitor threshold, if monitoring is enabled.
    pub fn monitor_timeout(&self) -> Option<Duration> {
        (self.monitor_ms > 0).then(|| Duration::from_millis(self.monitor_ms))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
