//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Site connections and reconnects
//! - Inbound/outbound message flow
//! - Queue depth and overflow drops
//! - Elections and role changes
//! - Ack waits
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `repmgr_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations
//!
//! No recorder is installed by this crate; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Connection Metrics
// =============================================================================

/// Record a connection attempt outcome.
pub fn record_connection(eid: u32, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("repmgr_connections_total", "eid" => eid.to_string(), "status" => status).increment(1);
}

/// Record a connection being torn down.
pub fn record_disconnect(eid: u32, reason: &str) {
    counter!("repmgr_disconnects_total", "eid" => eid.to_string(), "reason" => reason.to_string())
        .increment(1);
}

/// Gauge for currently connected sites.
pub fn set_connected_sites(count: usize) {
    gauge!("repmgr_connected_sites").set(count as f64);
}

// =============================================================================
// Message Metrics
// =============================================================================

/// Record an inbound message by kind.
pub fn record_message_received(kind: &str) {
    counter!("repmgr_messages_received_total", "kind" => kind.to_string()).increment(1);
}

/// Record an outbound message by kind.
pub fn record_message_sent(kind: &str, sites: usize) {
    counter!("repmgr_messages_sent_total", "kind" => kind.to_string()).increment(sites as u64);
}

/// Record a message dropped because the inbound queue was full.
pub fn record_message_dropped(kind: &str) {
    counter!("repmgr_messages_dropped_total", "kind" => kind.to_string()).increment(1);
}

/// Gauge for inbound queue depth.
pub fn set_queue_depth(depth: usize) {
    gauge!("repmgr_queue_depth").set(depth as f64);
}

// =============================================================================
// Election Metrics
// =============================================================================

/// Record an election being started.
pub fn record_election_started(reason: &str) {
    counter!("repmgr_elections_started_total", "reason" => reason.to_string()).increment(1);
}

/// Record an election outcome ("won", "lost", "found_master", "timeout", "shutdown").
pub fn record_election_outcome(outcome: &str, rounds: u32, duration: Duration) {
    counter!("repmgr_elections_completed_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("repmgr_election_rounds").record(rounds as f64);
    histogram!("repmgr_election_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge for the local role.
pub fn set_role(role: &str) {
    let value = match role {
        "client" => 1.0,
        "master" => 2.0,
        _ => 0.0,
    };
    gauge!("repmgr_role").set(value);
}

// =============================================================================
// Ack Metrics
// =============================================================================

/// Record a durable send's outcome ("satisfied", "timeout", "shutdown").
pub fn record_ack_wait(policy: &str, outcome: &str, duration: Duration) {
    counter!(
        "repmgr_ack_waits_total",
        "policy" => policy.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("repmgr_ack_wait_duration_seconds", "policy" => policy.to_string())
        .record(duration.as_secs_f64());
}
