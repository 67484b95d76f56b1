//! Ack policies and the Ack Tracker.
//!
//! A durable send on the master registers its LSN with the [`AckTracker`],
//! which records which sites acknowledged it. [`evaluate`] decides whether
//! the configured [`AckPolicy`] is met.
//!
//! # Policies
//!
//! | Policy | Satisfied when |
//! |--------|----------------|
//! | `None` | immediately |
//! | `One` | any site acked |
//! | `OnePeer` | the designated peer acked |
//! | `All` | every site connected at send time acked |
//! | `AllPeers` | every peer-flagged site connected at send time acked |
//! | `Quorum` | acks (the master included) reach `total_electable / 2 + 1` |
//!
//! # Disconnects
//!
//! When a required site drops before acknowledging, [`AckDegrade`] decides:
//! `Exclude` removes it from `All`/`AllPeers`/`OnePeer` requirements, while
//! `Block` keeps it required so the send runs into its timeout. Quorum is a
//! majority of the configured electable sites either way.

use crate::error::{RepMgrError, Result};
use crate::site::{Eid, SELF_EID};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Durability rule for a durable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    All,
    AllPeers,
    None,
    One,
    OnePeer,
    #[default]
    Quorum,
}

impl AckPolicy {
    pub const ALL_POLICIES: [AckPolicy; 6] = [
        AckPolicy::All,
        AckPolicy::AllPeers,
        AckPolicy::None,
        AckPolicy::One,
        AckPolicy::OnePeer,
        AckPolicy::Quorum,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AckPolicy::All => "all",
            AckPolicy::AllPeers => "all_peers",
            AckPolicy::None => "none",
            AckPolicy::One => "one",
            AckPolicy::OnePeer => "one_peer",
            AckPolicy::Quorum => "quorum",
        }
    }
}

impl std::fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckPolicy {
    type Err = RepMgrError;

    fn from_str(s: &str) -> Result<Self> {
        AckPolicy::ALL_POLICIES
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RepMgrError::invalid(format!("unknown ack policy '{}'", s)))
    }
}

/// Numeric policy codes, as used by embedding environments.
impl TryFrom<u32> for AckPolicy {
    type Error = RepMgrError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(AckPolicy::All),
            2 => Ok(AckPolicy::AllPeers),
            3 => Ok(AckPolicy::None),
            4 => Ok(AckPolicy::One),
            5 => Ok(AckPolicy::OnePeer),
            6 => Ok(AckPolicy::Quorum),
            other => Err(RepMgrError::invalid(format!("unknown ack policy code {}", other))),
        }
    }
}

/// What to do when a required site disconnects before acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckDegrade {
    /// Drop the site from the requirement.
    #[default]
    Exclude,
    /// Keep requiring it; the send times out.
    Block,
}

/// The sites a pending send is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckGroup {
    /// Sites connected when the record was sent.
    pub connected: BTreeSet<Eid>,
    /// Peer-flagged sites.
    pub peers: BTreeSet<Eid>,
    /// The designated peer for `OnePeer`.
    pub peer_eid: Option<Eid>,
    /// Remote sites that can win an election. Only their acks, and the
    /// local site's, count toward `Quorum`.
    pub electable: BTreeSet<Eid>,
    /// Electable sites in the group, the local site included.
    pub total_electable: usize,
    /// Required sites released by a disconnect.
    pub excluded: BTreeSet<Eid>,
}

/// Majority of `n`.
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Decide whether `acked` satisfies `policy` for `group`.
///
/// `OnePeer` without a designated peer behaves like `One`.
pub fn evaluate(policy: AckPolicy, acked: &BTreeSet<Eid>, group: &AckGroup) -> bool {
    let remote_acked = || acked.iter().any(|eid| !eid.is_self());
    let required = |eid: &&Eid| !group.excluded.contains(eid);

    match policy {
        AckPolicy::None => true,
        AckPolicy::One => remote_acked(),
        AckPolicy::OnePeer => match group.peer_eid {
            Some(peer) => acked.contains(&peer) || group.excluded.contains(&peer),
            None => remote_acked(),
        },
        AckPolicy::All => group
            .connected
            .iter()
            .filter(required)
            .all(|eid| acked.contains(eid)),
        AckPolicy::AllPeers => group
            .peers
            .intersection(&group.connected)
            .filter(required)
            .all(|eid| acked.contains(eid)),
        AckPolicy::Quorum => {
            let votes = acked
                .iter()
                .filter(|eid| eid.is_self() || group.electable.contains(eid))
                .count();
            votes >= quorum(group.total_electable)
        }
    }
}

#[derive(Debug)]
struct PendingAck {
    acked: BTreeSet<Eid>,
    group: AckGroup,
    notify: Arc<Notify>,
}

/// Outstanding durable sends, keyed by LSN.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: HashMap<u64, PendingAck>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `lsn`. The returned `Notify` fires on every ack or
    /// disconnect touching this send.
    ///
    /// When the local site is electable it counts towards `Quorum`.
    pub fn register(&mut self, lsn: u64, group: AckGroup, self_electable: bool) -> Result<Arc<Notify>> {
        if self.pending.contains_key(&lsn) {
            return Err(RepMgrError::invalid(format!("LSN {} already awaiting acks", lsn)));
        }
        let mut acked = BTreeSet::new();
        if self_electable {
            acked.insert(SELF_EID);
        }
        let notify = Arc::new(Notify::new());
        self.pending.insert(
            lsn,
            PendingAck {
                acked,
                group,
                notify: notify.clone(),
            },
        );
        Ok(notify)
    }

    /// Record an ack. Returns `false` for an LSN nobody waits on.
    pub fn record_ack(&mut self, lsn: u64, eid: Eid) -> bool {
        match self.pending.get_mut(&lsn) {
            Some(entry) => {
                if entry.acked.insert(eid) {
                    debug!(lsn, eid = %eid, acked = entry.acked.len(), "Ack recorded");
                }
                entry.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Apply the degrade policy to every send still missing an ack from `eid`.
    pub fn site_disconnected(&mut self, eid: Eid, degrade: AckDegrade) {
        for (lsn, entry) in self.pending.iter_mut() {
            if !entry.group.connected.contains(&eid) || entry.acked.contains(&eid) {
                continue;
            }
            if degrade == AckDegrade::Exclude {
                debug!(lsn, eid = %eid, "Excluding disconnected site from ack requirement");
                entry.group.excluded.insert(eid);
            }
            entry.notify.notify_waiters();
        }
    }

    /// Evaluate a pending send. `None` if `lsn` is not tracked.
    pub fn is_satisfied(&self, lsn: u64, policy: AckPolicy) -> Option<bool> {
        self.pending
            .get(&lsn)
            .map(|entry| evaluate(policy, &entry.acked, &entry.group))
    }

    /// Sites that acknowledged `lsn` so far.
    pub fn acked(&self, lsn: u64) -> Option<&BTreeSet<Eid>> {
        self.pending.get(&lsn).map(|entry| &entry.acked)
    }

    /// Stop tracking `lsn`.
    pub fn complete(&mut self, lsn: u64) {
        self.pending.remove(&lsn);
    }

    /// Wake every waiter (shutdown or policy change).
    pub fn wake_all(&self) {
        for entry in self.pending.values() {
            entry.notify.notify_waiters();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
