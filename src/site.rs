//! Site Registry.
//!
//! Holds the local site and every known remote site, each under a stable
//! numeric identifier ([`Eid`]).
//!
//! # EIDs
//!
//! A remote site's EID is derived from its `host:port` (FNV-1a, 31 bits),
//! so every member of a group assigns the same EID to the same site. The
//! election tie-break on highest EID therefore agrees across the group.
//! On a collision with a different address the next free value is taken.
//!
//! [`SELF_EID`] names the local process in public results (master
//! identity, ack bookkeeping). The local site also has a derived EID,
//! [`SiteRegistry::local_eid`], used when ranking it as an election
//! candidate.
//!
//! # Idempotent adds
//!
//! Adding an address that is already registered returns the existing EID
//! as [`AddSite::Existing`] instead of creating a second entry.

use crate::error::{RepMgrError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info};

/// Stable identifier of a site within a replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Eid(pub u32);

/// The local process.
pub const SELF_EID: Eid = Eid(u32::MAX);

impl Eid {
    /// Check if this names the local process.
    pub fn is_self(self) -> bool {
        self == SELF_EID
    }
}

impl std::fmt::Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_self() {
            write!(f, "self")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Network address of a site as configured (`host`, `port`).
///
/// Host names are compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteAddr {
    host: String,
    port: u16,
}

impl SiteAddr {
    /// Build an address, rejecting an empty host.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(RepMgrError::invalid("host must not be empty"));
        }
        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same host on a different port (after binding an ephemeral port).
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    /// EID derived from this address (before collision probing).
    pub fn derived_eid(&self) -> Eid {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in self.host.bytes().chain(b":".iter().copied()).chain(self.port.to_be_bytes()) {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        Eid(hash & 0x7fff_ffff)
    }
}

impl std::fmt::Display for SiteAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Resolve a site address to socket addresses.
///
/// This may block on DNS; it is only called from API calls and connection
/// tasks, never from the Selector.
pub async fn resolve(addr: &SiteAddr) -> Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((addr.host(), addr.port()))
        .await
        .map_err(|e| RepMgrError::Resolve {
            host: addr.host().to_string(),
            message: e.to_string(),
        })?
        .collect();

    if resolved.is_empty() {
        return Err(RepMgrError::Resolve {
            host: addr.host().to_string(),
            message: "no addresses".to_string(),
        });
    }
    Ok(resolved)
}

/// Last-known liveness of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Never connected.
    Unknown,
    /// A live connection exists.
    Connected,
    /// The connection was lost.
    Disconnected,
}

/// A remote site.
#[derive(Debug, Clone)]
pub struct Site {
    pub eid: Eid,
    pub addr: SiteAddr,
    /// Resolved socket addresses (empty until resolved).
    pub resolved: Vec<SocketAddr>,
    /// Designated ack-policy peer.
    pub is_peer: bool,
    /// Election priority advertised by the site (`None` until heard).
    pub priority: Option<u32>,
    pub liveness: Liveness,
    /// When liveness last changed.
    pub since: Option<Instant>,
}

impl Site {
    /// Whether this site can win an election (unknown counts as electable).
    pub fn is_electable(&self) -> bool {
        self.priority.map_or(true, |p| p > 0)
    }

    pub fn is_connected(&self) -> bool {
        self.liveness == Liveness::Connected
    }
}

/// The local site.
#[derive(Debug, Clone)]
pub struct LocalSite {
    pub addr: SiteAddr,
    pub resolved: Vec<SocketAddr>,
    pub eid: Eid,
}

/// Outcome of adding a remote site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSite {
    /// A new site was registered.
    Added(Eid),
    /// The address was already registered under this EID.
    Existing(Eid),
}

impl AddSite {
    pub fn eid(self) -> Eid {
        match self {
            AddSite::Added(eid) | AddSite::Existing(eid) => eid,
        }
    }

    /// True for a brand-new site.
    pub fn is_new(self) -> bool {
        matches!(self, AddSite::Added(_))
    }
}

/// Registry of the local site and all remote sites.
#[derive(Debug, Default)]
pub struct SiteRegistry {
    local: Option<LocalSite>,
    sites: BTreeMap<Eid, Site>,
    by_addr: HashMap<SiteAddr, Eid>,
    peer_eid: Option<Eid>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local site. Fails if one is already set.
    pub fn set_local(&mut self, addr: SiteAddr, resolved: Vec<SocketAddr>) -> Result<Eid> {
        if let Some(local) = &self.local {
            return Err(RepMgrError::AlreadyConfigured(format!(
                "local site already set to {}",
                local.addr
            )));
        }
        if self.by_addr.contains_key(&addr) {
            return Err(RepMgrError::invalid(format!(
                "{} is already registered as a remote site",
                addr
            )));
        }
        let eid = self.free_eid(&addr);
        info!(addr = %addr, eid = %eid, "Local site set");
        self.local = Some(LocalSite { addr, resolved, eid });
        Ok(eid)
    }

    /// Replace the local port after binding an ephemeral port.
    pub(crate) fn rebind_local(&mut self, port: u16) {
        let Some(local) = self.local.take() else {
            return;
        };
        let addr = local.addr.with_port(port);
        let eid = self.free_eid(&addr);
        self.local = Some(LocalSite {
            addr,
            resolved: local.resolved,
            eid,
        });
    }

    pub fn local(&self) -> Option<&LocalSite> {
        self.local.as_ref()
    }

    /// Derived EID of the local site (for election ranking).
    pub fn local_eid(&self) -> Option<Eid> {
        self.local.as_ref().map(|l| l.eid)
    }

    /// Add a remote site, or return the existing entry for its address.
    ///
    /// `is_peer` makes this site the ack-policy peer; only one peer is
    /// tracked, so this clears the flag on any previous peer.
    pub fn add_remote(&mut self, addr: SiteAddr, resolved: Vec<SocketAddr>, is_peer: bool) -> Result<AddSite> {
        if self.local.as_ref().is_some_and(|l| l.addr == addr) {
            return Err(RepMgrError::invalid(format!("{} is the local site", addr)));
        }

        let outcome = match self.find(&addr) {
            Some(eid) => {
                if let Some(site) = self.sites.get_mut(&eid) {
                    if site.resolved.is_empty() {
                        site.resolved = resolved;
                    }
                }
                AddSite::Existing(eid)
            }
            None => {
                let eid = self.free_eid(&addr);
                debug!(addr = %addr, eid = %eid, "Registered remote site");
                self.by_addr.insert(addr.clone(), eid);
                self.sites.insert(
                    eid,
                    Site {
                        eid,
                        addr,
                        resolved,
                        is_peer: false,
                        priority: None,
                        liveness: Liveness::Unknown,
                        since: None,
                    },
                );
                AddSite::Added(eid)
            }
        };

        if is_peer {
            self.set_peer(outcome.eid());
        }
        Ok(outcome)
    }

    /// Make `eid` the single ack-policy peer (last write wins).
    pub fn set_peer(&mut self, eid: Eid) {
        if let Some(previous) = self.peer_eid.replace(eid) {
            if let Some(site) = self.sites.get_mut(&previous) {
                site.is_peer = false;
            }
        }
        if let Some(site) = self.sites.get_mut(&eid) {
            site.is_peer = true;
        }
    }

    pub fn peer_eid(&self) -> Option<Eid> {
        self.peer_eid
    }

    pub fn get(&self, eid: Eid) -> Option<&Site> {
        self.sites.get(&eid)
    }

    pub fn find(&self, addr: &SiteAddr) -> Option<Eid> {
        self.by_addr.get(addr).copied()
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values()
    }

    /// Number of remote sites.
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn connected_eids(&self) -> Vec<Eid> {
        self.sites
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.eid)
            .collect()
    }

    /// Peer-flagged sites.
    pub fn peer_eids(&self) -> Vec<Eid> {
        self.sites
            .values()
            .filter(|s| s.is_peer)
            .map(|s| s.eid)
            .collect()
    }

    /// Remote sites that may win an election.
    pub fn electable_eids(&self) -> Vec<Eid> {
        self.sites
            .values()
            .filter(|s| s.is_electable())
            .map(|s| s.eid)
            .collect()
    }

    /// Record a liveness change. Returns `true` if it changed.
    pub fn set_liveness(&mut self, eid: Eid, liveness: Liveness) -> bool {
        match self.sites.get_mut(&eid) {
            Some(site) if site.liveness != liveness => {
                site.liveness = liveness;
                site.since = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Record the priority a site advertised.
    pub fn set_priority(&mut self, eid: Eid, priority: u32) {
        if let Some(site) = self.sites.get_mut(&eid) {
            site.priority = Some(priority);
        }
    }

    fn free_eid(&self, addr: &SiteAddr) -> Eid {
        let mut candidate = addr.derived_eid();
        loop {
            let taken_by_remote = self
                .sites
                .get(&candidate)
                .is_some_and(|site| &site.addr != addr);
            let taken_by_local = self
                .local
                .as_ref()
                .is_some_and(|l| l.eid == candidate && &l.addr != addr);
            if !taken_by_remote && !taken_by_local {
                return candidate;
            }
            candidate = Eid((candidate.0 + 1) & 0x7fff_ffff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str, port: u16) -> SiteAddr {
        SiteAddr::new(host, port).unwrap()
    }

    #[test]
    fn test_site_addr_rejects_empty_host() {
        let err = SiteAddr::new("", 5000).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(SiteAddr::new("   ", 5000).is_err());
    }

    #[test]
    fn test_site_addr_case_insensitive() {
        assert_eq!(addr("DB-1.Example.com", 5000), addr("db-1.example.com", 5000));
        assert_eq!(addr("db-1", 5000).to_string(), "db-1:5000");
    }

    #[test]
    fn test_derived_eid_is_stable() {
        let a = addr("db-1", 5000);
        assert_eq!(a.derived_eid(), a.clone().derived_eid());
        assert_ne!(a.derived_eid(), addr("db-1", 5001).derived_eid());
        assert!(a.derived_eid().0 < 0x8000_0000);
        assert!(!a.derived_eid().is_self());
    }

    #[test]
    fn test_eid_display() {
        assert_eq!(Eid(12).to_string(), "12");
        assert_eq!(SELF_EID.to_string(), "self");
    }

    #[test]
    fn test_set_local_twice_fails() {
        let mut registry = SiteRegistry::new();
        registry.set_local(addr("db-1", 5000), vec![]).unwrap();

        let err = registry.set_local(addr("db-2", 5000), vec![]).unwrap_err();
        assert!(matches!(err, RepMgrError::AlreadyConfigured(_)));
        assert_eq!(registry.local().unwrap().addr, addr("db-1", 5000));
    }

    #[test]
    fn test_add_remote_is_idempotent() {
        let mut registry = SiteRegistry::new();

        let first = registry.add_remote(addr("db-2", 5000), vec![], false).unwrap();
        let second = registry.add_remote(addr("DB-2", 5000), vec![], false).unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.eid(), second.eid());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_remote_rejects_local_address() {
        let mut registry = SiteRegistry::new();
        registry.set_local(addr("db-1", 5000), vec![]).unwrap();

        let err = registry.add_remote(addr("db-1", 5000), vec![], false).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_peer_last_write_wins() {
        let mut registry = SiteRegistry::new();
        let a = registry.add_remote(addr("db-2", 5000), vec![], true).unwrap().eid();
        assert_eq!(registry.peer_eid(), Some(a));

        let b = registry.add_remote(addr("db-3", 5000), vec![], true).unwrap().eid();
        assert_eq!(registry.peer_eid(), Some(b));
        assert!(!registry.get(a).unwrap().is_peer);
        assert!(registry.get(b).unwrap().is_peer);
        assert_eq!(registry.peer_eids(), vec![b]);
    }

    #[test]
    fn test_re_adding_as_peer_marks_existing() {
        let mut registry = SiteRegistry::new();
        let a = registry.add_remote(addr("db-2", 5000), vec![], false).unwrap();
        let again = registry.add_remote(addr("db-2", 5000), vec![], true).unwrap();

        assert_eq!(again, AddSite::Existing(a.eid()));
        assert_eq!(registry.peer_eid(), Some(a.eid()));
    }

    #[test]
    fn test_liveness_tracking() {
        let mut registry = SiteRegistry::new();
        let a = registry.add_remote(addr("db-2", 5000), vec![], false).unwrap().eid();
        let b = registry.add_remote(addr("db-3", 5000), vec![], false).unwrap().eid();

        assert!(registry.connected_eids().is_empty());
        assert!(registry.set_liveness(a, Liveness::Connected));
        assert!(!registry.set_liveness(a, Liveness::Connected));
        assert_eq!(registry.connected_eids(), vec![a]);

        registry.set_liveness(b, Liveness::Connected);
        registry.set_liveness(a, Liveness::Disconnected);
        assert_eq!(registry.connected_eids(), vec![b]);
    }

    #[test]
    fn test_electable_ignores_zero_priority() {
        let mut registry = SiteRegistry::new();
        let a = registry.add_remote(addr("db-2", 5000), vec![], false).unwrap().eid();
        let b = registry.add_remote(addr("db-3", 5000), vec![], false).unwrap().eid();
        assert_eq!(registry.electable_eids().len(), 2);

        registry.set_priority(a, 0);
        assert_eq!(registry.electable_eids(), vec![b]);
    }

    #[test]
    fn test_rebind_local_changes_port() {
        let mut registry = SiteRegistry::new();
        registry.set_local(addr("127.0.0.1", 0), vec![]).unwrap();
        registry.rebind_local(40123);

        let local = registry.local().unwrap();
        assert_eq!(local.addr.port(), 40123);
        assert_eq!(local.eid, addr("127.0.0.1", 40123).derived_eid());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let resolved = resolve(&addr("127.0.0.1", 5000)).await.unwrap();
        assert_eq!(resolved[0].port(), 5000);
    }
}
