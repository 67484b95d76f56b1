//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Localhost port allocation
//! - A recording `ReplicationApply` mock
//! - Helpers to bring up groups of managers and poll for conditions

#![allow(dead_code)]

use bytes::Bytes;
use repmgr::apply::{ApplyError, BoxFuture, Transport};
use repmgr::{Eid, RepMgrConfig, RepRole, ReplicationApply, ReplicationManager, SiteAddr, StartMode};
use std::future::Future;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Install a fmt subscriber once (honours `RUST_LOG`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A localhost port that was free a moment ago.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A recorded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedLog {
    pub from: Eid,
    pub lsn: u64,
    pub payload: Bytes,
}

/// Mock collaborator that records every call.
#[derive(Default)]
pub struct MockApply {
    logs: Mutex<Vec<AppliedLog>>,
    roles: Mutex<Vec<RepRole>>,
    masters: Mutex<Vec<Eid>>,
    became_master: AtomicUsize,
    has_transport: AtomicBool,
    reject_logs: AtomicBool,
}

impl MockApply {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `process_log` fail, so no acks are sent.
    pub fn reject_logs(&self, reject: bool) {
        self.reject_logs.store(reject, Ordering::SeqCst);
    }

    pub fn logs(&self) -> Vec<AppliedLog> {
        self.logs.lock().unwrap().clone()
    }

    pub fn lsns(&self) -> Vec<u64> {
        self.logs().iter().map(|l| l.lsn).collect()
    }

    pub fn roles(&self) -> Vec<RepRole> {
        self.roles.lock().unwrap().clone()
    }

    pub fn masters(&self) -> Vec<Eid> {
        self.masters.lock().unwrap().clone()
    }

    pub fn became_master(&self) -> usize {
        self.became_master.load(Ordering::SeqCst)
    }

    pub fn has_transport(&self) -> bool {
        self.has_transport.load(Ordering::SeqCst)
    }
}

impl ReplicationApply for MockApply {
    fn set_transport(&self, _transport: Arc<dyn Transport>) {
        self.has_transport.store(true, Ordering::SeqCst);
    }

    fn rep_start(&self, _local: &SiteAddr, role: RepRole) -> BoxFuture<'_, ()> {
        self.roles.lock().unwrap().push(role);
        Box::pin(async { Ok(()) })
    }

    fn become_master(&self) -> BoxFuture<'_, ()> {
        self.became_master.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn master_changed(&self, master: Eid) {
        self.masters.lock().unwrap().push(master);
    }

    fn process_log(&self, from: Eid, lsn: u64, payload: Bytes) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.reject_logs.load(Ordering::SeqCst) {
                return Err(ApplyError(format!("rejected lsn {}", lsn)));
            }
            self.logs.lock().unwrap().push(AppliedLog { from, lsn, payload });
            Ok(())
        })
    }
}

/// One manager in a test group.
pub struct TestSite {
    pub mgr: Arc<ReplicationManager>,
    pub apply: Arc<MockApply>,
    pub port: u16,
}

impl TestSite {
    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

/// Configure `priorities.len()` managers that all know each other.
///
/// The first site is flagged as everyone else's peer.
pub async fn configure_group(priorities: &[u32], config: &RepMgrConfig) -> Vec<TestSite> {
    let ports: Vec<u16> = priorities.iter().map(|_| free_port()).collect();
    let mut sites = Vec::new();
    for (i, priority) in priorities.iter().enumerate() {
        let apply = MockApply::new();
        let mut config = config.clone();
        config.priority = *priority;
        let mgr = Arc::new(ReplicationManager::with_apply(config, apply.clone()));
        mgr.set_local_site("127.0.0.1", ports[i]).await.unwrap();
        for (j, port) in ports.iter().enumerate() {
            if i != j {
                mgr.add_remote_site("127.0.0.1", *port, j == 0).await.unwrap();
            }
        }
        sites.push(TestSite {
            mgr,
            apply,
            port: ports[i],
        });
    }
    sites
}

/// Configure and start a group; `modes[i]` applies to site `i`.
pub async fn start_group(priorities: &[u32], modes: &[StartMode], config: &RepMgrConfig) -> Vec<TestSite> {
    let sites = configure_group(priorities, config).await;
    for (site, mode) in sites.iter().zip(modes) {
        site.mgr.start(2, *mode).await.unwrap();
    }
    sites
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// The EID `site` has registered for the address `addr`.
pub async fn eid_of(site: &TestSite, addr: &str) -> Option<Eid> {
    site.mgr
        .status()
        .await
        .sites
        .iter()
        .find(|s| s.address == addr)
        .map(|s| s.eid)
}

/// Stop and join every site, asserting a clean shutdown.
pub async fn shutdown(sites: &[TestSite]) {
    for site in sites {
        let _ = site.mgr.stop().await;
    }
    for site in sites {
        tokio::time::timeout(Duration::from_secs(5), site.mgr.wait())
            .await
            .expect("wait() hung after stop()")
            .expect("tasks failed to join");
    }
}
