// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication manager and lifecycle controller.
//!
//! [`ReplicationManager`] is the application-facing handle. It owns the
//! shared [`ReplicationHandle`] and drives the lifecycle:
//!
//! 1. `set_local_site` / `add_remote_site` fill the site registry
//! 2. `start` binds the listener, hands the transport to the apply
//!    collaborator, spawns the Selector and the messengers, dials every
//!    known site and either becomes master or looks for one
//! 3. `send_log` (master only) replicates a record and waits for the ack
//!    policy
//! 4. `stop` flips `finished` and wakes every sleeper; `wait` joins all
//!    tasks and reports the first failure
//!
//! # Shutdown Guarantee
//!
//! Every place a task can sleep (queue wait, full send buffer, election
//! deadline, ack wait, Selector poll) is paired with a notification that
//! `stop` fires. Sleepers enable their notification before checking
//! `finished`, so none of them can miss it.

mod handle;
pub mod supervisor;
mod types;

pub(crate) use handle::{RepState, ReplicationHandle};
pub use types::{ManagerState, RepRole, RepStatus, SiteStatus, StartMode};

use crate::ack::AckPolicy;
use crate::apply::{NoOpApply, ReplicationApply};
use crate::config::RepMgrConfig;
use crate::connection::ConnectionManager;
use crate::election::ElectionReason;
use crate::error::{RepMgrError, Result};
use crate::messenger;
use crate::metrics;
use crate::selector::Selector;
use crate::site::{self, AddSite, Eid, SiteAddr, SELF_EID};
use crate::wire::{self, Message};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use supervisor::Runnable;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The replication manager for one replicated environment.
///
/// Several managers can live in one process; they share nothing.
pub struct ReplicationManager {
    handle: Arc<ReplicationHandle>,
}

impl ReplicationManager {
    /// Create a manager with a collaborator that stores nothing.
    pub fn new(config: RepMgrConfig) -> Self {
        Self::with_apply(config, Arc::new(NoOpApply))
    }

    /// Create a manager that delivers log records to `apply`.
    pub fn with_apply(config: RepMgrConfig, apply: Arc<dyn ReplicationApply>) -> Self {
        metrics::set_role(RepRole::Client.as_str());
        Self {
            handle: Arc::new(ReplicationHandle::new(config, apply)),
        }
    }

    pub fn config(&self) -> &RepMgrConfig {
        &self.handle.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.handle.lifecycle()
    }

    /// Watch lifecycle changes.
    pub fn state_receiver(&self) -> watch::Receiver<ManagerState> {
        self.handle.lifecycle_receiver()
    }

    // =========================================================================
    // Site registry
    // =========================================================================

    /// Set the local listening address.
    ///
    /// Resolves `host`, which may take a while; call it before `start`.
    /// Port `0` binds an ephemeral port at `start`.
    pub async fn set_local_site(&self, host: &str, port: u16) -> Result<()> {
        let addr = SiteAddr::new(host, port)?;
        if let Some(local) = self.handle.state.lock().await.sites.local() {
            return Err(RepMgrError::AlreadyConfigured(format!(
                "local site already set to {}",
                local.addr
            )));
        }

        let resolved = site::resolve(&addr).await?;
        self.handle.state.lock().await.sites.set_local(addr, resolved)?;
        Ok(())
    }

    /// Add a remote site, or find the existing entry for its address.
    ///
    /// `is_peer` designates the site for the peer ack policies (last call
    /// wins). After `start`, a new site is dialed right away.
    pub async fn add_remote_site(&self, host: &str, port: u16, is_peer: bool) -> Result<AddSite> {
        let addr = SiteAddr::new(host, port)?;
        let resolved = site::resolve(&addr).await?;

        let (added, started) = {
            let mut state = self.handle.state.lock().await;
            let added = state.sites.add_remote(addr.clone(), resolved, is_peer)?;
            (added, state.started)
        };

        match added {
            AddSite::Added(eid) => info!(eid = %eid, addr = %addr, is_peer, "Remote site added"),
            AddSite::Existing(eid) => debug!(eid = %eid, addr = %addr, "Remote site already known"),
        }

        if started && added.is_new() {
            let conns = self.handle.connections()?;
            conns.register_site(added.eid(), addr);
            conns.connect(added.eid()).await;
        }
        Ok(added)
    }

    // =========================================================================
    // Ack policy
    // =========================================================================

    /// Change the ack policy. Sends already waiting are re-evaluated
    /// against the new policy.
    pub async fn set_ack_policy(&self, policy: AckPolicy) -> Result<()> {
        let mut state = self.handle.state.lock().await;
        if state.ack_policy != policy {
            info!(from = %state.ack_policy, to = %policy, "Ack policy changed");
        }
        state.ack_policy = policy;
        state.acks.wake_all();
        Ok(())
    }

    pub async fn ack_policy(&self) -> AckPolicy {
        self.handle.state.lock().await.ack_policy
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start replication with `nthreads` messengers.
    ///
    /// Fails with `InvalidArgument` if `nthreads < 1`, if the local site
    /// was never set, if the configuration does not validate, or if `start`
    /// was already called.
    ///
    /// If startup fails after the listener is bound, whatever was spawned
    /// is told to stop; `wait` then joins it.
    pub async fn start(&self, nthreads: i32, mode: StartMode) -> Result<()> {
        if nthreads < 1 {
            return Err(RepMgrError::invalid(format!(
                "nthreads must be at least 1, got {}",
                nthreads
            )));
        }
        self.handle.config.validate()?;

        let (local, resolved) = {
            let mut state = self.handle.state.lock().await;
            if state.started {
                return Err(RepMgrError::invalid("start() already called"));
            }
            let Some(local) = state.sites.local() else {
                return Err(RepMgrError::invalid("local site must be set before start()"));
            };
            let local = (local.addr.clone(), local.resolved.clone());
            state.started = true;
            local
        };

        info!(
            addr = %local,
            nthreads,
            mode = mode.as_str(),
            "Starting replication manager"
        );

        let listener = match bind(&resolved).await {
            Ok(listener) => listener,
            Err(e) => {
                self.handle.state.lock().await.started = false;
                return Err(e);
            }
        };

        if let Err(e) = self.launch(listener, local, nthreads as usize, mode).await {
            warn!(error = %e, "Start failed, stopping what was started");
            if self.handle.signal_finished() {
                self.handle.state.lock().await.acks.wake_all();
                self.handle.set_lifecycle(ManagerState::Stopping);
                self.handle.wake_all();
            }
            return Err(e);
        }
        Ok(())
    }

    async fn launch(&self, listener: TcpListener, mut local: SiteAddr, nthreads: usize, mode: StartMode) -> Result<()> {
        let remotes: Vec<(Eid, SiteAddr)> = {
            let mut state = self.handle.state.lock().await;
            if local.port() == 0 {
                let port = listener
                    .local_addr()
                    .map_err(|e| RepMgrError::io(SELF_EID, e.to_string()))?
                    .port();
                state.sites.rebind_local(port);
                local = local.with_port(port);
                info!(port, "Bound ephemeral port");
            }
            state.sites.sites().map(|s| (s.eid, s.addr.clone())).collect()
        };

        let (conns, events) = ConnectionManager::new(
            local.clone(),
            self.handle.config.priority,
            self.handle.config.connection.clone(),
            self.handle.finished.clone(),
            self.handle.selector_wakeup.clone(),
        );
        self.handle.set_connections(conns.clone())?;
        for (eid, addr) in &remotes {
            conns.register_site(*eid, addr.clone());
        }

        let role = match mode {
            StartMode::Master => RepRole::Master,
            StartMode::Client | StartMode::Election => RepRole::Client,
        };
        self.handle.apply.set_transport(conns.clone());
        self.handle.apply.rep_start(&local, role).await?;

        {
            let mut tasks = self.handle.tasks.lock().await;
            let selector = Selector::new(self.handle.clone(), conns.clone(), listener, events);
            tasks.selector = Some(Runnable::spawn("selector", selector.run()));
            for id in 0..nthreads {
                tasks.messengers.push(Runnable::spawn(
                    format!("messenger-{}", id),
                    messenger::run_messenger(self.handle.clone(), id),
                ));
            }
        }
        self.handle.set_lifecycle(ManagerState::Running);

        for (eid, _) in &remotes {
            conns.connect(*eid).await;
        }

        match mode {
            StartMode::Master => {
                let term = self.handle.state.lock().await.term + 1;
                self.handle.become_master(term).await?;
            }
            StartMode::Client => self.handle.init_election(ElectionReason::SeekMaster).await,
            StartMode::Election => self.handle.init_election(ElectionReason::Election).await,
        }

        info!(sites = remotes.len(), role = %role, "Replication manager running");
        Ok(())
    }

    /// Signal every task to stop. Does not wait; see [`wait`](Self::wait).
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.handle.state.lock().await;
            if !state.started {
                return Err(RepMgrError::invalid("replication manager was never started"));
            }
            if !self.handle.signal_finished() {
                return Ok(());
            }
            state.acks.wake_all();
        }
        self.handle.set_lifecycle(ManagerState::Stopping);
        info!("Stopping replication manager");
        self.handle.wake_all();
        Ok(())
    }

    /// Join every task: election, messengers newest first, Selector, then
    /// connection writers. Returns the first failure after joining all.
    ///
    /// `Busy` if the manager is running and `stop` was not called.
    pub async fn wait(&self) -> Result<()> {
        if !self.handle.is_finished() {
            if !self.handle.state.lock().await.started {
                return Ok(());
            }
            return Err(RepMgrError::Busy("stop() has not been called".to_string()));
        }

        let group = std::mem::take(&mut *self.handle.tasks.lock().await);
        let task_count = group.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to exit");
        }
        let mut result = group.join_all().await;

        if let Ok(conns) = self.handle.connections() {
            // Close and join until no connection task is left
            loop {
                conns.shutdown();
                let tasks = conns.take_tasks().await;
                if tasks.is_empty() {
                    break;
                }
                let joined = supervisor::join_in_order(tasks).await;
                if result.is_ok() {
                    result = joined;
                }
            }
        }

        self.handle.set_lifecycle(ManagerState::Stopped);
        metrics::set_connected_sites(0);
        match &result {
            Ok(()) => info!("Replication manager stopped"),
            Err(e) => warn!(error = %e, "Replication manager stopped with errors"),
        }
        result
    }

    /// `stop` followed by `wait`.
    pub async fn close(&self) -> Result<()> {
        if self.handle.state.lock().await.started {
            self.stop().await?;
        }
        self.wait().await
    }

    // =========================================================================
    // Replication
    // =========================================================================

    /// Replicate a log record and wait until the ack policy is met.
    ///
    /// Master only. Fails with `InvalidArgument` if the payload cannot fit
    /// in one frame, with `AckTimeout` if the policy is not met within
    /// `ack_timeout`, and with `Shutdown` if the manager stops while
    /// waiting.
    pub async fn send_log(&self, lsn: u64, payload: Bytes) -> Result<()> {
        let conns = self.handle.connections()?;
        let limit = wire::max_log_payload(self.handle.config.connection.max_frame_len);
        if payload.len() > limit {
            return Err(RepMgrError::invalid(format!(
                "log payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                limit
            )));
        }
        let ack_timeout = self.handle.config.ack_timeout_duration()?;
        let self_electable = self.handle.config.priority > 0;

        let (policy, notify) = {
            let mut state = self.handle.state.lock().await;
            if self.handle.is_finished() {
                return Err(RepMgrError::Shutdown);
            }
            if state.role != RepRole::Master {
                return Err(RepMgrError::invalid("only the master can send log records"));
            }
            let group = state.ack_group(self_electable);
            let notify = state.acks.register(lsn, group, self_electable)?;
            (state.ack_policy, notify)
        };

        let needs_ack = policy != AckPolicy::None;
        let sites = conns
            .broadcast(&Message::Log {
                lsn,
                needs_ack,
                payload,
            })
            .await;
        debug!(lsn, sites, policy = %policy, "Log record sent");

        let started = Instant::now();
        let deadline = started + ack_timeout;
        let outcome = loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.handle.state.lock().await;
                if self.handle.is_finished() {
                    break Err(RepMgrError::Shutdown);
                }
                if state.acks.is_satisfied(lsn, state.ack_policy).unwrap_or(false) {
                    break Ok(());
                }
            }

            if Instant::now() >= deadline {
                break Err(RepMgrError::AckTimeout { lsn });
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }
        };

        let acked = {
            let mut state = self.handle.state.lock().await;
            let acked = state.acks.acked(lsn).map_or(0, |a| a.len());
            state.acks.complete(lsn);
            acked
        };

        let label = match &outcome {
            Ok(()) => "satisfied",
            Err(RepMgrError::AckTimeout { .. }) => "timeout",
            Err(_) => "shutdown",
        };
        metrics::record_ack_wait(policy.as_str(), label, started.elapsed());
        match &outcome {
            Ok(()) => debug!(lsn, acked, "Ack policy satisfied"),
            Err(e) => warn!(lsn, acked, error = %e, "Durable send not confirmed"),
        }
        outcome
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Snapshot of role, master, election and connectivity. No I/O.
    pub async fn status(&self) -> RepStatus {
        self.handle.status().await
    }

    /// The local listening address (with the bound port after `start`).
    pub async fn local_addr(&self) -> Option<SiteAddr> {
        self.handle.local_addr().await
    }

    pub async fn role(&self) -> RepRole {
        self.handle.state.lock().await.role
    }

    /// Current master, `SELF_EID` if this site is master.
    pub async fn master(&self) -> Option<Eid> {
        self.handle.state.lock().await.master
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        // Tasks hold the handle; make sure they wind down
        if self.handle.signal_finished() {
            self.handle.wake_all();
        }
    }
}

async fn bind(resolved: &[SocketAddr]) -> Result<TcpListener> {
    let mut last_error = String::from("no addresses");
    for addr in resolved {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = format!("{}: {}", addr, e),
        }
    }
    Err(RepMgrError::io(SELF_EID, format!("cannot listen: {}", last_error)))
}
