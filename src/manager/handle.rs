// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared state behind the manager and its tasks.
//!
//! [`ReplicationHandle`] is what every task holds an `Arc` of. All mutable
//! replication state lives in one [`RepState`] under a single mutex; the
//! wakeup primitives and the `finished` flag sit beside it so that a task
//! can enable its wakeup, take the lock, check its condition and release
//! the lock without missing a notification.
//!
//! Lock order: `tasks` before `state`. Nothing awaits network I/O while
//! holding `state`.

use crate::ack::{AckGroup, AckPolicy, AckTracker};
use crate::apply::ReplicationApply;
use crate::config::RepMgrConfig;
use crate::connection::ConnectionManager;
use crate::election::{self, ElectionPhase, ElectionReason, ElectionState};
use crate::error::{RepMgrError, Result};
use crate::manager::supervisor::{Runnable, TaskGroup};
use crate::manager::types::{ManagerState, RepRole, RepStatus, SiteStatus};
use crate::metrics;
use crate::queue::MessageQueue;
use crate::site::{Eid, Liveness, SiteAddr, SiteRegistry, SELF_EID};
use crate::wire::Message;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Longest the Selector sleeps without re-checking timers.
const MAX_TICK: Duration = Duration::from_secs(1);

/// Replication state guarded by the single state mutex.
#[derive(Debug)]
pub struct RepState {
    pub sites: SiteRegistry,
    pub role: RepRole,
    /// Known master; `SELF_EID` while this site is master.
    pub master: Option<Eid>,
    /// Highest election term seen.
    pub term: u64,
    pub election: ElectionState,
    pub acks: AckTracker,
    pub ack_policy: AckPolicy,
    /// `start` has been called.
    pub started: bool,
    pub last_master_contact: Option<Instant>,
    pub last_heartbeat_sent: Option<Instant>,
}

impl RepState {
    pub(crate) fn new(config: &RepMgrConfig) -> Self {
        Self {
            sites: SiteRegistry::new(),
            role: RepRole::Client,
            master: None,
            term: 0,
            election: ElectionState::default(),
            acks: AckTracker::new(),
            ack_policy: config.ack_policy,
            started: false,
            last_master_contact: None,
            last_heartbeat_sent: None,
        }
    }

    /// Adopt a higher term.
    pub fn observe_term(&mut self, term: u64) {
        self.term = self.term.max(term);
    }

    /// Sites an outgoing log record is measured against.
    pub fn ack_group(&self, self_electable: bool) -> AckGroup {
        let connected = self.sites.connected_eids().into_iter().collect();
        let peers = self
            .sites
            .peer_eids()
            .into_iter()
            .filter(|eid| self.sites.get(*eid).is_some_and(|s| s.is_connected()))
            .collect();
        let electable: BTreeSet<Eid> = self.sites.electable_eids().into_iter().collect();
        AckGroup {
            connected,
            peers,
            peer_eid: self.sites.peer_eid(),
            total_electable: electable.len() + usize::from(self_electable),
            electable,
            excluded: Default::default(),
        }
    }
}

/// State and signals shared by the manager and all of its tasks.
pub struct ReplicationHandle {
    pub(crate) config: RepMgrConfig,
    pub(crate) state: Mutex<RepState>,
    finished_tx: watch::Sender<bool>,
    pub(crate) finished: watch::Receiver<bool>,
    pub(crate) queue: MessageQueue,
    /// Wakes the election task (votes, master found, shutdown).
    pub(crate) election_wakeup: Notify,
    /// Wakes the Selector (new timers, shutdown).
    pub(crate) selector_wakeup: Arc<Notify>,
    connections: OnceLock<Arc<ConnectionManager>>,
    pub(crate) apply: Arc<dyn ReplicationApply>,
    pub(crate) tasks: Mutex<TaskGroup>,
    lifecycle_tx: watch::Sender<ManagerState>,
    lifecycle_rx: watch::Receiver<ManagerState>,
}

impl ReplicationHandle {
    pub(crate) fn new(config: RepMgrConfig, apply: Arc<dyn ReplicationApply>) -> Self {
        let (finished_tx, finished) = watch::channel(false);
        let (lifecycle_tx, lifecycle_rx) = watch::channel(ManagerState::Created);
        Self {
            state: Mutex::new(RepState::new(&config)),
            queue: MessageQueue::new(config.queue_capacity),
            config,
            finished_tx,
            finished,
            election_wakeup: Notify::new(),
            selector_wakeup: Arc::new(Notify::new()),
            connections: OnceLock::new(),
            apply,
            tasks: Mutex::new(TaskGroup::default()),
            lifecycle_tx,
            lifecycle_rx,
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// The Connection Manager. Exists once `start` bound the listener.
    pub(crate) fn connections(&self) -> Result<Arc<ConnectionManager>> {
        self.connections
            .get()
            .cloned()
            .ok_or_else(|| RepMgrError::invalid("replication manager not started"))
    }

    pub(crate) fn set_connections(&self, conns: Arc<ConnectionManager>) -> Result<()> {
        self.connections
            .set(conns)
            .map_err(|_| RepMgrError::invalid("connection manager already installed"))
    }

    pub(crate) fn lifecycle(&self) -> ManagerState {
        *self.lifecycle_rx.borrow()
    }

    pub(crate) fn set_lifecycle(&self, state: ManagerState) {
        self.lifecycle_tx.send_replace(state);
    }

    pub(crate) fn lifecycle_receiver(&self) -> watch::Receiver<ManagerState> {
        self.lifecycle_rx.clone()
    }

    /// Set `finished`. Returns `true` if this call set it.
    pub(crate) fn signal_finished(&self) -> bool {
        !self.finished_tx.send_replace(true)
    }

    /// Wake everything that may be sleeping so it re-checks `finished`.
    ///
    /// Synchronous: safe to call from `Drop`.
    pub(crate) fn wake_all(&self) {
        self.election_wakeup.notify_waiters();
        self.queue.wake_all();
        if let Some(conns) = self.connections.get() {
            conns.shutdown();
        }
        self.selector_wakeup.notify_waiters();
    }

    pub(crate) async fn local_addr(&self) -> Option<SiteAddr> {
        self.state.lock().await.sites.local().map(|l| l.addr.clone())
    }

    // =========================================================================
    // Site events (Selector)
    // =========================================================================

    /// Register the sender of an inbound handshake. Sites we did not know
    /// about are added as non-peers.
    pub(crate) async fn register_inbound(&self, host: &str, port: u16, priority: u32) -> Result<Eid> {
        let addr = SiteAddr::new(host, port)?;
        let added = {
            let mut state = self.state.lock().await;
            let added = state.sites.add_remote(addr.clone(), Vec::new(), false)?;
            state.sites.set_priority(added.eid(), priority);
            added
        };
        if added.is_new() {
            info!(eid = %added.eid(), addr = %addr, "Site introduced itself");
        }
        self.connections()?.register_site(added.eid(), addr);
        Ok(added.eid())
    }

    pub(crate) async fn record_priority(&self, eid: Eid, priority: u32) {
        self.state.lock().await.sites.set_priority(eid, priority);
    }

    /// A site's connection completed its handshake.
    pub(crate) async fn connection_up(&self, eid: Eid) {
        let priority = self.config.priority;
        let (connected, greeting) = {
            let mut state = self.state.lock().await;
            state.sites.set_liveness(eid, Liveness::Connected);
            let greeting = if state.role == RepRole::Master {
                Some(Message::NewMaster {
                    term: state.term,
                    priority,
                })
            } else {
                state.election.catch_up(state.term, priority)
            };
            (state.sites.connected_eids().len(), greeting)
        };
        metrics::set_connected_sites(connected);
        info!(eid = %eid, connected, "Site connected");

        if let (Some(msg), Ok(conns)) = (greeting, self.connections()) {
            if !conns.try_send(eid, &msg) {
                debug!(eid = %eid, kind = %msg.kind(), "Could not greet new connection");
            }
        }
        // An election round may be waiting for this site's reply
        self.election_wakeup.notify_waiters();
    }

    /// A site's connection was torn down.
    pub(crate) async fn connection_lost(self: &Arc<Self>, eid: Eid) {
        let (connected, lost_master) = {
            let mut state = self.state.lock().await;
            state.sites.set_liveness(eid, Liveness::Disconnected);
            state.acks.site_disconnected(eid, self.config.ack_degrade);
            let lost_master = state.master == Some(eid);
            if lost_master {
                state.master = None;
                state.last_master_contact = None;
            }
            (state.sites.connected_eids().len(), lost_master)
        };
        metrics::set_connected_sites(connected);
        self.election_wakeup.notify_waiters();

        if lost_master && !self.is_finished() {
            warn!(eid = %eid, "Lost connection to master");
            self.init_election(ElectionReason::MasterUnreachable).await;
        } else {
            debug!(eid = %eid, connected, "Site disconnected");
        }
    }

    // =========================================================================
    // Elections
    // =========================================================================

    /// Start an election unless one is already running.
    ///
    /// If one is running it is only woken up. Never called while holding
    /// `state`.
    pub(crate) async fn init_election(self: &Arc<Self>, reason: ElectionReason) {
        let mut tasks = self.tasks.lock().await;
        {
            let mut state = self.state.lock().await;
            if self.is_finished() || !state.started || state.role == RepRole::Master {
                return;
            }
            if state.election.running {
                drop(state);
                self.election_wakeup.notify_waiters();
                return;
            }
            state.election.start(reason);
        }

        if let Some(previous) = tasks.election.take() {
            // Its state says it is not running, so it is at most returning
            if let Err(e) = previous.join().await {
                warn!(error = %e, "Previous election task failed");
            }
        }

        let handle = Arc::clone(self);
        tasks.election = Some(Runnable::spawn("election", election::run_election(handle, reason)));
    }

    /// Take over as master with `term`.
    pub(crate) async fn become_master(&self, term: u64) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if self.is_finished() {
                return Err(RepMgrError::Shutdown);
            }
            state.role = RepRole::Master;
            state.master = Some(SELF_EID);
            state.observe_term(term);
            state.election.phase = ElectionPhase::Done;
            state.last_heartbeat_sent = Some(Instant::now());
        }
        metrics::set_role(RepRole::Master.as_str());
        info!(term, "Local site is master");

        self.apply.become_master().await?;

        let sent = self
            .connections()?
            .broadcast(&Message::NewMaster {
                term,
                priority: self.config.priority,
            })
            .await;
        debug!(sites = sent, "Announced new master");
        self.election_wakeup.notify_waiters();
        Ok(())
    }

    // =========================================================================
    // Timers (Selector)
    // =========================================================================

    /// Heartbeat send and monitor. Returns when the Selector should tick
    /// again.
    pub(crate) async fn on_tick(self: &Arc<Self>, conns: &ConnectionManager) -> Instant {
        let now = Instant::now();
        let mut next = now + MAX_TICK;
        let send_interval = self.config.heartbeat.send_interval();
        let monitor = self.config.heartbeat.monitor_timeout();

        let (heartbeat, start) = {
            let mut state = self.state.lock().await;
            if !state.started {
                return next;
            }
            let mut heartbeat = None;
            let mut start = None;
            match state.role {
                RepRole::Master => {
                    if let Some(interval) = send_interval {
                        let due = state.last_heartbeat_sent.map_or(now, |t| t + interval);
                        if due <= now {
                            state.last_heartbeat_sent = Some(now);
                            heartbeat = Some(state.term);
                            next = next.min(now + interval);
                        } else {
                            next = next.min(due);
                        }
                    }
                }
                RepRole::Client => {
                    if let Some(monitor) = monitor {
                        if state.master.is_some() {
                            let last = *state.last_master_contact.get_or_insert(now);
                            if last + monitor <= now {
                                warn!(
                                    master = ?state.master,
                                    silent_ms = now.duration_since(last).as_millis() as u64,
                                    "Master heartbeat missed"
                                );
                                state.master = None;
                                state.last_master_contact = None;
                                start = Some(ElectionReason::MasterUnreachable);
                            } else {
                                next = next.min(last + monitor);
                            }
                        } else if !state.election.running {
                            let since = state.election.last_finished;
                            match since {
                                Some(at) if at + monitor > now => next = next.min(at + monitor),
                                _ => start = Some(ElectionReason::SeekMaster),
                            }
                        }
                    }
                }
            }
            (heartbeat, start)
        };

        if let Some(term) = heartbeat {
            let sent = conns.try_broadcast(&Message::Heartbeat { term });
            debug!(sites = sent, term, "Heartbeat sent");
        }
        if let Some(reason) = start {
            self.init_election(reason).await;
        }

        conns.next_retry().map_or(next, |retry| next.min(retry))
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub(crate) async fn status(&self) -> RepStatus {
        let queue_depth = self.queue.len().await;
        let state = self.state.lock().await;
        let sites = state
            .sites
            .sites()
            .map(|s| SiteStatus {
                eid: s.eid,
                address: s.addr.to_string(),
                is_peer: s.is_peer,
                priority: s.priority,
                liveness: s.liveness,
            })
            .collect();
        RepStatus {
            state: self.lifecycle(),
            role: state.role,
            master: state.master,
            term: state.term,
            election_phase: state.election.phase,
            ack_policy: state.ack_policy,
            pending_acks: state.acks.pending_len(),
            queue_depth,
            connected_sites: state.sites.connected_eids().len(),
            blocked_senders: self.connections.get().map_or(0, |c| c.blocked_senders()),
            sites,
        }
    }
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("finished", &self.is_finished())
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}
