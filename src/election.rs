//! Election Manager.
//!
//! Runs on demand as a single task when the local site has no master.
//!
//! # State Machine
//!
//! ```text
//!          init_election()
//! Idle ─────────────────────→ SeekingMaster ──(first vote reply)──→ Voting
//!  ↑                               │                                  │
//!  │        (master announced,     │ (deadline, no quorum:            │ (tally)
//!  │         shutdown, or rounds   │  back off, next round)           ↓
//!  └──────── exhausted) ───────────┴──────────────────────────────── Done
//! ```
//!
//! # Rounds
//!
//! A client started in `Client` mode first broadcasts a `MasterQuery` and
//! waits one election timeout for an existing master to answer. After
//! that each round:
//!
//! 1. broadcasts `VoteRequest { term, priority }` to every connected site
//! 2. collects `VoteReply` messages until every known site replied or the
//!    round deadline passed; a site that connects mid-round is sent the
//!    request when its handshake completes
//! 3. with replies from a quorum of the group (the local site included),
//!    picks the best candidate by (term, priority, EID); zero-priority
//!    sites never win and equal standing goes to the higher EID
//! 4. if the local site wins it becomes master and announces `NewMaster`,
//!    otherwise it waits one timeout for the winner's announcement
//!
//! Failed rounds back off (`retry_wait`, doubling, capped at 8x). After
//! `max_rounds` rounds the election ends with `ElectionTimeout`; it is
//! logged and the site stays masterless until a heartbeat-monitor tick or
//! a peer's vote request starts a new election.
//!
//! Every wait also ends when `finished` is set, so `stop()` never has to
//! wait for a round to complete.

use crate::ack::quorum;
use crate::error::{RepMgrError, Result};
use crate::manager::{RepRole, ReplicationHandle};
use crate::metrics;
use crate::site::{Eid, SELF_EID};
use crate::wire::Message;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Phase of the election state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    SeekingMaster,
    Voting,
    Done,
}

impl ElectionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ElectionPhase::Idle => "idle",
            ElectionPhase::SeekingMaster => "seeking_master",
            ElectionPhase::Voting => "voting",
            ElectionPhase::Done => "done",
        }
    }
}

/// Why an election was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionReason {
    /// Client startup with no known master.
    SeekMaster,
    /// Explicit election at startup.
    Election,
    /// The master's connection dropped or its heartbeats stopped.
    MasterUnreachable,
    /// Another site asked for our vote while we had no master.
    PeerRequest,
}

impl ElectionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ElectionReason::SeekMaster => "seek_master",
            ElectionReason::Election => "election",
            ElectionReason::MasterUnreachable => "master_unreachable",
            ElectionReason::PeerRequest => "peer_request",
        }
    }
}

/// A site's standing in an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub eid: Eid,
    pub term: u64,
    pub priority: u32,
}

impl Candidate {
    /// Ordering key: term, then priority, then EID.
    pub fn rank(&self) -> (u64, u32, Eid) {
        (self.term, self.priority, self.eid)
    }

    pub fn is_electable(&self) -> bool {
        self.priority > 0
    }
}

/// Pick the winner among `candidates`. `None` if nobody is electable.
pub fn tally<I>(candidates: I) -> Option<Candidate>
where
    I: IntoIterator<Item = Candidate>,
{
    candidates
        .into_iter()
        .filter(Candidate::is_electable)
        .max_by_key(Candidate::rank)
}

/// Election bookkeeping, kept in the shared state.
#[derive(Debug, Clone)]
pub struct ElectionState {
    pub phase: ElectionPhase,
    pub reason: Option<ElectionReason>,
    pub round: u32,
    /// An election task is alive.
    pub running: bool,
    pub votes: BTreeMap<Eid, Candidate>,
    pub winner: Option<Candidate>,
    pub deadline: Option<Instant>,
    pub last_finished: Option<Instant>,
}

impl Default for ElectionState {
    fn default() -> Self {
        Self {
            phase: ElectionPhase::Idle,
            reason: None,
            round: 0,
            running: false,
            votes: BTreeMap::new(),
            winner: None,
            deadline: None,
            last_finished: None,
        }
    }
}

impl ElectionState {
    pub(crate) fn start(&mut self, reason: ElectionReason) {
        self.running = true;
        self.reason = Some(reason);
        self.phase = ElectionPhase::SeekingMaster;
        self.round = 0;
        self.votes.clear();
        self.winner = None;
        self.deadline = None;
    }

    pub(crate) fn begin_round(&mut self, round: u32, deadline: Instant) {
        self.round = round;
        self.phase = ElectionPhase::SeekingMaster;
        self.votes.clear();
        self.winner = None;
        self.deadline = Some(deadline);
    }

    /// Record a reply. Only counted while a round is collecting.
    pub(crate) fn record_vote(&mut self, vote: Candidate) -> bool {
        if !self.running || !matches!(self.phase, ElectionPhase::SeekingMaster | ElectionPhase::Voting) {
            return false;
        }
        self.votes.insert(vote.eid, vote);
        self.phase = ElectionPhase::Voting;
        true
    }

    /// What a site that connects mid-election should be sent so it can
    /// take part: the master query before the first round, a vote request
    /// while a round is collecting.
    pub(crate) fn catch_up(&self, term: u64, priority: u32) -> Option<Message> {
        if !self.running {
            return None;
        }
        match (self.phase, self.deadline) {
            (ElectionPhase::SeekingMaster, None) => Some(Message::MasterQuery),
            (ElectionPhase::SeekingMaster | ElectionPhase::Voting, Some(_)) => {
                Some(Message::VoteRequest { term, priority })
            }
            _ => None,
        }
    }

    pub(crate) fn highest_term(&self) -> u64 {
        self.votes.values().map(|v| v.term).max().unwrap_or(0)
    }

    pub(crate) fn finish(&mut self) {
        self.running = false;
        self.phase = ElectionPhase::Idle;
        self.deadline = None;
        self.votes.clear();
        self.last_finished = Some(Instant::now());
    }
}

/// How an election ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    FoundMaster,
    Shutdown,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Won => "won",
            Outcome::FoundMaster => "found_master",
            Outcome::Shutdown => "shutdown",
        }
    }
}

/// Election task body.
pub(crate) async fn run_election(handle: Arc<ReplicationHandle>, reason: ElectionReason) -> Result<()> {
    let span = info_span!("election", reason = reason.as_str());
    async move {
        let started = Instant::now();
        metrics::record_election_started(reason.as_str());
        info!("Election started");

        let result = conduct(&handle, reason).await;

        let rounds = {
            let mut state = handle.state.lock().await;
            let rounds = state.election.round;
            state.election.finish();
            rounds
        };

        match result {
            Ok(outcome) => {
                info!(outcome = outcome.as_str(), rounds, "Election finished");
                metrics::record_election_outcome(outcome.as_str(), rounds, started.elapsed());
            }
            Err(e) => {
                warn!(error = %e, rounds, "Election gave up");
                metrics::record_election_outcome("timeout", rounds, started.elapsed());
            }
        }
        Ok(())
    }
    .instrument(span)
    .await
}

async fn conduct(handle: &ReplicationHandle, reason: ElectionReason) -> Result<Outcome> {
    let conns = handle.connections()?;
    let config = &handle.config.election;
    let priority = handle.config.priority;

    if reason == ElectionReason::SeekMaster {
        let sent = conns.broadcast(&Message::MasterQuery).await;
        debug!(sites = sent, "Asking for the current master");
        if let Some(outcome) = wait_until(handle, Instant::now() + config.timeout(), |_| false).await {
            return Ok(outcome);
        }
    }

    let mut rounds = 0;
    loop {
        if !config.allows_round(rounds) {
            return Err(RepMgrError::ElectionTimeout { rounds });
        }
        rounds += 1;

        let (me, nsites, expected, deadline) = {
            let mut state = handle.state.lock().await;
            if handle.is_finished() {
                return Ok(Outcome::Shutdown);
            }
            if state.master.is_some() {
                return Ok(Outcome::FoundMaster);
            }
            let eid = state
                .sites
                .local_eid()
                .ok_or_else(|| RepMgrError::invalid("local site not set"))?;
            let deadline = Instant::now() + config.timeout();
            state.election.begin_round(rounds, deadline);
            let me = Candidate {
                eid,
                term: state.term,
                priority,
            };
            (me, state.sites.len() + 1, state.sites.len(), deadline)
        };

        // Sites that connect during the round get the request on connect,
        // so wait out the deadline unless every known site has answered
        debug!(round = rounds, nsites, expected, term = me.term, "Requesting votes");
        conns
            .broadcast(&Message::VoteRequest {
                term: me.term,
                priority,
            })
            .await;

        if let Some(outcome) = wait_until(handle, deadline, |state| {
            expected > 0 && state.election.votes.len() >= expected
        })
        .await
        {
            return Ok(outcome);
        }

        let decision = {
            let mut state = handle.state.lock().await;
            let votes = state.election.votes.len();
            if votes + 1 < quorum(nsites) {
                debug!(votes, needed = quorum(nsites), "No quorum of replies");
                None
            } else {
                state.election.phase = ElectionPhase::Voting;
                let winner = tally(state.election.votes.values().copied().chain(std::iter::once(me)));
                state.election.winner = winner;
                state.election.phase = ElectionPhase::Done;
                let highest = state.election.highest_term().max(state.term);
                winner.map(|w| (w, highest))
            }
        };

        match decision {
            Some((winner, highest)) if winner.eid == me.eid => {
                let term = highest + 1;
                info!(term, round = rounds, "Won election");
                handle.become_master(term).await?;
                return Ok(Outcome::Won);
            }
            Some((winner, _)) => {
                info!(winner = %winner.eid, round = rounds, "Waiting for election winner to announce itself");
                if let Some(outcome) = wait_until(handle, Instant::now() + config.timeout(), |_| false).await {
                    return Ok(outcome);
                }
            }
            None => {}
        }

        if config.allows_round(rounds) {
            let backoff = config.backoff_after(rounds);
            debug!(backoff_ms = backoff.as_millis() as u64, "Election round failed, backing off");
            if let Some(outcome) = wait_until(handle, Instant::now() + backoff, |_| false).await {
                return Ok(outcome);
            }
        }
    }
}

/// Sleep until `deadline`, `done` holds, a master is known, or shutdown.
///
/// Returns the outcome when the election is over, `None` to continue.
async fn wait_until<F>(handle: &ReplicationHandle, deadline: Instant, done: F) -> Option<Outcome>
where
    F: Fn(&crate::manager::RepState) -> bool,
{
    loop {
        let wakeup = handle.election_wakeup.notified();
        tokio::pin!(wakeup);
        wakeup.as_mut().enable();

        {
            let state = handle.state.lock().await;
            if handle.is_finished() {
                return Some(Outcome::Shutdown);
            }
            if state.master.is_some() {
                return Some(Outcome::FoundMaster);
            }
            if done(&state) {
                return None;
            }
        }

        if Instant::now() >= deadline {
            return None;
        }

        tokio::select! {
            _ = &mut wakeup => {}
            _ = tokio::time::sleep_until(deadline.into()) => {}
        }
    }
}

// =============================================================================
// Inbound election traffic (called from messengers)
// =============================================================================

/// A site asks for our vote.
pub(crate) async fn on_vote_request(handle: &Arc<ReplicationHandle>, from: Eid, term: u64, priority: u32) -> Result<()> {
    let local_priority = handle.config.priority;
    let (reply, join_election) = {
        let mut state = handle.state.lock().await;
        state.sites.set_priority(from, priority);
        if state.role == RepRole::Master {
            (
                Message::NewMaster {
                    term: state.term,
                    priority: local_priority,
                },
                false,
            )
        } else {
            let join = state.master.is_none() && !state.election.running;
            (
                Message::VoteReply {
                    term: state.term,
                    priority: local_priority,
                },
                join,
            )
        }
    };

    debug!(eid = %from, term, reply = %reply.kind(), "Vote requested");
    handle.connections()?.send(from, &reply).await?;

    if join_election {
        handle.init_election(ElectionReason::PeerRequest).await;
    }
    Ok(())
}

/// A site answered our vote request.
pub(crate) async fn on_vote_reply(handle: &ReplicationHandle, from: Eid, term: u64, priority: u32) {
    let counted = {
        let mut state = handle.state.lock().await;
        state.sites.set_priority(from, priority);
        state.election.record_vote(Candidate {
            eid: from,
            term,
            priority,
        })
    };
    if counted {
        debug!(eid = %from, term, priority, "Vote recorded");
        handle.election_wakeup.notify_waiters();
    } else {
        debug!(eid = %from, "Late vote reply ignored");
    }
}

/// What to do after a master claim was evaluated.
enum Claim {
    Ignore,
    Installed { changed: bool },
    StepDown,
    Reassert { term: u64 },
}

/// A site claims to be master (`NewMaster`, or a heartbeat from a site we
/// do not yet follow).
pub(crate) async fn on_master_claim(
    handle: &Arc<ReplicationHandle>,
    from: Eid,
    term: u64,
    priority: Option<u32>,
) -> Result<()> {
    let local_priority = handle.config.priority;
    let claim = {
        let mut state = handle.state.lock().await;
        if let Some(priority) = priority {
            state.sites.set_priority(from, priority);
        }
        let their_priority = priority
            .or_else(|| state.sites.get(from).and_then(|s| s.priority))
            .unwrap_or(0);

        if state.role == RepRole::Master {
            let mine = Candidate {
                eid: state.sites.local_eid().unwrap_or(SELF_EID),
                term: state.term,
                priority: local_priority,
            };
            let theirs = Candidate {
                eid: from,
                term,
                priority: their_priority,
            };
            if theirs.rank() > mine.rank() {
                state.role = RepRole::Client;
                state.master = Some(from);
                state.observe_term(term);
                state.last_master_contact = Some(Instant::now());
                Claim::StepDown
            } else {
                Claim::Reassert { term: state.term }
            }
        } else if state.master.is_none() || state.master == Some(from) || term > state.term {
            let changed = state.master != Some(from);
            state.master = Some(from);
            state.observe_term(term);
            state.last_master_contact = Some(Instant::now());
            Claim::Installed { changed }
        } else {
            Claim::Ignore
        }
    };
    handle.election_wakeup.notify_waiters();

    match claim {
        Claim::Ignore => {
            debug!(eid = %from, term, "Stale master claim ignored");
        }
        Claim::Installed { changed } => {
            if changed {
                info!(master = %from, term, "New master installed");
                handle.apply.master_changed(from);
            }
        }
        Claim::StepDown => {
            warn!(master = %from, term, "Another site outranks this master, stepping down");
            metrics::set_role(RepRole::Client.as_str());
            handle.apply.master_changed(from);
            if let Some(local) = handle.local_addr().await {
                handle.apply.rep_start(&local, RepRole::Client).await?;
            }
        }
        Claim::Reassert { term } => {
            debug!(eid = %from, "Rejecting weaker master claim");
            handle
                .connections()?
                .send(
                    from,
                    &Message::NewMaster {
                        term,
                        priority: local_priority,
                    },
                )
                .await?;
        }
    }
    Ok(())
}

/// A site asks who the master is. Only the master answers.
pub(crate) async fn on_master_query(handle: &ReplicationHandle, from: Eid) -> Result<()> {
    let announce = {
        let state = handle.state.lock().await;
        (state.role == RepRole::Master).then_some(state.term)
    };
    if let Some(term) = announce {
        handle
            .connections()?
            .send(
                from,
                &Message::NewMaster {
                    term,
                    priority: handle.config.priority,
                },
            )
            .await?;
    }
    Ok(())
}
