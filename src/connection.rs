//! Connection Manager.
//!
//! Keeps at most one live stream per site, with reconnection.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting ──► Ready ──► Dead
//!     │                     ▲
//!     └─────────────────────┘   (dial/handshake failure)
//!
//! Dead ──► retry scheduled (backoff) ──► Connecting
//! ```
//!
//! Each [`Connection`] owns a bounded output buffer drained by one writer
//! task. Outbound connections dial, send a handshake and hand their read
//! half to the Selector. Inbound streams are accepted by the Selector and
//! adopted here once their handshake names the site.
//!
//! # Blocked Senders
//!
//! A sender facing a full buffer waits on the connection's `drained`
//! notification. Teardown and shutdown both notify it, so no sender is
//! left waiting on a connection that will never drain.
//!
//! # Duplicate Streams
//!
//! When two sites dial each other at the same time, both sides keep the
//! stream initiated by the site with the smaller address.

use crate::apply::{Transport, TransportFuture};
use crate::config::ConnectionConfig;
use crate::error::{RepMgrError, Result};
use crate::manager::supervisor::Runnable;
use crate::metrics;
use crate::resilience::Backoff;
use crate::site::{self, Eid, SiteAddr};
use crate::wire::Message;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Dial in progress.
    Connecting,
    /// Handshake sent, frames flowing.
    Ready,
    /// Torn down. Never leaves this state.
    Dead,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Ready,
            _ => ConnState::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnState::Connecting => 0,
            ConnState::Ready => 1,
            ConnState::Dead => 2,
        }
    }
}

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Outbound,
    Inbound,
}

/// Notification from connection tasks to the Selector.
#[derive(Debug)]
pub enum SelectorEvent {
    /// An outbound stream finished its handshake; start reading it.
    Attached {
        eid: Eid,
        conn_id: u64,
        reader: OwnedReadHalf,
    },
    /// A connection's writer task ended.
    Closed {
        eid: Eid,
        conn_id: u64,
        reason: &'static str,
    },
}

/// One stream to a site.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    eid: Eid,
    origin: Origin,
    state: AtomicU8,
    outbox: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    drained: Notify,
    blocked: AtomicUsize,
}

impl Connection {
    pub(crate) fn new(id: u64, eid: Eid, origin: Origin, buffer: usize) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbox, rx) = mpsc::channel(buffer.max(1));
        let conn = Arc::new(Self {
            id,
            eid,
            origin,
            state: AtomicU8::new(ConnState::Connecting.as_u8()),
            outbox,
            cancel: CancellationToken::new(),
            drained: Notify::new(),
            blocked: AtomicUsize::new(0),
        });
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn eid(&self) -> Eid {
        self.eid
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    /// Senders currently waiting for buffer space.
    pub fn blocked_senders(&self) -> usize {
        self.blocked.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnState) {
        // Dead is terminal
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (ConnState::from_u8(current) != ConnState::Dead).then_some(state.as_u8())
            });
    }

    /// Queue a frame, waiting while the buffer is full.
    ///
    /// Fails with `Shutdown` once `finished` is set and with `Io` once the
    /// connection is torn down, even if the caller was already waiting.
    pub async fn enqueue(&self, mut frame: Bytes, finished: &watch::Receiver<bool>) -> Result<()> {
        let mut waited = false;
        let result = loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if *finished.borrow() {
                break Err(RepMgrError::Shutdown);
            }
            if self.state() == ConnState::Dead {
                break Err(RepMgrError::io(self.eid, "connection closed"));
            }

            match self.outbox.try_send(frame) {
                Ok(()) => break Ok(()),
                Err(TrySendError::Closed(_)) => break Err(RepMgrError::io(self.eid, "connection closed")),
                Err(TrySendError::Full(back)) => frame = back,
            }

            if !waited {
                waited = true;
                self.blocked.fetch_add(1, Ordering::AcqRel);
                debug!(eid = %self.eid, "Send buffer full, waiting");
            }

            tokio::select! {
                permit = self.outbox.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(frame);
                        break Ok(());
                    }
                    Err(_) => break Err(RepMgrError::io(self.eid, "connection closed")),
                },
                _ = &mut drained => {}
            }
        };

        if waited {
            self.blocked.fetch_sub(1, Ordering::AcqRel);
        }
        result
    }

    /// Queue a frame only if there is room.
    pub fn try_enqueue(&self, frame: Bytes) -> bool {
        self.state() != ConnState::Dead && self.outbox.try_send(frame).is_ok()
    }

    /// Tear down: mark dead, stop the writer, release blocked senders.
    pub fn close(&self) {
        self.set_state(ConnState::Dead);
        self.cancel.cancel();
        self.drained.notify_waiters();
    }
}

#[derive(Debug)]
struct RetryState {
    backoff: Backoff,
    due: Option<Instant>,
}

/// What a writer task needs besides its connection.
#[derive(Clone)]
struct LinkContext {
    handshake: Bytes,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<SelectorEvent>,
}

/// Owner of every site connection.
pub struct ConnectionManager {
    local: SiteAddr,
    config: ConnectionConfig,
    link: LinkContext,
    connections: DashMap<Eid, Arc<Connection>>,
    addresses: DashMap<Eid, SiteAddr>,
    retries: DashMap<Eid, RetryState>,
    finished: watch::Receiver<bool>,
    selector_wakeup: Arc<Notify>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<Runnable>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create the manager and the event channel its tasks report on.
    pub fn new(
        local: SiteAddr,
        priority: u32,
        config: ConnectionConfig,
        finished: watch::Receiver<bool>,
        selector_wakeup: Arc<Notify>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SelectorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let handshake = Message::Handshake {
            host: local.host().to_string(),
            port: local.port(),
            priority,
        }
        .to_frame();
        let link = LinkContext {
            handshake,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            events,
        };
        let manager = Arc::new(Self {
            local,
            config,
            link,
            connections: DashMap::new(),
            addresses: DashMap::new(),
            retries: DashMap::new(),
            finished,
            selector_wakeup,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        });
        (manager, events_rx)
    }

    /// Fresh connection id (also used for pending inbound streams).
    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Remember where a site listens.
    pub fn register_site(&self, eid: Eid, addr: SiteAddr) {
        self.addresses.insert(eid, addr);
    }

    pub fn get(&self, eid: Eid) -> Option<Arc<Connection>> {
        self.connections.get(&eid).map(|c| c.value().clone())
    }

    pub fn is_current(&self, eid: Eid, conn_id: u64) -> bool {
        self.connections.get(&eid).is_some_and(|c| c.id == conn_id)
    }

    /// Get the site's connection, dialing one if none exists.
    pub async fn connect(&self, eid: Eid) -> Option<Arc<Connection>> {
        if self.is_finished() {
            return None;
        }
        if let Some(existing) = self.get(eid) {
            return Some(existing);
        }
        let Some(addr) = self.addresses.get(&eid).map(|a| a.value().clone()) else {
            warn!(eid = %eid, "No address for site, cannot connect");
            return None;
        };

        let (conn, rx) = Connection::new(self.next_conn_id(), eid, Origin::Outbound, self.config.send_buffer_frames);
        match self.connections.entry(eid) {
            dashmap::mapref::entry::Entry::Occupied(e) => return Some(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(conn.clone());
            }
        }

        debug!(eid = %eid, addr = %addr, conn_id = conn.id, "Connecting to site");
        let link = self.link.clone();
        let task = Runnable::spawn(
            format!("conn-{}-{}", eid, conn.id),
            run_outbound(conn.clone(), rx, addr, link),
        );
        if !self.track(&conn, task).await {
            return None;
        }
        Some(conn)
    }

    /// Take over an accepted stream whose handshake named `eid`.
    ///
    /// Returns the new connection id, or `None` if an existing stream wins
    /// the duplicate check (the caller then drops the accepted stream).
    pub async fn adopt(&self, eid: Eid, writer: OwnedWriteHalf) -> Option<u64> {
        if self.is_finished() {
            return None;
        }

        if let Some(existing) = self.get(eid) {
            let keep_existing = existing.state() != ConnState::Dead
                && existing.origin == Origin::Outbound
                && self
                    .addresses
                    .get(&eid)
                    .is_some_and(|remote| self.local < *remote.value());
            if keep_existing {
                debug!(eid = %eid, "Keeping our outbound stream, rejecting inbound duplicate");
                return None;
            }
            if self.connections.remove_if(&eid, |_, c| c.id == existing.id).is_some() {
                debug!(eid = %eid, old = existing.id, "Replacing stream with inbound");
                existing.close();
            }
        }

        let (conn, rx) = Connection::new(self.next_conn_id(), eid, Origin::Inbound, self.config.send_buffer_frames);
        conn.set_state(ConnState::Ready);
        let conn_id = conn.id;
        self.connections.insert(eid, conn.clone());
        self.mark_connected(eid);

        let link = self.link.clone();
        let task = Runnable::spawn(
            format!("conn-{}-{}", eid, conn_id),
            run_adopted(conn.clone(), rx, writer, link),
        );
        if !self.track(&conn, task).await {
            return None;
        }
        Some(conn_id)
    }

    /// Keep a connection task for joining at stop.
    ///
    /// Returns `false` if stop already began: the connection is closed and
    /// its task joined here, since `take_tasks` may have run already.
    async fn track(&self, conn: &Arc<Connection>, task: Runnable) -> bool {
        let mut tasks = self.tasks.lock().await;
        if self.is_finished() {
            drop(tasks);
            debug!(eid = %conn.eid, conn_id = conn.id, "Stopped while connecting, closing stream");
            conn.close();
            self.connections.remove_if(&conn.eid, |_, c| c.id == conn.id);
            if let Err(e) = task.join().await {
                warn!(eid = %conn.eid, error = %e, "Connection task failed");
            }
            return false;
        }
        let (done, running): (Vec<_>, Vec<_>) = tasks.drain(..).partition(|t| t.is_finished());
        *tasks = running;
        tasks.push(task);
        for finished in done {
            let name = finished.name().to_string();
            if let Err(e) = finished.join().await {
                warn!(task = %name, error = %e, "Connection task failed");
            }
        }
        true
    }

    /// Send one message to a site.
    pub async fn send(&self, eid: Eid, msg: &Message) -> Result<()> {
        let conn = match self.connect(eid).await {
            Some(conn) => conn,
            None if self.is_finished() => return Err(RepMgrError::Shutdown),
            None => return Err(RepMgrError::io(eid, "no address for site")),
        };
        conn.enqueue(msg.to_frame(), &self.finished).await?;
        metrics::record_message_sent(msg.kind().as_str(), 1);
        Ok(())
    }

    /// Send without waiting. Returns `false` if the site has no ready
    /// connection or its buffer is full.
    pub fn try_send(&self, eid: Eid, msg: &Message) -> bool {
        let sent = self
            .get(eid)
            .is_some_and(|conn| conn.is_ready() && conn.try_enqueue(msg.to_frame()));
        if sent {
            metrics::record_message_sent(msg.kind().as_str(), 1);
        }
        sent
    }

    fn ready_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| c.is_ready())
            .map(|c| c.value().clone())
            .collect()
    }

    /// Send to every ready connection, waiting on full buffers.
    pub async fn broadcast(&self, msg: &Message) -> usize {
        let frame = msg.to_frame();
        let mut sent = 0;
        for conn in self.ready_connections() {
            match conn.enqueue(frame.clone(), &self.finished).await {
                Ok(()) => sent += 1,
                Err(RepMgrError::Shutdown) => break,
                Err(e) => debug!(eid = %conn.eid, error = %e, "Broadcast skipped site"),
            }
        }
        metrics::record_message_sent(msg.kind().as_str(), sent);
        sent
    }

    /// Broadcast without waiting; sites with full buffers are skipped.
    pub fn try_broadcast(&self, msg: &Message) -> usize {
        let frame = msg.to_frame();
        let sent = self
            .ready_connections()
            .into_iter()
            .filter(|conn| conn.try_enqueue(frame.clone()))
            .count();
        metrics::record_message_sent(msg.kind().as_str(), sent);
        sent
    }

    /// Tear down the site's connection. It is reported lost through the
    /// Selector and redialed after the retry wait.
    pub fn close(&self, eid: Eid) {
        if let Some(conn) = self.get(eid) {
            info!(eid = %eid, conn_id = conn.id, "Closing connection");
            conn.close();
        }
    }

    /// Remove a connection if it is still the current one for its site.
    ///
    /// Returns `true` exactly once per connection; the caller then reports
    /// the site as lost.
    pub fn retire(&self, eid: Eid, conn_id: u64, reason: &'static str) -> bool {
        match self.connections.remove_if(&eid, |_, c| c.id == conn_id) {
            Some((_, conn)) => {
                conn.close();
                metrics::record_disconnect(eid.0, reason);
                warn!(eid = %eid, conn_id, reason, "Connection lost");
                self.schedule_retry(eid);
                true
            }
            None => false,
        }
    }

    /// Record a successful handshake: resets the site's backoff.
    pub fn mark_connected(&self, eid: Eid) {
        if let Some(mut retry) = self.retries.get_mut(&eid) {
            retry.backoff.reset();
            retry.due = None;
        }
        metrics::record_connection(eid.0, true);
    }

    fn schedule_retry(&self, eid: Eid) {
        if self.is_finished() || !self.addresses.contains_key(&eid) {
            return;
        }
        let mut retry = self.retries.entry(eid).or_insert_with(|| RetryState {
            backoff: Backoff::new(self.config.retry_schedule()),
            due: None,
        });
        let delay = retry.backoff.next_delay();
        debug!(eid = %eid, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        retry.due = Some(Instant::now() + delay);
        drop(retry);
        self.selector_wakeup.notify_waiters();
    }

    /// Earliest scheduled reconnect.
    pub fn next_retry(&self) -> Option<Instant> {
        self.retries.iter().filter_map(|r| r.due).min()
    }

    /// Dial every site whose reconnect is due.
    pub async fn retry_due(&self) {
        let now = Instant::now();
        let due: Vec<Eid> = self
            .retries
            .iter_mut()
            .filter_map(|mut r| match r.due {
                Some(at) if at <= now => {
                    r.due = None;
                    Some(*r.key())
                }
                _ => None,
            })
            .collect();

        for eid in due {
            if !self.connections.contains_key(&eid) {
                info!(eid = %eid, "Reconnecting to site");
                self.connect(eid).await;
            }
        }
    }

    /// Senders waiting on full buffers, across all connections.
    pub fn blocked_senders(&self) -> usize {
        self.connections.iter().map(|c| c.blocked_senders()).sum()
    }

    /// Close every connection (stop path).
    pub fn shutdown(&self) {
        for conn in self.connections.iter() {
            conn.close();
        }
    }

    /// Hand over the connection tasks for joining.
    pub(crate) async fn take_tasks(&self) -> Vec<Runnable> {
        std::mem::take(&mut *self.tasks.lock().await)
    }
}

impl Transport for ConnectionManager {
    fn send(&self, eid: Eid, msg: Message) -> TransportFuture<'_, ()> {
        Box::pin(async move { ConnectionManager::send(self, eid, &msg).await })
    }

    fn broadcast(&self, msg: Message) -> TransportFuture<'_, usize> {
        Box::pin(async move { Ok(ConnectionManager::broadcast(self, &msg).await) })
    }
}

async fn dial(eid: Eid, addr: &SiteAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let targets = site::resolve(addr).await?;
    let mut last_error = String::from("no addresses");
    for target in targets {
        match timeout(connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(eid = %eid, error = %e, "Could not set TCP_NODELAY");
                }
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = format!("{}: {}", target, e),
            Err(_) => {
                last_error = format!("{}: timed out after {}ms", target, connect_timeout.as_millis())
            }
        }
    }
    Err(RepMgrError::io(eid, last_error))
}

async fn run_outbound(
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Bytes>,
    addr: SiteAddr,
    link: LinkContext,
) -> Result<()> {
    let dialed = tokio::select! {
        _ = conn.cancel.cancelled() => None,
        result = dial(conn.eid, &addr, link.connect_timeout) => match result {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(eid = %conn.eid, addr = %addr, error = %e, "Connect failed");
                metrics::record_connection(conn.eid.0, false);
                None
            }
        },
    };

    let reason = match dialed {
        None if conn.cancel.is_cancelled() => "closed",
        None => "connect_failed",
        Some(stream) => {
            let (reader, mut writer) = stream.into_split();
            match writer.write_all(&link.handshake).await {
                Err(e) => {
                    warn!(eid = %conn.eid, error = %e, "Handshake failed");
                    "handshake_failed"
                }
                Ok(()) => {
                    conn.set_state(ConnState::Ready);
                    info!(eid = %conn.eid, addr = %addr, conn_id = conn.id, "Connected to site");
                    let attached = SelectorEvent::Attached {
                        eid: conn.eid,
                        conn_id: conn.id,
                        reader,
                    };
                    if link.events.send(attached).is_err() {
                        "selector_gone"
                    } else {
                        write_loop(&conn, &mut rx, &mut writer).await
                    }
                }
            }
        }
    };

    finish(&conn, reason, &link);
    Ok(())
}

async fn run_adopted(
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: OwnedWriteHalf,
    link: LinkContext,
) -> Result<()> {
    info!(eid = %conn.eid, conn_id = conn.id, "Accepted connection from site");
    let reason = match writer.write_all(&link.handshake).await {
        Ok(()) => write_loop(&conn, &mut rx, &mut writer).await,
        Err(e) => {
            warn!(eid = %conn.eid, error = %e, "Handshake reply failed");
            "handshake_failed"
        }
    };
    finish(&conn, reason, &link);
    Ok(())
}

async fn write_loop(conn: &Connection, rx: &mut mpsc::Receiver<Bytes>, writer: &mut OwnedWriteHalf) -> &'static str {
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return "closed",
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return "closed",
            },
        };

        let written = tokio::select! {
            _ = conn.cancel.cancelled() => return "closed",
            result = writer.write_all(&frame) => result,
        };
        if let Err(e) = written {
            warn!(eid = %conn.eid, error = %e, "Write failed");
            return "write_error";
        }
    }
}

fn finish(conn: &Connection, reason: &'static str, link: &LinkContext) {
    conn.set_state(ConnState::Dead);
    conn.drained.notify_waiters();
    debug!(eid = %conn.eid, conn_id = conn.id, reason, "Connection task exiting");
    // The Selector may already be gone during shutdown
    let _ = link.events.send(SelectorEvent::Closed {
        eid: conn.eid,
        conn_id: conn.id,
        reason,
    });
}
