//! Selector task.
//!
//! The single task that multiplexes all inbound I/O:
//!
//! - accepts connections on the local listener
//! - reads framed messages from every attached stream
//! - runs the Connection Manager's reconnect timers
//! - drives heartbeat send and monitoring
//!
//! Complete messages are appended to the Message Queue; the Selector never
//! processes them itself.
//!
//! # Inbound Handshake
//!
//! An accepted stream is *pending* until its first frame, which must be a
//! `Handshake` naming the sender's listening address. That address is
//! registered (unknown sites are added as non-peers) and the stream is
//! adopted by the Connection Manager. Anything else first, or silence for
//! longer than the connect timeout, drops the stream.
//!
//! # Teardown
//!
//! Read errors, EOF and writer exits (reported as [`SelectorEvent::Closed`])
//! all funnel into one place that retires the connection exactly once and
//! tells the manager the site was lost.

use crate::connection::{ConnectionManager, SelectorEvent};
use crate::error::Result;
use crate::manager::ReplicationHandle;
use crate::metrics;
use crate::queue::Inbound;
use crate::site::Eid;
use crate::wire::{FrameCodec, FrameError, Message};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, info_span, warn, Instrument};

type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, FrameError>> + Send>>;

/// Key of a stream in the read set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum StreamKey {
    /// Accepted, handshake not yet seen.
    Pending(u64),
    /// Attached to a site's connection.
    Site(Eid, u64),
}

/// What woke the Selector.
enum Wake {
    Tick,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Event(SelectorEvent),
    Frame(StreamKey, std::result::Result<Message, FrameError>),
}

/// Wrap a read half. The stream always ends with `Err(Closed)` so EOF is
/// seen as a teardown.
fn frame_stream(reader: OwnedReadHalf, max_frame_len: usize) -> FrameStream {
    Box::pin(
        FramedRead::new(reader, FrameCodec::new(max_frame_len))
            .chain(tokio_stream::once(Err(FrameError::Closed))),
    )
}

fn close_reason(err: &FrameError) -> &'static str {
    match err {
        FrameError::Closed => "eof",
        FrameError::Io(_) => "read_error",
        _ => "protocol_error",
    }
}

pub(crate) struct Selector {
    handle: Arc<ReplicationHandle>,
    conns: Arc<ConnectionManager>,
    listener: TcpListener,
    events: mpsc::UnboundedReceiver<SelectorEvent>,
    streams: StreamMap<StreamKey, FrameStream>,
    pending: HashMap<u64, (OwnedWriteHalf, Instant)>,
    /// Current connection id per attached site.
    active: HashMap<Eid, u64>,
    max_frame_len: usize,
    handshake_timeout: Duration,
}

impl Selector {
    pub(crate) fn new(
        handle: Arc<ReplicationHandle>,
        conns: Arc<ConnectionManager>,
        listener: TcpListener,
        events: mpsc::UnboundedReceiver<SelectorEvent>,
    ) -> Self {
        let max_frame_len = handle.config.connection.max_frame_len;
        let handshake_timeout = Duration::from_millis(handle.config.connection.connect_timeout_ms);
        Self {
            handle,
            conns,
            listener,
            events,
            streams: StreamMap::new(),
            pending: HashMap::new(),
            active: HashMap::new(),
            max_frame_len,
            handshake_timeout,
        }
    }

    /// Selector task body. Returns when `finished` is set.
    pub(crate) async fn run(mut self) -> Result<()> {
        let span = info_span!("selector");
        async move {
            info!(
                addr = ?self.listener.local_addr().ok(),
                "Selector started"
            );

            loop {
                let wakeup_src = self.handle.selector_wakeup.clone();
                let wakeup = wakeup_src.notified();
                tokio::pin!(wakeup);
                wakeup.as_mut().enable();

                if self.handle.is_finished() {
                    break;
                }

                self.conns.retry_due().await;
                let next_tick = self.handle.on_tick(&self.conns).await;
                let deadline = self.expire_pending().map_or(next_tick, |t| t.min(next_tick));

                let has_streams = !self.streams.is_empty();
                let wake = tokio::select! {
                    _ = &mut wakeup => Wake::Tick,
                    accepted = self.listener.accept() => Wake::Accepted(accepted),
                    Some(event) = self.events.recv() => Wake::Event(event),
                    Some((key, item)) = self.streams.next(), if has_streams => Wake::Frame(key, item),
                    _ = tokio::time::sleep_until(deadline.into()) => Wake::Tick,
                };

                match wake {
                    Wake::Tick => {}
                    Wake::Accepted(accepted) => self.on_accept(accepted),
                    Wake::Event(event) => self.on_event(event).await,
                    Wake::Frame(key, item) => self.on_frame(key, item).await,
                }
            }

            info!(
                streams = self.streams.len(),
                pending = self.pending.len(),
                "Selector stopped"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(remote = %remote, error = %e, "Could not set TCP_NODELAY");
                }
                let (reader, writer) = stream.into_split();
                let id = self.conns.next_conn_id();
                debug!(remote = %remote, pending_id = id, "Accepted stream, awaiting handshake");
                self.pending.insert(id, (writer, Instant::now()));
                self.streams
                    .insert(StreamKey::Pending(id), frame_stream(reader, self.max_frame_len));
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    /// Drop pending streams past the handshake timeout. Returns the next
    /// expiry.
    fn expire_pending(&mut self) -> Option<Instant> {
        let now = Instant::now();
        let timeout = self.handshake_timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, (_, accepted))| *accepted + timeout <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(pending_id = id, "No handshake in time, dropping stream");
            self.pending.remove(&id);
            self.streams.remove(&StreamKey::Pending(id));
        }
        self.pending.values().map(|(_, accepted)| *accepted + timeout).min()
    }

    async fn on_event(&mut self, event: SelectorEvent) {
        match event {
            SelectorEvent::Attached { eid, conn_id, reader } => {
                if !self.conns.is_current(eid, conn_id) {
                    debug!(eid = %eid, conn_id, "Stale attach ignored");
                    return;
                }
                self.conns.mark_connected(eid);
                let stream = frame_stream(reader, self.max_frame_len);
                self.attach(eid, conn_id, stream);
                self.handle.connection_up(eid).await;
            }
            SelectorEvent::Closed { eid, conn_id, reason } => {
                self.streams.remove(&StreamKey::Site(eid, conn_id));
                self.lose(eid, conn_id, reason).await;
            }
        }
    }

    async fn on_frame(&mut self, key: StreamKey, item: std::result::Result<Message, FrameError>) {
        match key {
            StreamKey::Pending(id) => self.on_pending_frame(id, item).await,
            StreamKey::Site(eid, conn_id) => match item {
                Ok(Message::Handshake { priority, .. }) => {
                    self.handle.record_priority(eid, priority).await;
                }
                Ok(msg) => {
                    let kind = msg.kind();
                    metrics::record_message_received(kind.as_str());
                    if !self.handle.queue.push(Inbound { eid, msg }).await {
                        warn!(eid = %eid, kind = %kind, "Message queue full, dropping message");
                        metrics::record_message_dropped(kind.as_str());
                    }
                }
                Err(e) => {
                    let reason = close_reason(&e);
                    if !matches!(e, FrameError::Closed) {
                        warn!(eid = %eid, conn_id, error = %e, "Read failed");
                    }
                    self.streams.remove(&key);
                    self.lose(eid, conn_id, reason).await;
                }
            },
        }
    }

    async fn on_pending_frame(&mut self, id: u64, item: std::result::Result<Message, FrameError>) {
        let key = StreamKey::Pending(id);
        let stream = self.streams.remove(&key);
        let writer = self.pending.remove(&id).map(|(writer, _)| writer);

        let (host, port, priority) = match item {
            Ok(Message::Handshake { host, port, priority }) => (host, port, priority),
            Ok(other) => {
                warn!(pending_id = id, kind = %other.kind(), "Data before handshake, dropping stream");
                return;
            }
            Err(e) => {
                debug!(pending_id = id, error = %e, "Stream closed before handshake");
                return;
            }
        };
        let (Some(stream), Some(writer)) = (stream, writer) else {
            return;
        };

        let eid = match self.handle.register_inbound(&host, port, priority).await {
            Ok(eid) => eid,
            Err(e) => {
                warn!(host = %host, port, error = %e, "Rejecting handshake");
                return;
            }
        };

        match self.conns.adopt(eid, writer).await {
            Some(conn_id) => {
                self.attach(eid, conn_id, stream);
                self.handle.connection_up(eid).await;
            }
            None => debug!(eid = %eid, "Inbound duplicate dropped"),
        }
    }

    fn attach(&mut self, eid: Eid, conn_id: u64, stream: FrameStream) {
        if let Some(old) = self.active.insert(eid, conn_id) {
            if old != conn_id {
                self.streams.remove(&StreamKey::Site(eid, old));
            }
        }
        self.streams.insert(StreamKey::Site(eid, conn_id), stream);
    }

    async fn lose(&mut self, eid: Eid, conn_id: u64, reason: &'static str) {
        if self.active.get(&eid) == Some(&conn_id) {
            self.active.remove(&eid);
        }
        if self.conns.retire(eid, conn_id, reason) {
            self.handle.connection_lost(eid).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reasons() {
        assert_eq!(close_reason(&FrameError::Closed), "eof");
        assert_eq!(
            close_reason(&FrameError::Io(io::Error::from(io::ErrorKind::ConnectionReset))),
            "read_error"
        );
        assert_eq!(close_reason(&FrameError::UnknownKind(99)), "protocol_error");
    }

    #[tokio::test]
    async fn test_frame_stream_ends_with_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&Message::Ack { lsn: 9 }.to_frame()).await.unwrap();
        });

        let (server, _) = listener.accept().await.unwrap();
        client.await.unwrap();
        let (reader, _writer) = server.into_split();
        let mut frames = frame_stream(reader, 1024);

        assert_eq!(frames.next().await.unwrap().unwrap(), Message::Ack { lsn: 9 });
        assert!(matches!(frames.next().await, Some(Err(FrameError::Closed))));
        assert!(frames.next().await.is_none());
    }
}
