//! Messenger tasks.
//!
//! A pool of `nthreads` identical workers. Each pops the next message from
//! the [`MessageQueue`](crate::queue::MessageQueue), dispatches it, and
//! releases the sending site so its next message can be handed out.
//!
//! # Dispatch
//!
//! | Message | Handler |
//! |---------|---------|
//! | `Log` | apply collaborator, then `Ack` back when requested |
//! | `Ack` | ack tracker (wakes `send_log` waiters) |
//! | `VoteRequest` / `VoteReply` | Election Manager |
//! | `NewMaster` / `MasterQuery` | Election Manager |
//! | `Heartbeat` | master liveness |
//!
//! A failed handler is logged and the messenger moves on; only shutdown
//! ends the loop.

use crate::election;
use crate::error::Result;
use crate::manager::ReplicationHandle;
use crate::queue::Inbound;
use crate::site::Eid;
use crate::wire::Message;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Messenger task body. Returns when `finished` is set.
pub(crate) async fn run_messenger(handle: Arc<ReplicationHandle>, id: usize) -> Result<()> {
    let span = info_span!("messenger", id);
    async move {
        debug!("Messenger started");
        let mut processed: u64 = 0;

        while let Some(Inbound { eid, msg }) = handle.queue.pop(&handle.finished).await {
            let kind = msg.kind();
            if let Err(e) = dispatch(&handle, eid, msg).await {
                if handle.is_finished() {
                    debug!(eid = %eid, kind = %kind, error = %e, "Handler interrupted by shutdown");
                } else {
                    warn!(eid = %eid, kind = %kind, error = %e, "Message handler failed");
                }
            }
            handle.queue.done(eid).await;
            processed += 1;
        }

        info!(processed, "Messenger stopped");
        Ok(())
    }
    .instrument(span)
    .await
}

async fn dispatch(handle: &Arc<ReplicationHandle>, from: Eid, msg: Message) -> Result<()> {
    touch_master(handle, from).await;

    match msg {
        Message::Log {
            lsn,
            needs_ack,
            payload,
        } => on_log(handle, from, lsn, needs_ack, payload).await,
        Message::Ack { lsn } => {
            let tracked = handle.state.lock().await.acks.record_ack(lsn, from);
            if !tracked {
                debug!(eid = %from, lsn, "Ack for unknown LSN");
            }
            Ok(())
        }
        Message::VoteRequest { term, priority } => election::on_vote_request(handle, from, term, priority).await,
        Message::VoteReply { term, priority } => {
            election::on_vote_reply(handle, from, term, priority).await;
            Ok(())
        }
        Message::NewMaster { term, priority } => election::on_master_claim(handle, from, term, Some(priority)).await,
        Message::MasterQuery => election::on_master_query(handle, from).await,
        Message::Heartbeat { term } => {
            let from_master = handle.state.lock().await.master == Some(from);
            if from_master {
                Ok(())
            } else {
                election::on_master_claim(handle, from, term, None).await
            }
        }
        // Consumed by the Selector; a repeat on an attached stream is harmless
        Message::Handshake { .. } => Ok(()),
    }
}

/// Any traffic from the current master proves it is alive.
async fn touch_master(handle: &ReplicationHandle, from: Eid) {
    let mut state = handle.state.lock().await;
    if state.master == Some(from) {
        state.last_master_contact = Some(Instant::now());
    }
}

async fn on_log(handle: &ReplicationHandle, from: Eid, lsn: u64, needs_ack: bool, payload: Bytes) -> Result<()> {
    let len = payload.len();
    handle.apply.process_log(from, lsn, payload).await?;
    debug!(eid = %from, lsn, len, "Log record applied");

    if needs_ack {
        handle.connections()?.send(from, &Message::Ack { lsn }).await?;
    }
    Ok(())
}
