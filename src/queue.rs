//! Bounded inbound Message Queue.
//!
//! The Selector pushes every complete inbound message here; messengers pop
//! them. Two rules keep per-site order intact with several messengers:
//!
//! - Messages are appended in arrival order (one producer per stream).
//! - A site's next message is not handed out while a messenger is still
//!   working on that site's previous one.
//!
//! Messages from different sites may be processed concurrently and in any
//! relative order.
//!
//! The queue never blocks the producer: a push onto a full queue drops the
//! message and reports it.

use crate::metrics;
use crate::site::Eid;
use crate::wire::Message;
use std::collections::{HashSet, VecDeque};
use tokio::sync::{watch, Mutex, Notify};

/// A message and the site it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub eid: Eid,
    pub msg: Message,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<Inbound>,
    /// Sites with a message currently being processed.
    busy: HashSet<Eid>,
}

/// Bounded FIFO with per-site exclusive dequeue.
#[derive(Debug)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    not_empty: Notify,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            not_empty: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a message. Returns `false` (and drops it) if the queue is full.
    pub async fn push(&self, item: Inbound) -> bool {
        let depth = {
            let mut inner = self.inner.lock().await;
            if inner.items.len() >= self.capacity {
                return false;
            }
            inner.items.push_back(item);
            inner.items.len()
        };
        metrics::set_queue_depth(depth);
        self.not_empty.notify_waiters();
        true
    }

    /// Wait for the next message whose site is not already in flight.
    ///
    /// Returns `None` once `finished` is set. The caller must call
    /// [`done`](Self::done) with the message's EID after processing it.
    pub async fn pop(&self, finished: &watch::Receiver<bool>) -> Option<Inbound> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *finished.borrow() {
                return None;
            }

            {
                let mut guard = self.inner.lock().await;
                let inner = &mut *guard;
                let next = inner
                    .items
                    .iter()
                    .position(|item| !inner.busy.contains(&item.eid));
                if let Some(item) = next.and_then(|pos| inner.items.remove(pos)) {
                    inner.busy.insert(item.eid);
                    metrics::set_queue_depth(inner.items.len());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Release a site after its message was processed.
    pub async fn done(&self, eid: Eid) {
        let released = self.inner.lock().await.busy.remove(&eid);
        if released {
            self.not_empty.notify_waiters();
        }
    }

    /// Wake every waiting messenger so it re-checks `finished`.
    pub fn wake_all(&self) {
        self.not_empty.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ack(eid: u32, lsn: u64) -> Inbound {
        Inbound {
            eid: Eid(eid),
            msg: Message::Ack { lsn },
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MessageQueue::new(8);
        let (_tx, finished) = watch::channel(false);

        queue.push(ack(1, 1)).await;
        queue.push(ack(2, 2)).await;

        assert_eq!(queue.pop(&finished).await, Some(ack(1, 1)));
        queue.done(Eid(1)).await;
        assert_eq!(queue.pop(&finished).await, Some(ack(2, 2)));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let queue = MessageQueue::new(2);
        assert!(queue.push(ack(1, 1)).await);
        assert!(queue.push(ack(1, 2)).await);
        assert!(!queue.push(ack(1, 3)).await);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_site_in_flight_is_skipped() {
        let queue = MessageQueue::new(8);
        let (_tx, finished) = watch::channel(false);

        queue.push(ack(1, 1)).await;
        queue.push(ack(1, 2)).await;
        queue.push(ack(2, 3)).await;

        assert_eq!(queue.pop(&finished).await, Some(ack(1, 1)));
        // Site 1 still in flight: site 2's message comes next
        assert_eq!(queue.pop(&finished).await, Some(ack(2, 3)));

        queue.done(Eid(1)).await;
        assert_eq!(queue.pop(&finished).await, Some(ack(1, 2)));
    }

    #[tokio::test]
    async fn test_done_wakes_waiter_for_same_site() {
        let queue = Arc::new(MessageQueue::new(8));
        let (_tx, finished) = watch::channel(false);

        queue.push(ack(1, 1)).await;
        queue.push(ack(1, 2)).await;
        assert_eq!(queue.pop(&finished).await, Some(ack(1, 1)));

        let waiter = {
            let queue = queue.clone();
            let finished = finished.clone();
            tokio::spawn(async move { queue.pop(&finished).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.done(Eid(1)).await;
        let next = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, Some(ack(1, 2)));
    }

    #[tokio::test]
    async fn test_finished_releases_waiters() {
        let queue = Arc::new(MessageQueue::new(8));
        let (tx, finished) = watch::channel(false);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let finished = finished.clone();
                tokio::spawn(async move { queue.pop(&finished).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send_replace(true);
        queue.wake_all();

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(result, None);
        }
    }
}
