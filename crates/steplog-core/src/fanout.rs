// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Broadcast fan-out to connected clients and the commit watermark.
//!
//! Fan-out never awaits: every connection owns a bounded outbox drained by its
//! own writer task, and publication uses `try_send`. A connection that cannot
//! keep up is evicted rather than allowed to skip steps, so a connected client
//! always sees a gap-free suffix of the log. Evicted clients reconnect and
//! resync.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Connection identifier assigned by [`Fanout::subscribe`].
pub type ConnId = u64;

/// Why a connection left the fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Outbox full.
    Lagging,
    /// Receiver dropped.
    Closed,
}

/// Result of a targeted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Message is in the connection's outbox.
    Queued,
    /// Connection could not take the message and was removed.
    Evicted(Eviction),
    /// No such connection.
    Unknown,
}

/// Set of live connection outboxes.
#[derive(Debug)]
pub struct Fanout<T> {
    next_conn: ConnId,
    capacity: usize,
    conns: BTreeMap<ConnId, mpsc::Sender<T>>,
}

impl<T: Clone> Fanout<T> {
    /// Fan-out whose outboxes hold up to `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        Self {
            next_conn: 0,
            capacity: capacity.max(1),
            conns: BTreeMap::new(),
        }
    }

    /// Register a connection; the caller drains the returned outbox.
    pub fn subscribe(&mut self) -> (ConnId, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_conn;
        self.next_conn += 1;
        self.conns.insert(id, tx);
        (id, rx)
    }

    /// Forget a connection. Returns whether it was registered.
    pub fn unsubscribe(&mut self, conn: ConnId) -> bool {
        self.conns.remove(&conn).is_some()
    }

    /// Whether `conn` is registered.
    pub fn contains(&self, conn: ConnId) -> bool {
        self.conns.contains_key(&conn)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// The outbox sender of `conn`, for tasks that deliver later.
    pub fn sender(&self, conn: ConnId) -> Option<mpsc::Sender<T>> {
        self.conns.get(&conn).cloned()
    }

    /// Queue `msg` for one connection.
    pub fn send_to(&mut self, conn: ConnId, msg: T) -> Delivery {
        let Some(tx) = self.conns.get(&conn) else {
            return Delivery::Unknown;
        };
        match try_queue(tx, msg) {
            Ok(()) => Delivery::Queued,
            Err(eviction) => {
                self.evict(conn, eviction);
                Delivery::Evicted(eviction)
            }
        }
    }

    /// Queue `msg` for every connection, the sender included. Returns the
    /// connections evicted along the way.
    pub fn publish(&mut self, msg: &T) -> Vec<(ConnId, Eviction)> {
        let mut evicted = Vec::new();
        for (&conn, tx) in &self.conns {
            if let Err(eviction) = try_queue(tx, msg.clone()) {
                evicted.push((conn, eviction));
            }
        }
        for &(conn, eviction) in &evicted {
            self.evict(conn, eviction);
        }
        evicted
    }

    fn evict(&mut self, conn: ConnId, eviction: Eviction) {
        if self.conns.remove(&conn).is_some() && eviction == Eviction::Lagging {
            warn!(conn, "evicting lagging connection; it must resync");
        }
    }
}

fn try_queue<T>(tx: &mpsc::Sender<T>, msg: T) -> Result<(), Eviction> {
    tx.try_send(msg).map_err(|err| match err {
        mpsc::error::TrySendError::Full(_) => Eviction::Lagging,
        mpsc::error::TrySendError::Closed(_) => Eviction::Closed,
    })
}

/// Watermark of the committed log length; wakes long-poll waiters.
#[derive(Debug)]
pub struct CommitWatch {
    tx: watch::Sender<u64>,
}

/// The watch was dropped while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("commit watch closed")]
pub struct WatchClosed;

impl Default for CommitWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitWatch {
    /// Watermark at zero.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// Current committed length.
    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Raise the watermark to `len`; lower values are ignored.
    pub fn advance(&self, len: u64) {
        self.tx.send_if_modified(|cur| {
            if len > *cur {
                *cur = len;
                true
            } else {
                false
            }
        });
    }

    /// Handle for one waiter.
    pub fn waiter(&self) -> CommitWaiter {
        CommitWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

/// One long-poll waiter.
#[derive(Debug)]
pub struct CommitWaiter {
    rx: watch::Receiver<u64>,
}

impl CommitWaiter {
    /// Resolve once more than `len` steps are committed; returns the new length.
    pub async fn wait_beyond(&mut self, len: u64) -> Result<u64, WatchClosed> {
        let current = self
            .rx
            .wait_for(|committed| *committed > len)
            .await
            .map_err(|_| WatchClosed)?;
        Ok(*current)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn publish_reaches_everyone_in_order() {
        let mut fanout = Fanout::new(8);
        let (_a, mut rx_a) = fanout.subscribe();
        let (_b, mut rx_b) = fanout.subscribe();
        for n in 0..3u32 {
            assert!(fanout.publish(&n).is_empty());
        }
        for rx in [&mut rx_a, &mut rx_b] {
            let got: Vec<u32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
            assert_eq!(got, vec![0, 1, 2]);
        }
    }

    #[test]
    fn lagging_connection_is_evicted_others_unaffected() {
        let mut fanout = Fanout::new(1);
        let (slow, _rx_slow) = fanout.subscribe();
        let (fast, mut rx_fast) = fanout.subscribe();
        fanout.publish(&1u8);
        assert_eq!(rx_fast.try_recv().ok(), Some(1));
        let evicted = fanout.publish(&2u8);
        assert_eq!(evicted, vec![(slow, Eviction::Lagging)]);
        assert!(!fanout.contains(slow));
        assert!(fanout.contains(fast));
        assert_eq!(rx_fast.try_recv().ok(), Some(2));
    }

    #[test]
    fn closed_connection_is_evicted_on_send() {
        let mut fanout = Fanout::new(4);
        let (conn, rx) = fanout.subscribe();
        drop(rx);
        assert_eq!(
            fanout.send_to(conn, "hi"),
            Delivery::Evicted(Eviction::Closed)
        );
        assert_eq!(fanout.send_to(conn, "hi"), Delivery::Unknown);
        assert!(fanout.is_empty());
    }

    #[tokio::test]
    async fn waiter_wakes_when_watermark_passes() {
        let watch = CommitWatch::new();
        let mut waiter = watch.waiter();
        let pending = tokio::spawn(async move { waiter.wait_beyond(2).await });
        watch.advance(2);
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        watch.advance(3);
        let got = timeout(Duration::from_secs(1), pending)
            .await
            .expect("waiter woke")
            .expect("join");
        assert_eq!(got, Ok(3));
    }

    #[tokio::test]
    async fn waiter_returns_immediately_when_already_beyond() {
        let watch = CommitWatch::new();
        watch.advance(5);
        watch.advance(1);
        assert_eq!(watch.current(), 5);
        assert_eq!(watch.waiter().wait_beyond(4).await, Ok(5));
    }

    #[tokio::test]
    async fn dropped_watch_releases_waiters() {
        let watch = CommitWatch::new();
        let mut waiter = watch.waiter();
        drop(watch);
        assert_eq!(waiter.wait_beyond(0).await, Err(WatchClosed));
    }
}
