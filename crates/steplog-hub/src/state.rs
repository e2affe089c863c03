// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hub state and per-message handling.
//!
//! Every mutation of the log happens under the one [`SharedHub`] lock, so
//! commit order, index assignment and the order packets enter each outbox
//! all agree.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use steplog_core::{
    Admission, Bootstrap, CommitWatch, ConnId, Delivery, Fanout, HeldConflict, History, Step,
};
use steplog_proto::{
    wire::encode_message, AckStatus, ErrorPayload, HandshakeAckPayload, Message, PushAckPayload,
    PushStatus, PushStepPayload,
};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::prefs::HubPrefs;

/// Protocol version the hub reports in its handshake ack.
pub const HUB_VERSION: u32 = 1;

/// The hub behind its lock.
pub type SharedHub = Arc<Mutex<HubState>>;

/// Everything the hub knows: the log, the connections and their pending polls.
pub struct HubState {
    history: History,
    fanout: Fanout<Vec<u8>>,
    watch: CommitWatch,
    polls: HashMap<ConnId, Vec<AbortHandle>>,
    next_ts: u64,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new(HeldConflict::default(), HubPrefs::default().outbox_capacity)
    }
}

impl HubState {
    /// Empty hub.
    pub fn new(held_conflict: HeldConflict, outbox_capacity: usize) -> Self {
        Self {
            history: History::with_conflict_policy(held_conflict),
            fanout: Fanout::new(outbox_capacity),
            watch: CommitWatch::new(),
            polls: HashMap::new(),
            next_ts: 0,
        }
    }

    /// Empty hub configured from prefs.
    pub fn from_prefs(prefs: &HubPrefs) -> Self {
        Self::new(prefs.held_conflict, prefs.outbox_capacity)
    }

    /// Wrap in the shared lock.
    pub fn shared(self) -> SharedHub {
        Arc::new(Mutex::new(self))
    }

    /// The ordered log.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Open connections.
    pub fn connections(&self) -> usize {
        self.fanout.len()
    }

    /// Register a connection; packets for it arrive on the returned receiver.
    pub fn connect(&mut self) -> (ConnId, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        self.fanout.subscribe()
    }

    /// Forget a connection and cancel its pending polls.
    pub fn disconnect(&mut self, conn: ConnId) {
        self.fanout.unsubscribe(conn);
        self.cancel_polls(conn);
    }

    fn cancel_polls(&mut self, conn: ConnId) {
        if let Some(polls) = self.polls.remove(&conn) {
            for poll in polls {
                poll.abort();
            }
        }
    }

    fn alloc_ts(&mut self) -> u64 {
        let t = self.next_ts;
        self.next_ts += 1;
        t
    }

    fn packet(&mut self, msg: &Message) -> Result<Vec<u8>> {
        let ts = self.alloc_ts();
        Ok(encode_message(msg, ts)?)
    }

    fn send_to(&mut self, conn: ConnId, msg: &Message) -> Result<()> {
        let pkt = self.packet(msg)?;
        match self.fanout.send_to(conn, pkt) {
            Delivery::Queued => {}
            Delivery::Evicted(eviction) => {
                self.cancel_polls(conn);
                debug!(conn, ?eviction, op = msg.op_name(), "reply dropped; connection evicted");
            }
            Delivery::Unknown => debug!(conn, op = msg.op_name(), "reply for a closed connection"),
        }
        Ok(())
    }

    /// Refuse a request of `conn` that never reached the log.
    pub fn refuse(&mut self, conn: ConnId, err: ErrorPayload) -> Result<()> {
        self.send_to(conn, &Message::Error(err))
    }

    // One admission takes one outbox slot per connection, however many steps
    // it committed.
    fn publish_committed(&mut self, steps: Vec<Step>) -> Result<()> {
        let Some(msg) = Message::committed(steps) else {
            return Ok(());
        };
        let pkt = self.packet(&msg)?;
        for (conn, eviction) in self.fanout.publish(&pkt) {
            self.cancel_polls(conn);
            debug!(conn, ?eviction, "connection dropped from fan-out");
        }
        self.watch.advance(self.history.len() as u64);
        Ok(())
    }

    fn track_poll(&mut self, conn: ConnId, poll: AbortHandle) {
        let polls = self.polls.entry(conn).or_default();
        polls.retain(|p| !p.is_finished());
        polls.push(poll);
    }

    /// Number of long-polls parked for `conn`.
    pub fn pending_polls(&self, conn: ConnId) -> usize {
        self.polls
            .get(&conn)
            .map_or(0, |polls| polls.iter().filter(|p| !p.is_finished()).count())
    }
}

/// Apply one decoded message from `conn_id`.
///
/// Step refusals go back to the sender as `error` messages; an `Err` here
/// means the connection itself should be dropped.
pub async fn handle_message(msg: Message, conn_id: ConnId, hub: &SharedHub) -> Result<()> {
    let op = msg.op_name();
    let mut h = hub.lock().await;
    match msg {
        Message::Handshake(handshake) => {
            debug!(conn = conn_id, agent = ?handshake.agent_id, "handshake");
            let ack = HandshakeAckPayload {
                status: AckStatus::Ok,
                server_version: HUB_VERSION,
                session_id: "default".into(),
                phase: h.history.phase(),
                len: h.history.len() as u64,
            };
            h.send_to(conn_id, &Message::HandshakeAck(ack))?;
        }
        Message::SubmitStep(step) => match h.history.submit(step) {
            Ok(Admission::Committed(steps)) => h.publish_committed(steps)?,
            Ok(Admission::Held(held)) => {
                debug!(conn = conn_id, awaiting = %held.awaiting, "step held");
            }
            Err(err) => {
                warn!(conn = conn_id, %err, "step rejected");
                h.refuse(conn_id, ErrorPayload::from(&err).answering(op))?;
            }
        },
        Message::Bootstrap { history } => match h.history.bootstrap(history) {
            Bootstrap::Seeded(report) => {
                h.publish_committed(report.committed)?;
                for err in &report.rejected {
                    h.refuse(conn_id, ErrorPayload::from(err).answering(op))?;
                }
            }
            Bootstrap::Synchronize(history) => {
                h.send_to(conn_id, &Message::Synchronize { history })?;
            }
        },
        Message::RequestResync => {
            let history = h.history.resync();
            h.send_to(conn_id, &Message::Synchronize { history })?;
        }
        Message::PollSince { cursor } => {
            let from = h.history.poll_start(&cursor);
            if (h.history.len() as u64) > from {
                let steps = h.history.since(from);
                h.send_to(conn_id, &Message::PollResult { steps })?;
            } else if let Some(tx) = h.fanout.sender(conn_id) {
                let mut waiter = h.watch.waiter();
                let hub = Arc::clone(hub);
                let poll = tokio::spawn(async move {
                    tokio::select! {
                        woke = waiter.wait_beyond(from) => {
                            if woke.is_err() {
                                return;
                            }
                            let pkt = {
                                let mut h = hub.lock().await;
                                let steps = h.history.since(from);
                                match h.packet(&Message::PollResult { steps }) {
                                    Ok(pkt) => pkt,
                                    Err(err) => {
                                        warn!(conn = conn_id, ?err, "could not encode poll result");
                                        return;
                                    }
                                }
                            };
                            if tx.send(pkt).await.is_err() {
                                debug!(conn = conn_id, "poll answered after disconnect");
                            }
                        }
                        () = tx.closed() => {
                            debug!(conn = conn_id, "poll cancelled by disconnect");
                        }
                    }
                });
                h.track_poll(conn_id, poll.abort_handle());
            }
        }
        Message::PushStep(push) => {
            let ack = push_step(&mut h, push)?;
            h.send_to(conn_id, &Message::PushAck(ack))?;
        }
        Message::HandshakeAck(_)
        | Message::Error(_)
        | Message::StepCommitted(_)
        | Message::StepsCommitted { .. }
        | Message::Synchronize { .. }
        | Message::PollResult { .. }
        | Message::PushAck(_) => {
            info!(conn = conn_id, op, "client sent a hub-only op");
            let err = ErrorPayload::bad_request(format!("unexpected op {op}")).answering(op);
            h.refuse(conn_id, err)?;
        }
    }
    Ok(())
}

fn push_step(h: &mut HubState, push: PushStepPayload) -> Result<PushAckPayload> {
    let admission = match push.explicit_step() {
        Some(step) => h.history.submit(step),
        None => h.history.append(push.id, push.payload),
    };
    let ack = match admission {
        Ok(Admission::Committed(steps)) => {
            let index = steps.first().and_then(|s| s.index);
            h.publish_committed(steps)?;
            PushAckPayload {
                status: PushStatus::Committed,
                index,
                awaiting: None,
                error: None,
            }
        }
        Ok(Admission::Held(held)) => PushAckPayload {
            status: PushStatus::Held,
            index: None,
            awaiting: Some(held.awaiting),
            error: None,
        },
        Err(err) => {
            warn!(%err, "pushed step rejected");
            PushAckPayload {
                status: PushStatus::Rejected,
                index: None,
                awaiting: None,
                error: Some(ErrorPayload::from(&err)),
            }
        }
    };
    Ok(ack)
}
