// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session wire schema for the steplog hub.
//!
//! Hub connections exchange [`Message`]s wrapped in an [`OpEnvelope`] and
//! framed by [`wire`]. Browser clients speak the JSON events in [`json`],
//! which the gateway maps onto the same messages.

pub use steplog_core::{Phase, PollCursor, Predecessor, Step, StepError, StepId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod json;
pub mod wire;

/// Default Unix socket path for the hub.
///
/// Prefers a per-user runtime dir (XDG_RUNTIME_DIR) and falls back to `/tmp`
/// when unavailable.
pub fn default_socket_path() -> PathBuf {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("steplog.sock")
}

/// Envelope carried as the payload of a framed packet.
///
/// * `op` – operation name (see [`Message::op_name`]).
/// * `ts` – logical timestamp (authoritative on the hub side).
/// * `payload` – operation specific body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name.
    pub op: String,
    /// Logical timestamp (monotonic per hub).
    pub ts: u64,
    /// Operation-specific body.
    pub payload: P,
}

/// Error payload sent to the client whose request was refused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Numeric error code.
    pub code: u32,
    /// Stable identifier (e.g., "E_DUPLICATE_ID").
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// The step the error is about, when known.
    #[serde(default, rename = "stepId", skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    /// Op of the request this refuses; absent when the hub could not tell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
}

impl ErrorPayload {
    /// Error for a request that could not be decoded or is not allowed.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: 2,
            name: "E_BAD_REQUEST".into(),
            message: message.into(),
            step_id: None,
            op: None,
        }
    }

    /// Tag this refusal with the op of the request it answers.
    pub fn answering(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }
}

impl From<&StepError> for ErrorPayload {
    fn from(err: &StepError) -> Self {
        Self {
            code: err.code(),
            name: err.name().into(),
            message: err.to_string(),
            step_id: err.step_id().cloned(),
            op: None,
        }
    }
}

/// Handshake request payload (client → hub).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Optional agent identifier.
    pub agent_id: Option<String>,
    /// Implementation version (not wire version).
    pub client_version: u32,
}

/// Handshake acknowledgement payload (hub → client).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeAckPayload {
    /// Status of the handshake.
    pub status: AckStatus,
    /// Hub implementation version (not wire version).
    pub server_version: u32,
    /// Session identifier.
    pub session_id: String,
    /// Lifecycle phase of the log at handshake time.
    pub phase: Phase,
    /// Number of committed steps at handshake time.
    pub len: u64,
}

/// Status enumeration for handshake ack.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AckStatus {
    /// Handshake succeeded.
    #[serde(rename = "OK")]
    Ok,
    /// Handshake failed.
    #[serde(rename = "ERROR")]
    Error,
}

/// Step pushed over the request/response transport.
///
/// Without `previousId` (absent or `null`) the hub chains the step onto the
/// current head of the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushStepPayload {
    /// Caller-assigned id.
    pub id: StepId,
    /// Explicit predecessor, if the client tracks one.
    #[serde(default, rename = "previousId", skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<StepId>,
    /// Opaque payload.
    pub payload: serde_json::Value,
}

impl PushStepPayload {
    /// The step this push describes when it names a predecessor.
    pub fn explicit_step(&self) -> Option<Step> {
        self.previous_id
            .clone()
            .map(|prev| Step::new(self.id.clone(), Predecessor::Step(prev), self.payload.clone()))
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    /// Committed; `index` is set.
    Committed,
    /// Waiting on a predecessor; `awaiting` is set.
    Held,
    /// Refused; `error` is set.
    Rejected,
}

/// Acknowledgement of a push (hub → client).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushAckPayload {
    /// Outcome.
    pub status: PushStatus,
    /// Assigned index when committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    /// Awaited predecessor when held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<StepId>,
    /// Reason when rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct HistoryPayload {
    pub(crate) history: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct PollSincePayload {
    pub(crate) cursor: PollCursor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct StepsPayload {
    pub(crate) steps: Vec<Step>,
}

/// Wire message kinds carried inside OpEnvelope payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake request (op = "handshake").
    Handshake(HandshakePayload),
    /// Handshake acknowledgement (op = "handshake_ack").
    HandshakeAck(HandshakeAckPayload),
    /// Refusal or protocol error (op = "error").
    Error(ErrorPayload),
    /// Append a step; fire-and-forget (op = "submit_step").
    SubmitStep(Step),
    /// A new client's claimed history (op = "bootstrap").
    Bootstrap {
        /// Claimed history, oldest first.
        history: Vec<Step>,
    },
    /// Ask for the authoritative snapshot (op = "request_resync").
    RequestResync,
    /// A step committed; sent to every connection (op = "step_committed").
    StepCommitted(Step),
    /// Several steps committed by one admission, ascending by index; sent to
    /// every connection as a single packet (op = "steps_committed").
    StepsCommitted {
        /// Newly committed steps.
        steps: Vec<Step>,
    },
    /// Full ordered snapshot; replaces the receiver's copy (op = "synchronize").
    Synchronize {
        /// Committed steps, ascending by index.
        history: Vec<Step>,
    },
    /// Long-poll for steps after a cursor (op = "poll_since").
    PollSince {
        /// Where to resume.
        cursor: PollCursor,
    },
    /// Answer to a long-poll; never empty (op = "poll_result").
    PollResult {
        /// Committed steps after the cursor, ascending by index.
        steps: Vec<Step>,
    },
    /// Request/response append (op = "push_step").
    PushStep(PushStepPayload),
    /// Answer to a push (op = "push_ack").
    PushAck(PushAckPayload),
}

impl Message {
    /// Canonical op string for this message variant.
    pub fn op_name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshake_ack",
            Message::Error(_) => "error",
            Message::SubmitStep(_) => "submit_step",
            Message::Bootstrap { .. } => "bootstrap",
            Message::RequestResync => "request_resync",
            Message::StepCommitted(_) => "step_committed",
            Message::StepsCommitted { .. } => "steps_committed",
            Message::Synchronize { .. } => "synchronize",
            Message::PollSince { .. } => "poll_since",
            Message::PollResult { .. } => "poll_result",
            Message::PushStep(_) => "push_step",
            Message::PushAck(_) => "push_ack",
        }
    }

    /// Broadcast for the steps one admission committed: a lone step travels
    /// as `step_committed`, a drained chain or a seed as one
    /// `steps_committed`. `None` when nothing committed.
    pub fn committed(mut steps: Vec<Step>) -> Option<Self> {
        match steps.len() {
            0 => None,
            1 => steps.pop().map(Message::StepCommitted),
            _ => Some(Message::StepsCommitted { steps }),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn error_payload_from_step_error_keeps_code_and_id() {
        let err = StepError::DuplicateId { id: 4u64.into() };
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.code, 10);
        assert_eq!(payload.name, "E_DUPLICATE_ID");
        assert_eq!(payload.step_id, Some(StepId::Num(4)));
        assert!(payload.message.contains("duplicate"));
    }

    #[test]
    fn push_without_previous_has_no_explicit_step() {
        let push: PushStepPayload =
            serde_json::from_value(json!({"id": 3, "payload": {"mutations": []}})).unwrap();
        assert!(push.explicit_step().is_none());

        let push: PushStepPayload =
            serde_json::from_value(json!({"id": 3, "previousId": 2, "payload": {}})).unwrap();
        let step = push.explicit_step().unwrap();
        assert_eq!(step.previous_id, Predecessor::Step(2u64.into()));
    }

    #[test]
    fn one_admission_is_one_broadcast() {
        assert_eq!(Message::committed(vec![]), None);

        let lone = Step::first("a", json!({}));
        assert_eq!(
            Message::committed(vec![lone.clone()]),
            Some(Message::StepCommitted(lone))
        );

        let chain = vec![Step::first("a", json!({})), Step::after("b", "a", json!({}))];
        assert_eq!(
            Message::committed(chain.clone()),
            Some(Message::StepsCommitted { steps: chain })
        );
    }

    #[test]
    fn refusal_names_the_op_it_answers() {
        let err = ErrorPayload::from(&StepError::Malformed {
            reason: "payload is null".into(),
        })
        .answering("submit_step");
        assert_eq!(err.op.as_deref(), Some("submit_step"));
        assert_eq!(err.step_id, None);
        assert!(ErrorPayload::bad_request("nope").op.is_none());
    }
}
