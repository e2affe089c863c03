// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! JSON events spoken by browser clients over the gateway WebSocket.
//!
//! Events are `{"event": <name>, "data": <body>}`. Client events are `step`,
//! `init` and `needSync`; the hub answers with `step`, `steps`,
//! `synchronize` and `error`.

use serde::{Deserialize, Serialize};

use crate::{ErrorPayload, Message, Step};

/// Browser → hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Submit a step.
    #[serde(rename = "step")]
    Step(Step),
    /// Bootstrap with the client's local history.
    #[serde(rename = "init")]
    Init(Vec<Step>),
    /// Ask for the authoritative snapshot.
    #[serde(rename = "needSync")]
    NeedSync,
}

impl From<ClientEvent> for Message {
    fn from(ev: ClientEvent) -> Self {
        match ev {
            ClientEvent::Step(step) => Message::SubmitStep(step),
            ClientEvent::Init(history) => Message::Bootstrap { history },
            ClientEvent::NeedSync => Message::RequestResync,
        }
    }
}

/// Hub → browser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// A committed step, index included.
    #[serde(rename = "step")]
    Step(Step),
    /// Steps committed together (a drained chain or a seed), in index order.
    #[serde(rename = "steps")]
    Steps(Vec<Step>),
    /// Replace local history with this snapshot.
    #[serde(rename = "synchronize")]
    Synchronize(Vec<Step>),
    /// A request of this client was refused.
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Browser-facing form of a hub message; `None` for messages browsers
    /// never see (handshakes, long-poll answers).
    pub fn from_message(msg: Message) -> Option<Self> {
        match msg {
            Message::StepCommitted(step) => Some(ServerEvent::Step(step)),
            Message::StepsCommitted { steps } => Some(ServerEvent::Steps(steps)),
            Message::Synchronize { history } => Some(ServerEvent::Synchronize(history)),
            Message::Error(err) => Some(ServerEvent::Error(err)),
            _ => None,
        }
    }
}
