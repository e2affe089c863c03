// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unix-socket hub for the collaboration step log.
//!
//! The hub owns the one authoritative [`steplog_core::History`]. Clients
//! speak framed CBOR packets from `steplog-proto`; every commit is fanned out
//! to every connection in index order, refusals go back to the sender only.

pub mod prefs;
pub mod server;
pub mod state;

pub use prefs::{HubPrefs, PREFS_KEY};
pub use server::{handle_client, serve, spawn_stall_reporter};
pub use state::{handle_message, HubState, SharedHub, HUB_VERSION};
