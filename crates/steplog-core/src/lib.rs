// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Causally ordered collaboration log.
//!
//! Clients append opaque steps, each naming the step it follows. The log
//! commits a step once its predecessor is committed, holds it in a reorder
//! buffer until then, and assigns dense indices in commit order. Transport
//! crates wrap a [`History`] behind one lock and feed the committed steps to a
//! [`Fanout`].

mod error;
mod fanout;
mod history;
mod reorder;
mod step;
mod store;
mod sync;

pub use error::StepError;
pub use fanout::{CommitWaiter, CommitWatch, ConnId, Delivery, Eviction, Fanout, WatchClosed};
pub use history::{Admission, History, PollCursor};
pub use reorder::{Held, HeldConflict, ReorderBuffer};
pub use step::{Predecessor, Step, StepId};
pub use store::StepStore;
pub use sync::{Bootstrap, Phase, SeedReport};
