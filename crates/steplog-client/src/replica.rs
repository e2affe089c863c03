// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Local copy of the log, reconciled against hub messages.

use std::collections::HashSet;

use steplog_proto::{Message, PollCursor, Step, StepId};
use tracing::{debug, warn};

/// What applying a hub message did to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// New steps were appended.
    Applied,
    /// Every step was already present (our own echo, or a replay).
    AlreadyHave,
    /// The local copy was replaced wholesale.
    Replaced,
    /// A step arrived out of position; request a resync.
    Gap {
        /// Index the replica expected next.
        expected: u64,
        /// Index the hub stamped on the step.
        got: Option<u64>,
    },
    /// Not a message that touches the log.
    Ignored,
}

impl Reconcile {
    /// Whether the replica needs a `request_resync` to recover.
    pub fn needs_resync(self) -> bool {
        matches!(self, Reconcile::Gap { .. })
    }
}

/// Committed steps in index order, as this client knows them.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    steps: Vec<Step>,
    ids: HashSet<StepId>,
}

impl Replica {
    /// Empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// Known committed steps, ascending by index.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of known steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when nothing is known yet.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether `id` is known.
    pub fn contains(&self, id: &StepId) -> bool {
        self.ids.contains(id)
    }

    /// Most recent known step.
    pub fn head(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Cursor that resumes a long-poll right after the last known step.
    pub fn cursor(&self) -> PollCursor {
        match self.head() {
            Some(head) => PollCursor::AfterId(head.id.clone()),
            None => PollCursor::Start,
        }
    }

    /// Fold one hub message into the replica.
    pub fn apply(&mut self, msg: &Message) -> Reconcile {
        match msg {
            Message::StepCommitted(step) => self.apply_committed(step.clone()),
            Message::Synchronize { history } => self.replace(history.clone()),
            Message::StepsCommitted { steps } | Message::PollResult { steps } => {
                self.extend(steps.iter().cloned())
            }
            _ => Reconcile::Ignored,
        }
    }

    /// Apply one committed step.
    pub fn apply_committed(&mut self, step: Step) -> Reconcile {
        if self.ids.contains(&step.id) {
            return Reconcile::AlreadyHave;
        }
        let expected = self.steps.len() as u64;
        if step.index != Some(expected) {
            warn!(id = %step.id, expected, got = ?step.index, "gap in committed steps");
            return Reconcile::Gap {
                expected,
                got: step.index,
            };
        }
        debug!(id = %step.id, index = expected, "applied committed step");
        self.ids.insert(step.id.clone());
        self.steps.push(step);
        Reconcile::Applied
    }

    /// Apply steps in order; stops at the first gap.
    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) -> Reconcile {
        let mut outcome = Reconcile::AlreadyHave;
        for step in steps {
            match self.apply_committed(step) {
                Reconcile::Applied => outcome = Reconcile::Applied,
                gap @ Reconcile::Gap { .. } => return gap,
                _ => {}
            }
        }
        outcome
    }

    /// Replace the local copy with an authoritative snapshot.
    pub fn replace(&mut self, history: Vec<Step>) -> Reconcile {
        self.ids = history.iter().map(|s| s.id.clone()).collect();
        self.steps = history;
        debug!(len = self.steps.len(), "replica replaced from snapshot");
        Reconcile::Replaced
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use serde_json::json;

    fn committed(id: &str, previous: Option<&str>, index: u64) -> Step {
        let mut step = match previous {
            Some(prev) => Step::after(id, prev, json!({"m": id})),
            None => Step::first(id, json!({"m": id})),
        };
        step.index = Some(index);
        step
    }

    #[test]
    fn own_echo_is_recognised() {
        let mut replica = Replica::new();
        let a = committed("a", None, 0);
        assert_eq!(replica.apply(&Message::StepCommitted(a.clone())), Reconcile::Applied);
        assert_eq!(replica.apply(&Message::StepCommitted(a)), Reconcile::AlreadyHave);
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn skipped_index_asks_for_resync() {
        let mut replica = Replica::new();
        replica.apply_committed(committed("a", None, 0));
        let outcome = replica.apply_committed(committed("c", Some("b"), 2));
        assert_eq!(
            outcome,
            Reconcile::Gap {
                expected: 1,
                got: Some(2)
            }
        );
        assert!(outcome.needs_resync());
        assert_eq!(replica.len(), 1);
    }

    #[test]
    fn synchronize_replaces_local_state() {
        let mut replica = Replica::new();
        replica.apply_committed(committed("stale", None, 0));
        let snapshot = vec![committed("x", None, 0), committed("y", Some("x"), 1)];
        assert_eq!(
            replica.apply(&Message::Synchronize { history: snapshot }),
            Reconcile::Replaced
        );
        assert!(!replica.contains(&"stale".into()));
        assert_eq!(replica.head().map(|s| s.id.clone()), Some("y".into()));
        assert_eq!(replica.cursor(), PollCursor::AfterId("y".into()));
    }

    #[test]
    fn poll_results_overlapping_known_steps_still_apply() {
        let mut replica = Replica::new();
        replica.apply_committed(committed("x", None, 0));
        let steps = vec![committed("x", None, 0), committed("y", Some("x"), 1)];
        assert_eq!(
            replica.apply(&Message::PollResult { steps }),
            Reconcile::Applied
        );
        assert_eq!(replica.len(), 2);
        assert_eq!(replica.apply(&Message::RequestResync), Reconcile::Ignored);
    }

    #[test]
    fn batched_commit_applies_in_order() {
        let mut replica = Replica::new();
        let steps = vec![committed("a", None, 0), committed("b", Some("a"), 1)];
        assert_eq!(
            replica.apply(&Message::StepsCommitted { steps }),
            Reconcile::Applied
        );
        assert_eq!(replica.head().map(|s| s.id.clone()), Some("b".into()));
    }

    #[test]
    fn empty_replica_polls_from_start() {
        assert_eq!(Replica::new().cursor(), PollCursor::Start);
    }
}
