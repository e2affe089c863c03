// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The log aggregate: store + reorder buffer behind one `&mut self`.
//!
//! Admission, index assignment and buffer drain are a single check-then-act
//! sequence, so callers must serialize access to a [`History`] (the hub keeps
//! it behind one mutex). Every step in [`Admission::Committed`] must be handed
//! to the fan-out in the order returned.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StepError;
use crate::reorder::{Held, HeldConflict, ReorderBuffer};
use crate::step::{Predecessor, Step, StepId};
use crate::store::StepStore;
use crate::sync::Phase;

/// Result of offering a step to the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The step committed, followed by every pending step it unblocked, in
    /// commit order.
    Committed(Vec<Step>),
    /// The predecessor is not committed yet; the step waits in the buffer.
    Held(Held),
}

impl Admission {
    /// Steps committed by this admission (empty when held).
    pub fn committed(&self) -> &[Step] {
        match self {
            Admission::Committed(steps) => steps,
            Admission::Held(_) => &[],
        }
    }
}

/// Where a long-poll request resumes reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollCursor {
    /// From the beginning of the log.
    Start,
    /// After the step with this id. Unknown ids restart from the beginning.
    AfterId(StepId),
    /// After the step with this index.
    AfterIndex(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Live,
    Seed,
}

/// Committed log plus pending steps.
#[derive(Debug, Default, Clone)]
pub struct History {
    pub(crate) store: StepStore,
    pub(crate) buffer: ReorderBuffer,
    pub(crate) phase: Phase,
}

impl History {
    /// Empty history using the default conflict policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty history with an explicit policy for contended predecessors.
    pub fn with_conflict_policy(policy: HeldConflict) -> Self {
        Self {
            buffer: ReorderBuffer::new(policy),
            ..Self::default()
        }
    }

    /// Committed steps.
    pub fn store(&self) -> &StepStore {
        &self.store
    }

    /// Pending steps.
    pub fn buffer(&self) -> &ReorderBuffer {
        &self.buffer
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of committed steps.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether nothing is committed.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Ordered copy of the committed log.
    pub fn snapshot(&self) -> Vec<Step> {
        self.store.snapshot()
    }

    /// Number of steps waiting on a predecessor.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Offer a live step: commit it if its predecessor is known, otherwise
    /// hold it.
    pub fn submit(&mut self, step: Step) -> Result<Admission, StepError> {
        self.admit(step, Origin::Live)
    }

    /// Submit a step that carries no predecessor of its own: it is chained
    /// onto the current head, or opens the log when the log is empty.
    pub fn append(
        &mut self,
        id: StepId,
        payload: serde_json::Value,
    ) -> Result<Admission, StepError> {
        let previous = match self.store.head() {
            Some(head) => Predecessor::Step(head.id.clone()),
            None => Predecessor::First,
        };
        self.submit(Step::new(id, previous, payload))
    }

    /// Position in the log a poll with this cursor reads from.
    pub fn poll_start(&self, cursor: &PollCursor) -> u64 {
        match cursor {
            PollCursor::Start => 0,
            PollCursor::AfterIndex(index) => index.saturating_add(1),
            PollCursor::AfterId(id) => self
                .store
                .get(id)
                .and_then(|s| s.index)
                .map_or(0, |index| index + 1),
        }
    }

    /// Committed steps with `index >= from`.
    pub fn since(&self, from: u64) -> Vec<Step> {
        self.store.since(from)
    }

    pub(crate) fn admit(&mut self, mut step: Step, origin: Origin) -> Result<Admission, StepError> {
        step.index = None;
        step.validate()?;
        if self.store.contains(&step.id) || self.buffer.contains(&step.id) {
            return Err(StepError::DuplicateId { id: step.id });
        }
        match step.previous_id.clone() {
            Predecessor::Step(previous) if !self.store.contains(&previous) => {
                let held = self.buffer.hold(previous, step)?;
                if let Some(displaced) = &held.displaced {
                    warn!(
                        awaiting = %held.awaiting,
                        displaced = %displaced.id,
                        "pending step displaced by a newer step on the same predecessor"
                    );
                }
                debug!(awaiting = %held.awaiting, pending = self.buffer.len(), "step held");
                Ok(Admission::Held(held))
            }
            _ => self
                .commit_and_drain(step, origin)
                .map(Admission::Committed),
        }
    }

    fn commit_and_drain(&mut self, step: Step, origin: Origin) -> Result<Vec<Step>, StepError> {
        let mut committed = vec![self.store.commit(step)?.clone()];
        // Each commit unblocks at most one pending step, so the drain is a
        // single chain walked iteratively.
        loop {
            let Some(last) = committed.last().map(|s| s.id.clone()) else {
                break;
            };
            let Some(next) = self.buffer.take_waiting_on(&last) else {
                break;
            };
            match self.store.commit(next) {
                Ok(step) => committed.push(step.clone()),
                Err(err) => {
                    warn!(%err, "dropping pending step that could not commit");
                    break;
                }
            }
        }
        self.phase = self.phase.after_commit(origin);
        debug!(
            committed = committed.len(),
            len = self.store.len(),
            pending = self.buffer.len(),
            "steps committed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use serde_json::json;

    fn ids(steps: &[Step]) -> Vec<StepId> {
        steps.iter().map(|s| s.id.clone()).collect()
    }

    fn assert_invariants(history: &History) {
        let snap = history.snapshot();
        for (pos, step) in snap.iter().enumerate() {
            assert_eq!(step.index, Some(pos as u64), "indices are dense");
            if let Predecessor::Step(prev) = &step.previous_id {
                let prev_index = history.store().get(prev).and_then(|s| s.index);
                assert!(
                    prev_index.is_some_and(|p| p < pos as u64),
                    "predecessor {prev} commits before {}",
                    step.id
                );
            }
        }
    }

    #[test]
    fn out_of_order_pair_commits_in_causal_order() {
        let mut history = History::new();
        let first = history.submit(Step::after(2u64, 1u64, json!("b"))).unwrap();
        assert!(matches!(first, Admission::Held(_)));
        assert!(history.is_empty());

        let second = history.submit(Step::first(1u64, json!("a"))).unwrap();
        assert_eq!(ids(second.committed()), vec![1u64.into(), 2u64.into()]);

        let snap = history.snapshot();
        assert_eq!(ids(&snap), vec![1u64.into(), 2u64.into()]);
        assert_eq!(snap[0].index, Some(0));
        assert_eq!(snap[1].index, Some(1));
        assert_eq!(history.pending_len(), 0);
        assert_invariants(&history);
    }

    #[test]
    fn chained_buffering_resolves_in_one_drain() {
        let mut history = History::new();
        history.submit(Step::after("c", "b", json!(3))).unwrap();
        history.submit(Step::after("b", "a", json!(2))).unwrap();
        assert_eq!(history.pending_len(), 2);

        let adm = history.submit(Step::first("a", json!(1))).unwrap();
        assert_eq!(ids(adm.committed()), vec!["a".into(), "b".into(), "c".into()]);
        assert_invariants(&history);
    }

    #[test]
    fn long_chain_drains_without_recursion() {
        let mut history = History::new();
        let n = 50_000u64;
        for id in (2..=n).rev() {
            history.submit(Step::after(id, id - 1, json!({ "n": id }))).unwrap();
        }
        let adm = history.submit(Step::first(1u64, json!(1))).unwrap();
        assert_eq!(adm.committed().len() as u64, n);
        assert_eq!(history.len() as u64, n);
        assert_eq!(history.pending_len(), 0);
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let mut history = History::new();
        history.submit(Step::first(1u64, json!("a"))).unwrap();
        let err = history.submit(Step::first(1u64, json!("a"))).unwrap_err();
        assert_eq!(err, StepError::DuplicateId { id: 1u64.into() });
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn duplicate_of_pending_step_is_rejected() {
        let mut history = History::new();
        history.submit(Step::after(2u64, 1u64, json!("b"))).unwrap();
        let err = history.submit(Step::after(2u64, 7u64, json!("b"))).unwrap_err();
        assert_eq!(err, StepError::DuplicateId { id: 2u64.into() });
        assert_eq!(history.pending_len(), 1);
    }

    #[test]
    fn client_supplied_index_is_ignored() {
        let mut history = History::new();
        let mut step = Step::first("x", json!({}));
        step.index = Some(41);
        let adm = history.submit(step).unwrap();
        assert_eq!(adm.committed()[0].index, Some(0));
    }

    #[test]
    fn self_reference_and_cycles_are_never_buffered() {
        let mut history = History::new();
        let err = history.submit(Step::after("a", "a", json!(1))).unwrap_err();
        assert_eq!(err, StepError::SelfReferential { id: "a".into() });

        history.submit(Step::after("a", "b", json!(1))).unwrap();
        let err = history.submit(Step::after("b", "a", json!(2))).unwrap_err();
        assert!(matches!(err, StepError::CyclicPredecessor { .. }));
        assert_eq!(history.pending_len(), 1);
    }

    #[test]
    fn second_first_step_is_rejected() {
        let mut history = History::new();
        history.submit(Step::first("a", json!(1))).unwrap();
        let err = history.submit(Step::first("b", json!(2))).unwrap_err();
        assert!(matches!(err, StepError::RootExists { .. }));
    }

    #[test]
    fn contended_predecessor_replace_earlier() {
        let mut history = History::new();
        history.submit(Step::after("x", "a", json!(1))).unwrap();
        let adm = history.submit(Step::after("y", "a", json!(2))).unwrap();
        let Admission::Held(held) = adm else {
            panic!("expected held");
        };
        assert_eq!(held.displaced.map(|s| s.id), Some("x".into()));

        let adm = history.submit(Step::first("a", json!(0))).unwrap();
        assert_eq!(ids(adm.committed()), vec!["a".into(), "y".into()]);
        // the displaced step is gone for good; resubmitting it is a fresh step
        let adm = history.submit(Step::after("x", "y", json!(1))).unwrap();
        assert_eq!(adm.committed()[0].index, Some(2));
    }

    #[test]
    fn contended_predecessor_keep_earlier() {
        let mut history = History::with_conflict_policy(HeldConflict::KeepEarlier);
        history.submit(Step::after("x", "a", json!(1))).unwrap();
        let err = history.submit(Step::after("y", "a", json!(2))).unwrap_err();
        assert!(matches!(err, StepError::PredecessorContended { .. }));

        let adm = history.submit(Step::first("a", json!(0))).unwrap();
        assert_eq!(ids(adm.committed()), vec!["a".into(), "x".into()]);
    }

    #[test]
    fn append_chains_onto_head() {
        let mut history = History::new();
        history.append(1u64.into(), json!("a")).unwrap();
        history.append(2u64.into(), json!("b")).unwrap();
        let snap = history.snapshot();
        assert_eq!(snap[0].previous_id, Predecessor::First);
        assert_eq!(snap[1].previous_id, Predecessor::Step(1u64.into()));
        assert_invariants(&history);
    }

    #[test]
    fn poll_start_resolves_cursors() {
        let mut history = History::new();
        history.append(1u64.into(), json!("a")).unwrap();
        history.append(2u64.into(), json!("b")).unwrap();
        assert_eq!(history.poll_start(&PollCursor::Start), 0);
        assert_eq!(history.poll_start(&PollCursor::AfterIndex(0)), 1);
        assert_eq!(history.poll_start(&PollCursor::AfterId(2u64.into())), 2);
        assert_eq!(history.poll_start(&PollCursor::AfterId(99u64.into())), 0);
    }
}
