// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Append-only store of committed steps.
//!
//! Steps are addressable by id and by index. Indices are dense: the step at
//! position `i` of the internal order always carries `index == i`, so the
//! total order is the vector order and snapshots never need sorting.

use std::collections::HashMap;

use crate::error::StepError;
use crate::step::{Predecessor, Step, StepId};

/// Committed steps in commit order.
#[derive(Debug, Default, Clone)]
pub struct StepStore {
    order: Vec<Step>,
    by_id: HashMap<StepId, usize>,
}

impl StepStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed steps (also the next index to assign).
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing has been committed yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether `id` is committed.
    pub fn contains(&self, id: &StepId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Committed step by id.
    pub fn get(&self, id: &StepId) -> Option<&Step> {
        self.by_id.get(id).map(|&pos| &self.order[pos])
    }

    /// The designated first step.
    pub fn root(&self) -> Option<&Step> {
        self.order.first()
    }

    /// The most recently committed step.
    pub fn head(&self) -> Option<&Step> {
        self.order.last()
    }

    /// Whether a step naming `previous` may commit right now.
    pub fn admits(&self, previous: &Predecessor) -> bool {
        match previous {
            Predecessor::First => self.is_empty(),
            Predecessor::Step(id) => self.contains(id),
        }
    }

    /// Append `step`, assigning it the next index.
    ///
    /// Any index already on the record is overwritten.
    pub fn commit(&mut self, mut step: Step) -> Result<&Step, StepError> {
        if self.contains(&step.id) {
            return Err(StepError::DuplicateId { id: step.id });
        }
        match &step.previous_id {
            Predecessor::First => {
                if let Some(root) = self.root() {
                    return Err(StepError::RootExists {
                        id: step.id,
                        root: root.id.clone(),
                    });
                }
            }
            Predecessor::Step(previous) => {
                if !self.contains(previous) {
                    return Err(StepError::UnknownPredecessor {
                        previous: previous.clone(),
                        id: step.id,
                    });
                }
            }
        }
        let pos = self.order.len();
        step.index = Some(pos as u64);
        self.by_id.insert(step.id.clone(), pos);
        self.order.push(step);
        Ok(&self.order[pos])
    }

    /// Every committed step, ascending by index.
    pub fn snapshot(&self) -> Vec<Step> {
        self.order.clone()
    }

    /// Committed steps with `index >= from`.
    pub fn since(&self, from: u64) -> Vec<Step> {
        let start = usize::try_from(from).unwrap_or(usize::MAX);
        self.order.get(start..).map(<[Step]>::to_vec).unwrap_or_default()
    }

    /// Committed steps after `id`, or `None` when `id` is not committed.
    pub fn after_id(&self, id: &StepId) -> Option<Vec<Step>> {
        self.by_id
            .get(id)
            .map(|&pos| self.order[pos + 1..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_assigns_dense_indices() {
        let mut store = StepStore::new();
        store.commit(Step::first(1u64, json!(1))).unwrap();
        store.commit(Step::after(2u64, 1u64, json!(2))).unwrap();
        store.commit(Step::after(3u64, 2u64, json!(3))).unwrap();
        let snap = store.snapshot();
        let indices: Vec<_> = snap.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(snap[1].id, StepId::Num(2));
        assert_eq!(store.head().map(|s| s.id.clone()), Some(StepId::Num(3)));
    }

    #[test]
    fn duplicate_commit_is_rejected_and_size_unchanged() {
        let mut store = StepStore::new();
        store.commit(Step::first(1u64, json!("a"))).unwrap();
        let err = store.commit(Step::first(1u64, json!("b"))).unwrap_err();
        assert_eq!(err, StepError::DuplicateId { id: 1u64.into() });
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&1u64.into()).map(|s| &s.payload), Some(&json!("a")));
    }

    #[test]
    fn commit_requires_committed_predecessor() {
        let mut store = StepStore::new();
        let err = store.commit(Step::after(2u64, 1u64, json!({}))).unwrap_err();
        assert!(matches!(err, StepError::UnknownPredecessor { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn only_one_first_step() {
        let mut store = StepStore::new();
        store.commit(Step::first("a", json!({}))).unwrap();
        let err = store.commit(Step::first("b", json!({}))).unwrap_err();
        assert_eq!(
            err,
            StepError::RootExists {
                id: "b".into(),
                root: "a".into()
            }
        );
    }

    #[test]
    fn snapshot_is_idempotent() {
        let mut store = StepStore::new();
        store.commit(Step::first(1u64, json!(1))).unwrap();
        store.commit(Step::after(2u64, 1u64, json!(2))).unwrap();
        assert_eq!(store.snapshot(), store.snapshot());
    }

    #[test]
    fn incremental_queries() {
        let mut store = StepStore::new();
        store.commit(Step::first(1u64, json!(1))).unwrap();
        store.commit(Step::after(2u64, 1u64, json!(2))).unwrap();
        store.commit(Step::after(3u64, 2u64, json!(3))).unwrap();

        let ids = |steps: Vec<Step>| steps.into_iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids(store.since(1)), vec![2u64.into(), 3u64.into()]);
        assert!(store.since(3).is_empty());
        assert!(store.since(u64::MAX).is_empty());
        assert_eq!(store.after_id(&1u64.into()).map(ids), Some(vec![2u64.into(), 3u64.into()]));
        assert_eq!(store.after_id(&3u64.into()).map(ids), Some(vec![]));
        assert_eq!(store.after_id(&9u64.into()), None);
    }
}
