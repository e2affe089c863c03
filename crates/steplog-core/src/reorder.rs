// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Causal reorder buffer: steps parked until their predecessor commits.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StepError;
use crate::step::{Step, StepId};

/// What happens when a second step waits on a predecessor that already has a
/// pending step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeldConflict {
    /// The newcomer takes the slot; the earlier step is dropped and returned.
    #[default]
    ReplaceEarlier,
    /// The earlier step keeps the slot; the newcomer is rejected.
    KeepEarlier,
}

/// Outcome of parking a step.
#[derive(Debug, Clone, PartialEq)]
pub struct Held {
    /// The predecessor the step waits on.
    pub awaiting: StepId,
    /// Earlier step evicted from the same slot under [`HeldConflict::ReplaceEarlier`].
    pub displaced: Option<Step>,
}

/// Pending steps keyed by the predecessor they wait on.
#[derive(Debug, Default, Clone)]
pub struct ReorderBuffer {
    // awaited predecessor -> pending step
    waiting: HashMap<StepId, Step>,
    // pending step id -> awaited predecessor
    awaiting: HashMap<StepId, StepId>,
    policy: HeldConflict,
}

impl ReorderBuffer {
    /// Empty buffer with the given conflict policy.
    pub fn new(policy: HeldConflict) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Number of pending steps.
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Whether a step with this id is pending.
    pub fn contains(&self, id: &StepId) -> bool {
        self.awaiting.contains_key(id)
    }

    /// The pending step waiting on `previous`.
    pub fn waiting_on(&self, previous: &StepId) -> Option<&Step> {
        self.waiting.get(previous)
    }

    /// Predecessor ids that pending steps are waiting on, sorted.
    pub fn awaited(&self) -> Vec<StepId> {
        let mut ids: Vec<StepId> = self.waiting.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Park `step` until `awaiting` commits.
    ///
    /// Rejects steps that would close a cycle through pending steps, since
    /// such a chain can never drain.
    pub fn hold(&mut self, awaiting: StepId, step: Step) -> Result<Held, StepError> {
        if let Some(via) = self.closes_cycle(&step.id, &awaiting) {
            return Err(StepError::CyclicPredecessor { id: step.id, via });
        }
        let holder = self.waiting.get(&awaiting).map(|s| s.id.clone());
        let displaced = match (holder, self.policy) {
            (None, _) => None,
            (Some(holder), HeldConflict::KeepEarlier) => {
                return Err(StepError::PredecessorContended {
                    id: step.id,
                    previous: awaiting,
                    holder,
                });
            }
            (Some(holder), HeldConflict::ReplaceEarlier) => {
                self.awaiting.remove(&holder);
                self.waiting.remove(&awaiting)
            }
        };
        self.awaiting.insert(step.id.clone(), awaiting.clone());
        self.waiting.insert(awaiting.clone(), step);
        Ok(Held {
            awaiting,
            displaced,
        })
    }

    /// Remove and return the step waiting on `committed`.
    pub fn take_waiting_on(&mut self, committed: &StepId) -> Option<Step> {
        let step = self.waiting.remove(committed)?;
        self.awaiting.remove(&step.id);
        Some(step)
    }

    // Walk pending predecessors from `awaiting`; hitting `id` means a cycle.
    fn closes_cycle(&self, id: &StepId, awaiting: &StepId) -> Option<StepId> {
        let mut cur = awaiting;
        for _ in 0..=self.awaiting.len() {
            if cur == id {
                return Some(awaiting.clone());
            }
            match self.awaiting.get(cur) {
                Some(next) => cur = next,
                None => return None,
            }
        }
        None
    }
}
