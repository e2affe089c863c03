// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rejection reasons for step admission.

use thiserror::Error;

use crate::step::StepId;

/// Why a step was refused by the log.
///
/// None of these leave the log in a partial state: a rejected step is never
/// committed, buffered or broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Missing or unusable fields.
    #[error("malformed step: {reason}")]
    Malformed {
        /// What was wrong with the record.
        reason: String,
    },
    /// The id is already committed or already waiting in the reorder buffer.
    #[error("duplicate step id {id}")]
    DuplicateId {
        /// Offending id.
        id: StepId,
    },
    /// `previousId == id`.
    #[error("step {id} names itself as its predecessor")]
    SelfReferential {
        /// Offending id.
        id: StepId,
    },
    /// Following pending predecessors from this step leads back to it.
    #[error("step {id} closes a predecessor cycle through pending step {via}")]
    CyclicPredecessor {
        /// Offending id.
        id: StepId,
        /// The pending step the cycle passes through.
        via: StepId,
    },
    /// A step claimed to open the log after the log already has a first step.
    #[error("step {id} claims to open the log, which already starts at {root}")]
    RootExists {
        /// Offending id.
        id: StepId,
        /// Id of the committed first step.
        root: StepId,
    },
    /// Direct store commit whose predecessor is not committed.
    #[error("predecessor {previous} of step {id} is not committed")]
    UnknownPredecessor {
        /// Offending id.
        id: StepId,
        /// The missing predecessor.
        previous: StepId,
    },
    /// Another pending step already waits on the same predecessor and the
    /// buffer keeps the earlier one.
    #[error("step {id} contends for predecessor {previous}, already awaited by {holder}")]
    PredecessorContended {
        /// Offending id.
        id: StepId,
        /// The awaited predecessor.
        previous: StepId,
        /// The pending step that keeps the slot.
        holder: StepId,
    },
}

impl StepError {
    /// Numeric code carried in protocol error payloads.
    pub fn code(&self) -> u32 {
        match self {
            StepError::Malformed { .. } => 3,
            StepError::DuplicateId { .. } => 10,
            StepError::SelfReferential { .. } => 11,
            StepError::CyclicPredecessor { .. } => 12,
            StepError::RootExists { .. } => 13,
            StepError::UnknownPredecessor { .. } => 14,
            StepError::PredecessorContended { .. } => 15,
        }
    }

    /// Stable identifier carried in protocol error payloads.
    pub fn name(&self) -> &'static str {
        match self {
            StepError::Malformed { .. } => "E_MALFORMED_STEP",
            StepError::DuplicateId { .. } => "E_DUPLICATE_ID",
            StepError::SelfReferential { .. } => "E_SELF_REFERENTIAL",
            StepError::CyclicPredecessor { .. } => "E_CYCLIC_PREVIOUS",
            StepError::RootExists { .. } => "E_ROOT_EXISTS",
            StepError::UnknownPredecessor { .. } => "E_UNKNOWN_PREDECESSOR",
            StepError::PredecessorContended { .. } => "E_PREDECESSOR_CONTENDED",
        }
    }

    /// The id of the rejected step, when the record got far enough to have one.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            StepError::Malformed { .. } => None,
            StepError::DuplicateId { id }
            | StepError::SelfReferential { id }
            | StepError::CyclicPredecessor { id, .. }
            | StepError::RootExists { id, .. }
            | StepError::UnknownPredecessor { id, .. }
            | StepError::PredecessorContended { id, .. } => Some(id),
        }
    }
}
