// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Step records and their protocol metadata.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::StepError;

/// Caller-assigned step identifier (integer or string on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepId {
    /// Numeric identifier.
    Num(u64),
    /// Textual identifier (UUIDs in the browser client).
    Text(String),
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepId::Num(n) => write!(f, "{n}"),
            StepId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for StepId {
    fn from(n: u64) -> Self {
        StepId::Num(n)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId::Text(s.to_owned())
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        StepId::Text(s)
    }
}

/// Causal predecessor of a step.
///
/// Encoded as `null` for [`Predecessor::First`] and as the bare id otherwise.
/// The field is mandatory: a record without `previousId` does not decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Predecessor {
    /// Sentinel: this step opens the log.
    First,
    /// The step must commit after the step with this id.
    Step(StepId),
}

impl Predecessor {
    /// The awaited id, if any.
    pub fn id(&self) -> Option<&StepId> {
        match self {
            Predecessor::First => None,
            Predecessor::Step(id) => Some(id),
        }
    }
}

impl From<StepId> for Predecessor {
    fn from(id: StepId) -> Self {
        Predecessor::Step(id)
    }
}

impl Serialize for Predecessor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Predecessor::First => serializer.serialize_none(),
            Predecessor::Step(id) => id.serialize(serializer),
        }
    }
}

struct PredecessorVisitor;

impl<'de> Visitor<'de> for PredecessorVisitor {
    type Value = Predecessor;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null, a non-negative integer or a string step id")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Predecessor::First)
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Predecessor::First)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PredecessorVisitor)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(Predecessor::Step(StepId::Num(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(|n| Predecessor::Step(StepId::Num(n)))
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Predecessor::Step(StepId::Text(v.to_owned())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(Predecessor::Step(StepId::Text(v)))
    }
}

impl<'de> Deserialize<'de> for Predecessor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // deserialize_any so an absent field fails instead of reading as `None`.
        deserializer.deserialize_any(PredecessorVisitor)
    }
}

/// One entry of the shared history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Caller-assigned unique id.
    pub id: StepId,
    /// Causal predecessor.
    pub previous_id: Predecessor,
    /// Sequence position, assigned by the store at commit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    /// Opaque domain payload, relayed verbatim.
    pub payload: serde_json::Value,
}

impl Step {
    /// Build an uncommitted step.
    pub fn new(
        id: impl Into<StepId>,
        previous_id: Predecessor,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            previous_id,
            index: None,
            payload,
        }
    }

    /// Uncommitted step that opens the log.
    pub fn first(id: impl Into<StepId>, payload: serde_json::Value) -> Self {
        Self::new(id, Predecessor::First, payload)
    }

    /// Uncommitted step that follows `previous`.
    pub fn after(
        id: impl Into<StepId>,
        previous: impl Into<StepId>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(id, Predecessor::Step(previous.into()), payload)
    }

    /// Structural checks applied before a step reaches the log.
    pub fn validate(&self) -> Result<(), StepError> {
        if let StepId::Text(s) = &self.id {
            if s.is_empty() {
                return Err(StepError::Malformed {
                    reason: "empty step id".into(),
                });
            }
        }
        if self.payload.is_null() {
            return Err(StepError::Malformed {
                reason: format!("step {} has no payload", self.id),
            });
        }
        if self.previous_id.id() == Some(&self.id) {
            return Err(StepError::SelfReferential {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}
