// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bootstrap and resync: how a client obtains the authoritative log.
//!
//! The first client to bootstrap an empty log defines it; everyone after
//! that is answered with the committed snapshot and must replace their local
//! copy wholesale.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::StepError;
use crate::history::{Admission, History, Origin};
use crate::step::{Step, StepId};

/// Process lifecycle: `Empty → Seeded → Steady`, never back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing committed; the next bootstrap defines the log.
    #[default]
    Empty,
    /// A bootstrap committed the initial history.
    Seeded,
    /// Live submissions are committing.
    Steady,
}

impl Phase {
    pub(crate) fn after_commit(self, origin: Origin) -> Phase {
        match (self, origin) {
            (Phase::Empty, Origin::Seed) => Phase::Seeded,
            (_, Origin::Live) => Phase::Steady,
            (phase, Origin::Seed) => phase,
        }
    }

    /// Whether bootstraps are answered with a snapshot instead of seeding.
    pub fn is_settled(self) -> bool {
        !matches!(self, Phase::Empty)
    }
}

/// What a seeding bootstrap did with each claimed step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedReport {
    /// Committed steps, in commit order (fan these out).
    pub committed: Vec<Step>,
    /// Claimed steps left waiting on a predecessor.
    pub held: Vec<StepId>,
    /// Claimed steps refused, with the reason.
    pub rejected: Vec<StepError>,
}

/// Answer to a bootstrap request.
#[derive(Debug, Clone, PartialEq)]
pub enum Bootstrap {
    /// The log was empty and has been seeded from the claim.
    Seeded(SeedReport),
    /// The log already exists; the claim was ignored. Send this snapshot to
    /// the requesting client.
    Synchronize(Vec<Step>),
}

impl History {
    /// Handle a newly connected client's claimed history.
    pub fn bootstrap(&mut self, incoming: Vec<Step>) -> Bootstrap {
        if self.phase.is_settled() {
            return Bootstrap::Synchronize(self.snapshot());
        }
        let mut report = SeedReport::default();
        for step in incoming {
            let id = step.id.clone();
            match self.admit(step, Origin::Seed) {
                Ok(Admission::Committed(steps)) => report.committed.extend(steps),
                Ok(Admission::Held(_)) => report.held.push(id),
                Err(err) => {
                    warn!(%err, "bootstrap step rejected");
                    report.rejected.push(err);
                }
            }
        }
        // later claims may have drained or displaced earlier held ones
        report.held.retain(|id| self.buffer.contains(id));
        info!(
            committed = report.committed.len(),
            held = report.held.len(),
            rejected = report.rejected.len(),
            phase = ?self.phase,
            "history seeded from bootstrap"
        );
        Bootstrap::Seeded(report)
    }

    /// The authoritative snapshot, whatever the phase.
    pub fn resync(&self) -> Vec<Step> {
        self.snapshot()
    }
}
