// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hub preferences, stored under the `hub` config key.

use serde::{Deserialize, Serialize};
use steplog_config::{ConfigService, ConfigStore};
use steplog_core::HeldConflict;
use steplog_proto::{default_socket_path, wire::DEFAULT_MAX_PAYLOAD};
use tracing::{debug, warn};

/// Config key the hub reads and seeds.
pub const PREFS_KEY: &str = "hub";

/// Tunables for a running hub. Missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubPrefs {
    /// Unix socket the hub listens on.
    pub socket_path: String,
    /// Packets queued per connection before it counts as lagging.
    pub outbox_capacity: usize,
    /// Largest accepted frame payload.
    pub max_frame_bytes: usize,
    /// Two pending steps naming the same missing predecessor.
    pub held_conflict: HeldConflict,
    /// Period of the stalled-step report; 0 turns it off.
    pub stall_report_secs: u64,
}

impl Default for HubPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
            outbox_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_PAYLOAD,
            held_conflict: HeldConflict::default(),
            stall_report_secs: 30,
        }
    }
}

impl HubPrefs {
    /// Load prefs best-effort: any failure falls back to defaults, and the
    /// defaults are written back when no document exists yet.
    pub fn load_or_default<S: ConfigStore>(config: Option<&ConfigService<S>>) -> Self {
        let Some(cfg) = config else {
            debug!("no config store; using default hub prefs");
            return Self::default();
        };
        cfg.load_or_init(PREFS_KEY).unwrap_or_else(|err| {
            warn!(%err, "hub prefs unavailable; using defaults");
            Self::default()
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use steplog_config::MemoryConfigStore;

    #[test]
    fn absent_prefs_are_seeded_with_defaults() {
        let svc = ConfigService::new(MemoryConfigStore::default());
        let prefs = HubPrefs::load_or_default(Some(&svc));
        assert_eq!(prefs, HubPrefs::default());
        let stored: HubPrefs = svc.load(PREFS_KEY).unwrap().unwrap();
        assert_eq!(stored, prefs);
    }

    #[test]
    fn partial_prefs_keep_other_defaults() {
        let store = MemoryConfigStore::default();
        store
            .save_raw(
                PREFS_KEY,
                br#"{"outbox_capacity": 8, "held_conflict": "keep-earlier"}"#,
            )
            .unwrap();
        let svc = ConfigService::new(store);
        let prefs = HubPrefs::load_or_default(Some(&svc));
        assert_eq!(prefs.outbox_capacity, 8);
        assert_eq!(prefs.held_conflict, HeldConflict::KeepEarlier);
        assert_eq!(prefs.stall_report_secs, 30);
    }

    #[test]
    fn corrupt_prefs_fall_back_without_overwriting() {
        let store = MemoryConfigStore::default();
        store.save_raw(PREFS_KEY, b"[1, 2").unwrap();
        let svc = ConfigService::new(store);
        assert_eq!(HubPrefs::load_or_default(Some(&svc)), HubPrefs::default());
        assert_eq!(svc.into_inner().load_raw(PREFS_KEY).unwrap(), b"[1, 2");
    }

    #[test]
    fn no_store_means_defaults() {
        let prefs = HubPrefs::load_or_default::<MemoryConfigStore>(None);
        assert_eq!(prefs.max_frame_bytes, DEFAULT_MAX_PAYLOAD);
    }
}
