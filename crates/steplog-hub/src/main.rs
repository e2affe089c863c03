// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! steplog hub binary: loads prefs, binds the socket and serves.

use std::time::Duration;

use anyhow::{Context, Result};
use steplog_config::{ConfigService, FsConfigStore};
use steplog_hub::{serve, spawn_stall_reporter, HubPrefs, HubState};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Config (best-effort)
    let config = match FsConfigStore::new() {
        Ok(store) => {
            debug!(dir = %store.base().display(), "hub config directory");
            Some(ConfigService::new(store))
        }
        Err(err) => {
            warn!(%err, "no config directory; using default hub prefs");
            None
        }
    };
    let prefs = HubPrefs::load_or_default(config.as_ref());

    let hub = HubState::from_prefs(&prefs).shared();
    if prefs.stall_report_secs > 0 {
        spawn_stall_reporter(hub.clone(), Duration::from_secs(prefs.stall_report_secs));
    }

    // Remove stale socket if present
    let socket_path = prefs.socket_path.clone();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding hub socket {socket_path}"))?;
    info!(
        outbox = prefs.outbox_capacity,
        held_conflict = ?prefs.held_conflict,
        "steplog hub listening at {}",
        socket_path
    );

    tokio::select! {
        res = serve(listener, hub, prefs.max_frame_bytes) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
