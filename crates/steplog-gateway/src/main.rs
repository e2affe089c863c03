// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Browser-facing bridge for the steplog hub.
//!
//! WebSocket clients speak JSON events (`step`, `init`, `needSync`); the
//! bridge turns them into framed packets on the hub's Unix socket and turns
//! hub packets back into JSON. Clients without WebSockets use the long-poll
//! routes `GET /history-get/{last_id}` and `POST /history-push`.

use std::{collections::HashSet, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use axum::{
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use clap::Parser;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod http;
mod ws;

#[derive(Parser, Debug)]
#[command(author, version, about = "steplog WebSocket and long-poll gateway")]
struct Args {
    /// TCP listener for browser clients (e.g. 0.0.0.0:8787)
    #[arg(long, default_value = "0.0.0.0:8787")]
    listen: SocketAddr,
    /// Path to the Unix socket exposed by steplog-hub
    #[arg(long, default_value_os_t = steplog_proto::default_socket_path())]
    unix_socket: PathBuf,
    /// Maximum frame payload in bytes, both directions
    #[arg(long, default_value_t = steplog_proto::wire::DEFAULT_MAX_PAYLOAD)]
    max_frame_bytes: usize,
    /// Optional allowed Origin values (repeatable). If none provided, all origins are accepted.
    #[arg(long)]
    allow_origin: Vec<String>,
    /// TLS certificate (PEM). If provided, key must also be provided.
    #[arg(long)]
    tls_cert: Option<PathBuf>,
    /// TLS private key (PEM). If provided, cert must also be provided.
    #[arg(long)]
    tls_key: Option<PathBuf>,
    /// Give up on an idle long-poll after this many seconds (204). Unset waits indefinitely.
    #[arg(long)]
    poll_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug)]
struct AppState {
    unix_socket: PathBuf,
    max_frame_bytes: usize,
    allow_origins: Option<HashSet<String>>,
    poll_timeout: Option<Duration>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let allow_origins = if args.allow_origin.is_empty() {
        None
    } else {
        Some(args.allow_origin.iter().cloned().collect())
    };

    let state = Arc::new(AppState {
        unix_socket: args.unix_socket.clone(),
        max_frame_bytes: args.max_frame_bytes,
        allow_origins,
        poll_timeout: args.poll_timeout_secs.map(Duration::from_secs),
    });

    let app = router(state);

    let handle = Handle::new();
    // graceful shutdown on Ctrl+C
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to install ctrl-c handler");
            return;
        }
        shutdown.shutdown();
    });

    info!(hub = %args.unix_socket.display(), "bridging to steplog hub");
    match (args.tls_cert, args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = load_tls(cert, key).await.context("load tls config")?;
            info!("gateway listening (TLS) on {}", args.listen);
            axum_server::bind_rustls(args.listen, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
        (None, None) => {
            info!("gateway listening on {}", args.listen);
            axum_server::bind(args.listen)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await?;
        }
        _ => {
            return Err(anyhow!(
                "must provide both --tls-cert and --tls-key or neither"
            ))
        }
    }

    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/history-get/{last_id}", get(http::history_get))
        .route("/history-push", post(http::history_push))
        .with_state(state)
}

fn origin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(allow) = &state.allow_origins else {
        return true;
    };
    if let Some(origin) = headers.get("origin") {
        if let Ok(origin_str) = origin.to_str() {
            return allow.contains(origin_str);
        }
    }
    false
}

async fn load_tls(cert_path: PathBuf, key_path: PathBuf) -> Result<RustlsConfig> {
    let cfg = RustlsConfig::from_pem_file(cert_path, key_path).await?;
    Ok(cfg)
}
