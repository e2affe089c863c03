// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! WebSocket ↔ Unix socket bridge: one hub connection per browser socket.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Result};
use axum::body::Bytes;
use axum::{
    extract::ws::{CloseFrame, Message, WebSocket},
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use steplog_client::CLIENT_VERSION;
use steplog_proto::{
    json::{ClientEvent, ServerEvent},
    wire::{decode_message, encode_message, try_extract_frame, OVERHEAD_BYTES},
    ErrorPayload, HandshakePayload, Message as HubMessage,
};
use tokio::task::JoinError;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::mpsc,
    time::{self, Duration},
};
use tracing::{debug, error, warn};

use crate::{origin_allowed, AppState};

type TaskResult<T> = std::result::Result<T, JoinError>;

pub(crate) async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !origin_allowed(&state, &headers) {
        let origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("<missing>");
        warn!(?addr, origin = %origin, "origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

fn close_with(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::ERROR,
        reason: reason.into(),
    }))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, peer: SocketAddr) {
    let socket_path = state.unix_socket.clone();
    let unix = match time::timeout(Duration::from_secs(2), UnixStream::connect(&socket_path)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            error!(?err, path = %socket_path.display(), "failed to connect to unix socket");
            let _ = socket.send(close_with("upstream unavailable")).await;
            return;
        }
        Err(_) => {
            warn!(
                ?peer,
                path = %socket_path.display(),
                "timed out connecting to unix socket"
            );
            let _ = socket.send(close_with("upstream connect timeout")).await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut uds_reader, mut uds_writer) = tokio::io::split(unix);
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    // Writer task: WS outbound messages (JSON events, pongs)
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // UDS -> WS task: unframe hub packets and forward the browser-facing ones
    let max_len = state.max_frame_bytes;
    let out_tx_clone = out_tx.clone();
    let uds_to_ws = tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
        let max_acc = max_len
            .saturating_add(OVERHEAD_BYTES)
            .saturating_add(buf.len());
        loop {
            let n = uds_reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            acc.extend_from_slice(&buf[..n]);
            if acc.len() > max_acc {
                return Err(anyhow!(
                    "accumulator overflow ({} > {}): malformed upstream framing",
                    acc.len(),
                    max_acc
                ));
            }
            while let Some(pkt) = try_extract_frame(&mut acc, max_len)? {
                let Some(text) = packet_to_text(&pkt)? else {
                    continue;
                };
                if out_tx_clone.send(Message::Text(text.into())).await.is_err() {
                    return Ok::<(), anyhow::Error>(());
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    // WS -> UDS task: introduce the browser, then translate its events
    let max_len_ws = state.max_frame_bytes;
    let reply_tx = out_tx.clone();
    let ws_to_uds = tokio::spawn(async move {
        let hello = HubMessage::Handshake(HandshakePayload {
            agent_id: Some(format!("ws:{peer}")),
            client_version: CLIENT_VERSION,
        });
        match encode_message(&hello, 0) {
            Ok(pkt) => {
                if let Err(err) = uds_writer.write_all(&pkt).await {
                    warn!(?err, "failed to write to uds");
                    return;
                }
            }
            Err(err) => {
                error!(?err, "could not encode handshake");
                return;
            }
        }
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => match client_text_to_packet(text.as_str(), max_len_ws) {
                    Ok(pkt) => {
                        if let Err(err) = uds_writer.write_all(&pkt).await {
                            warn!(?err, "failed to write to uds");
                            break;
                        }
                    }
                    Err(refusal) => {
                        debug!(?peer, message = %refusal.message, "refusing browser event");
                        if let Ok(text) = serde_json::to_string(&ServerEvent::Error(refusal)) {
                            let _ = reply_tx.send(Message::Text(text.into())).await;
                        }
                    }
                },
                Ok(Message::Ping(payload)) => {
                    let _ = reply_tx.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => {
                    warn!(?peer, "ignoring binary frame; events are JSON text");
                    break;
                }
                Err(err) => {
                    warn!(?err, ?peer, "ws recv error");
                    break;
                }
                Ok(Message::Pong(_)) => {}
            }
        }
    });

    // Optional ping loop to keep connections alive.
    let ping_tx = out_tx.clone();
    let ping = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(30));
        // tokio::time::interval() ticks immediately; discard the first tick so we
        // don't ping before the handshake has a chance to settle.
        interval.tick().await;
        loop {
            interval.tick().await;
            if ping_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                break;
            }
        }
    });

    enum EndReason {
        Client(TaskResult<()>),
        Upstream(TaskResult<Result<(), anyhow::Error>>),
        Writer(TaskResult<()>),
    }

    let mut ws_to_uds = ws_to_uds;
    let mut uds_to_ws = uds_to_ws;
    let mut writer = writer;

    let reason: EndReason = tokio::select! {
        res = &mut ws_to_uds => EndReason::Client(res),
        res = &mut uds_to_ws => EndReason::Upstream(res),
        res = &mut writer => EndReason::Writer(res),
    };

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum EndKind {
        Client,
        Upstream,
        Writer,
    }

    let end_kind = match &reason {
        EndReason::Client(_) => EndKind::Client,
        EndReason::Upstream(_) => EndKind::Upstream,
        EndReason::Writer(_) => EndKind::Writer,
    };

    if matches!(end_kind, EndKind::Upstream) {
        // the hub closes lagging connections; the browser must reconnect and resync
        warn!(?peer, "upstream disconnected; closing websocket");
        let _ = time::timeout(
            Duration::from_millis(250),
            out_tx.send(close_with("upstream disconnected")),
        )
        .await;
    }

    // Stop background tasks so handle_socket doesn't hang if one side exits early.
    ping.abort();
    ws_to_uds.abort();
    uds_to_ws.abort();
    drop(out_tx);

    // Best-effort flush for the close frame; force-cancel on slow/broken clients.
    if !matches!(end_kind, EndKind::Writer) {
        match time::timeout(Duration::from_secs(1), &mut writer).await {
            Ok(res) => log_void_task_result("writer", peer, res),
            Err(_) => {
                writer.abort();
                log_void_task_result("writer", peer, writer.await);
            }
        }
    }

    match reason {
        EndReason::Client(res) => log_void_task_result("ws_to_uds", peer, res),
        EndReason::Upstream(res) => log_result_task_result("uds_to_ws", peer, res),
        EndReason::Writer(res) => log_void_task_result("writer", peer, res),
    }

    // Await the aborted tasks to surface panics (cancellation is expected).
    log_void_task_result("ping", peer, ping.await);
    match end_kind {
        EndKind::Client => {
            log_result_task_result("uds_to_ws", peer, uds_to_ws.await);
        }
        EndKind::Upstream => {
            log_void_task_result("ws_to_uds", peer, ws_to_uds.await);
        }
        EndKind::Writer => {
            log_void_task_result("ws_to_uds", peer, ws_to_uds.await);
            log_result_task_result("uds_to_ws", peer, uds_to_ws.await);
        }
    }
}

/// Browser JSON event → hub packet. `Err` carries the refusal for the browser.
fn client_text_to_packet(text: &str, max_frame_bytes: usize) -> Result<Vec<u8>, ErrorPayload> {
    let event: ClientEvent = serde_json::from_str(text)
        .map_err(|err| ErrorPayload::bad_request(format!("unreadable event: {err}")))?;
    let pkt = encode_message(&HubMessage::from(event), 0)
        .map_err(|err| ErrorPayload::bad_request(err.to_string()))?;
    if pkt.len() > max_frame_bytes.saturating_add(OVERHEAD_BYTES) {
        return Err(ErrorPayload::bad_request(format!(
            "event exceeds {max_frame_bytes} bytes"
        )));
    }
    Ok(pkt)
}

/// Hub packet → browser JSON text, or `None` for messages browsers never see.
fn packet_to_text(pkt: &[u8]) -> Result<Option<String>> {
    let (msg, _ts, _) = decode_message(pkt)?;
    match ServerEvent::from_message(msg) {
        Some(event) => Ok(Some(serde_json::to_string(&event)?)),
        None => Ok(None),
    }
}

fn log_void_task_result(name: &'static str, peer: SocketAddr, res: TaskResult<()>) {
    match res {
        Ok(()) => {}
        Err(err) => log_join_error(name, peer, err),
    }
}

fn log_result_task_result(
    name: &'static str,
    peer: SocketAddr,
    res: TaskResult<Result<(), anyhow::Error>>,
) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(?peer, ?err, "{name} task returned error"),
        Err(err) => log_join_error(name, peer, err),
    }
}

fn log_join_error(name: &'static str, peer: SocketAddr, err: JoinError) {
    if err.is_cancelled() {
        return;
    }
    if err.is_panic() {
        error!(?peer, ?err, "{name} task panicked");
    } else {
        warn!(?peer, ?err, "{name} task failed");
    }
}
