// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Unix-socket accept loop and per-connection tasks.

use std::time::Duration;

use anyhow::Result;
use steplog_core::ConnId;
use steplog_proto::{
    wire::{decode_message, peek_op, try_extract_frame, WireError},
    ErrorPayload,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::{handle_message, SharedHub};

/// Accept clients forever, one task per connection.
pub async fn serve(listener: UnixListener, hub: SharedHub, max_frame_bytes: usize) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let hub_state = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, hub_state, max_frame_bytes).await {
                warn!(?err, "client handler error");
            }
        });
    }
}

/// Drive one client until it disconnects or sends something unreadable.
pub async fn handle_client(stream: UnixStream, hub: SharedHub, max_frame_bytes: usize) -> Result<()> {
    let (mut reader, writer) = tokio::io::split(stream);

    let (conn_id, mut rx) = hub.lock().await.connect();
    debug!(conn = conn_id, "client connected");

    // writer task: ends once every sender for this outbox is gone
    tokio::spawn(async move {
        let mut ws = writer;
        while let Some(buf) = rx.recv().await {
            if ws.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = ws.shutdown().await;
    });

    let res = read_frames(&mut reader, conn_id, &hub, max_frame_bytes).await;

    hub.lock().await.disconnect(conn_id);
    debug!(conn = conn_id, "client disconnected");
    res
}

async fn read_frames<R>(
    reader: &mut R,
    conn_id: ConnId,
    hub: &SharedHub,
    max_frame_bytes: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut read_buf: Vec<u8> = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = reader.read(&mut read_buf).await?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&read_buf[..n]);

        // process as many frames as available
        loop {
            let packet = match try_extract_frame(&mut acc, max_frame_bytes) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(err) => {
                    warn!(conn = conn_id, %err, "unframeable input; dropping connection");
                    return Ok(());
                }
            };
            match decode_message(&packet) {
                Ok((msg, _ts, _used)) => {
                    if let Err(err) = handle_message(msg, conn_id, hub).await {
                        warn!(?err, "dropping connection {}", conn_id);
                        return Ok(());
                    }
                }
                // the frame itself was sound; only its body is bad
                Err(err @ (WireError::Decode(_) | WireError::UnknownOp(_))) => {
                    info!(conn = conn_id, %err, "refusing undecodable message");
                    let mut refusal = ErrorPayload::bad_request(err.to_string());
                    if let Some(op) = peek_op(&packet) {
                        refusal = refusal.answering(op);
                    }
                    hub.lock().await.refuse(conn_id, refusal)?;
                }
                Err(err) => {
                    warn!(conn = conn_id, %err, "failed to decode packet");
                    return Ok(());
                }
            }
        }
    }
}

/// Periodically log steps still waiting on a predecessor.
pub fn spawn_stall_reporter(hub: SharedHub, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let h = hub.lock().await;
            let history = h.history();
            let pending = history.pending_len();
            if pending > 0 {
                let awaited = history.buffer().awaited();
                warn!(
                    pending,
                    awaited = ?awaited.iter().take(8).collect::<Vec<_>>(),
                    committed = history.len(),
                    "steps are waiting on predecessors that have not arrived"
                );
            }
        }
    })
}
