// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Long-poll HTTP routes, each request on its own hub connection.
//!
//! Dropping a request future (the HTTP client went away) drops its hub
//! connection, which cancels the parked poll on the hub side.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use steplog_client::{ClientError, SessionClient};
use steplog_proto::{PollCursor, PushAckPayload, PushStatus, PushStepPayload, StepId};
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::{origin_allowed, AppState};

/// Code the hub uses for malformed steps.
const MALFORMED_CODE: u32 = 3;

/// `GET /history-get/{last_id}`: committed steps after `last_id`, held open
/// until there is at least one. `0` means "from the beginning".
pub(crate) async fn history_get(
    State(state): State<Arc<AppState>>,
    Path(last_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let cursor = cursor_for(&last_id);
    let mut client = match connect(&state).await {
        Ok(client) => client,
        Err(resp) => return resp,
    };
    let poll = client.poll_since(cursor);
    let res = match state.poll_timeout {
        Some(limit) => match time::timeout(limit, poll).await {
            Ok(res) => res,
            Err(_) => {
                debug!(%last_id, "long-poll timed out");
                return StatusCode::NO_CONTENT.into_response();
            }
        },
        None => poll.await,
    };
    match res {
        Ok(steps) => Json(steps).into_response(),
        Err(err) => upstream_failure(&err),
    }
}

/// `POST /history-push`: append one step and report what happened to it.
pub(crate) async fn history_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(push): Json<PushStepPayload>,
) -> Response {
    if !origin_allowed(&state, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let mut client = match connect(&state).await {
        Ok(client) => client,
        Err(resp) => return resp,
    };
    match client.push_step(push).await {
        Ok(ack) => (push_status_code(&ack), Json(ack)).into_response(),
        Err(err) => upstream_failure(&err),
    }
}

fn cursor_for(last_id: &str) -> PollCursor {
    match last_id {
        "" | "0" => PollCursor::Start,
        id => PollCursor::AfterId(
            id.parse::<u64>()
                .map_or_else(|_| StepId::from(id), StepId::from),
        ),
    }
}

fn push_status_code(ack: &PushAckPayload) -> StatusCode {
    match ack.status {
        PushStatus::Committed => StatusCode::OK,
        PushStatus::Held => StatusCode::ACCEPTED,
        PushStatus::Rejected => match &ack.error {
            Some(err) if err.code == MALFORMED_CODE => StatusCode::BAD_REQUEST,
            _ => StatusCode::CONFLICT,
        },
    }
}

async fn connect(state: &AppState) -> Result<SessionClient, Response> {
    match time::timeout(
        Duration::from_secs(2),
        SessionClient::connect(&state.unix_socket),
    )
    .await
    {
        Ok(Ok(client)) => Ok(client.with_max_frame_bytes(state.max_frame_bytes)),
        Ok(Err(err)) => {
            warn!(%err, path = %state.unix_socket.display(), "failed to connect to unix socket");
            Err(StatusCode::BAD_GATEWAY.into_response())
        }
        Err(_) => {
            warn!(path = %state.unix_socket.display(), "timed out connecting to unix socket");
            Err(StatusCode::GATEWAY_TIMEOUT.into_response())
        }
    }
}

fn upstream_failure(err: &ClientError) -> Response {
    match err {
        ClientError::Refused(refusal) => {
            (StatusCode::BAD_REQUEST, Json(refusal.clone())).into_response()
        }
        other => {
            warn!(%other, "hub request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
