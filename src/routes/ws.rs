//! WebSocket handler — participant connections to the hub.
//!
//! DESIGN
//! ======
//! On upgrade, registers the connection and enters a `select!` loop:
//! - Incoming participant frames → parse + handle → reply to sender
//! - Frames fanned out by the session service → forward to participant
//!
//! Handlers never write to the socket. They return the single frame owed to
//! the sender (`sessionJoined`, `ack`, `pong`, or `error`); broadcasts go
//! through the session service and come back via the connection's channel.
//!
//! LIFECYCLE
//! =========
//! 1. Handshake without a credential → HTTP 401, no upgrade
//! 2. Upgrade → register → send `connectionConfirmed`
//! 3. Frames → handle → reply
//! 4. Close → remove from every session → unregister

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::event::{EventError, SyncCommand};
use crate::frame::{
    self, CONNECTION_CONFIRMED, ERROR, FIELD_CODE, FIELD_MESSAGE, FIELD_SESSION_ID, Frame, JOIN_SESSION,
    LEAVE_SESSION, PING, PONG, SESSION_JOINED, SESSION_LEFT,
};
use crate::services;
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = services::auth::credential_from(params.get("token").map(String::as_str), &headers) {
        warn!(error = %e, "ws: handshake rejected");
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for frames fanned out by the session service.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.client_buffer);
    let client_count = services::session::register(&state, client_id, client_tx).await;

    let welcome = Frame::bare(CONNECTION_CONFIRMED)
        .with_data("connectionId", client_id.to_string())
        .with_data("serverTime", frame::now_ms())
        .with_data("clientCount", client_count);

    if send_frame(&mut socket, &welcome).await.is_ok() {
        info!(%client_id, clients = client_count, "ws: client connected");

        'conn: loop {
            tokio::select! {
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    match msg {
                        Message::Text(text) => {
                            for reply in process_inbound_text(&state, client_id, &text).await {
                                if send_frame(&mut socket, &reply).await.is_err() {
                                    break 'conn;
                                }
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                Some(frame) = client_rx.recv() => {
                    if send_frame(&mut socket, &frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    services::session::disconnect(&state, client_id).await;
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and handle one inbound text frame and return frames for the sender.
///
/// A handler that panics is contained here: the sender gets an error frame
/// and the connection stays up.
async fn process_inbound_text(state: &AppState, client_id: Uuid, text: &str) -> Vec<Frame> {
    let req = match Frame::from_text(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::bare(ERROR)
                .with_data(FIELD_CODE, "E_MALFORMED_EVENT")
                .with_data(FIELD_MESSAGE, format!("invalid json: {e}"))
                .with_data(frame::FIELD_SUCCESS, false);
            return vec![err];
        }
    };

    debug!(%client_id, event = %req.event, "ws: recv frame");

    match AssertUnwindSafe(handle_frame(state, client_id, &req))
        .catch_unwind()
        .await
    {
        Ok(Ok(reply) | Err(reply)) => vec![reply],
        Err(_) => {
            error!(%client_id, event = %req.event, "ws: handler panicked");
            vec![req.error("internal error")]
        }
    }
}

async fn handle_frame(state: &AppState, client_id: Uuid, req: &Frame) -> Result<Frame, Frame> {
    match req.event.as_str() {
        JOIN_SESSION => {
            let session_id = require_session_id(req)?;
            let members = services::session::join_session(state, session_id, client_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Frame::bare(SESSION_JOINED)
                .with_session_id(session_id)
                .with_data("memberCount", members))
        }
        LEAVE_SESSION => {
            let session_id = require_session_id(req)?;
            let was_member = services::session::leave_session(state, session_id, client_id).await;
            Ok(Frame::bare(SESSION_LEFT)
                .with_session_id(session_id)
                .with_data("wasMember", was_member))
        }
        PING => {
            let sessions: Vec<String> = services::session::current_session(state, client_id)
                .await
                .into_iter()
                .collect();
            Ok(Frame::bare(PONG)
                .with_data("timestamp", frame::now_ms())
                .with_data("connectionId", client_id.to_string())
                .with_data("sessions", sessions))
        }
        _ => {
            let command = SyncCommand::from_frame(req).map_err(|e| {
                warn!(%client_id, event = %req.event, error = %e, "ws: rejected malformed event");
                req.error_from(&e)
            })?;
            let dispatched = services::session::dispatch(state, command, req.data.clone()).await;
            Ok(req.ack(Some(dispatched.sync_id.as_str()), dispatched.status, dispatched.recipients))
        }
    }
}

fn require_session_id(req: &Frame) -> Result<&str, Frame> {
    req.session_id()
        .ok_or_else(|| req.error_from(&EventError::MissingField(FIELD_SESSION_ID)))
}

// =============================================================================
// SEND
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match frame.to_text() {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.event == ERROR {
        let code = frame.str_field(FIELD_CODE).unwrap_or("-");
        let message = frame.str_field(FIELD_MESSAGE).unwrap_or("-");
        warn!(code, message, "ws: send error frame");
    } else {
        debug!(event = %frame.event, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
