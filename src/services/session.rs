//! Session membership, dedup-gated dispatch, and termination.
//!
//! DESIGN
//! ======
//! Sessions are created implicitly by the first join and live until an
//! explicit `endSession`. A session survives zero members: participants on a
//! flaky link drop out and rejoin without losing the dedup record.
//!
//! A connection belongs to at most one session. Joining another session
//! parts the previous one first.
//!
//! Dispatch checks the dedup record and fans out under the same `sessions`
//! write lock, so two copies of one event can never both pass the check.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dedup::DedupEntry;
use crate::event::{EventId, EventKind, EventMeta, SyncCommand};
use crate::frame::{self, AckStatus, Data, FIELD_ID, FIELD_TIMESTAMP, Frame, SESSION_ENDED};
use crate::state::{AppState, ConnectedClient, SessionState};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection not registered: {0}")]
    UnknownClient(Uuid),
}

impl crate::frame::ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownClient(_) => "E_UNKNOWN_CLIENT",
        }
    }
}

/// Result of one dispatched command, echoed back in the sender's `ack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub sync_id: EventId,
    pub status: AckStatus,
    pub recipients: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub members: usize,
    pub recorded_events: usize,
}

/// Point-in-time view of the hub for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSnapshot {
    pub connected: usize,
    pub sessions: Vec<SessionSummary>,
    pub timestamp: i64,
}

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Register a new connection. Returns the number of connected clients.
pub async fn register(state: &AppState, client_id: Uuid, tx: mpsc::Sender<Frame>) -> usize {
    let mut clients = state.clients.write().await;
    clients.insert(client_id, ConnectedClient { tx, session_id: None, connected_at: frame::now_ms() });
    clients.len()
}

/// Remove a connection from every session and from the registry.
/// Sessions and their dedup records are kept.
pub async fn disconnect(state: &AppState, client_id: Uuid) {
    let mut sessions = state.sessions.write().await;
    for (session_id, session) in sessions.iter_mut() {
        if session.members.remove(&client_id).is_some() {
            info!(%session_id, %client_id, remaining = session.members.len(), "member disconnected");
        }
    }
    state.clients.write().await.remove(&client_id);
}

/// Id of the session a connection currently belongs to.
pub async fn current_session(state: &AppState, client_id: Uuid) -> Option<String> {
    state
        .clients
        .read()
        .await
        .get(&client_id)
        .and_then(|c| c.session_id.clone())
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Add a connection to a session, creating the session if needed.
/// Idempotent. Returns the member count after joining.
///
/// # Errors
///
/// Returns `UnknownClient` if the connection was never registered.
pub async fn join_session(state: &AppState, session_id: &str, client_id: Uuid) -> Result<usize, SessionError> {
    let mut sessions = state.sessions.write().await;
    let mut clients = state.clients.write().await;
    let client = clients
        .get_mut(&client_id)
        .ok_or(SessionError::UnknownClient(client_id))?;

    if let Some(previous) = client.session_id.replace(session_id.to_owned()) {
        if previous != session_id {
            if let Some(old) = sessions.get_mut(&previous) {
                old.members.remove(&client_id);
                info!(session_id = %previous, %client_id, remaining = old.members.len(), "member moved to another session");
            }
        }
    }

    let capacity = state.config.dedup_capacity;
    let session = sessions
        .entry(session_id.to_owned())
        .or_insert_with(|| SessionState::new(capacity));
    session.members.insert(client_id, client.tx.clone());
    info!(%session_id, %client_id, members = session.members.len(), "member joined session");
    Ok(session.members.len())
}

/// Remove a connection from one session. Returns whether it was a member.
pub async fn leave_session(state: &AppState, session_id: &str, client_id: Uuid) -> bool {
    let mut sessions = state.sessions.write().await;
    let removed = sessions
        .get_mut(session_id)
        .is_some_and(|s| s.members.remove(&client_id).is_some());

    let mut clients = state.clients.write().await;
    if let Some(client) = clients.get_mut(&client_id) {
        if client.session_id.as_deref() == Some(session_id) {
            client.session_id = None;
        }
    }
    if removed {
        info!(%session_id, %client_id, "member left session");
    }
    removed
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Dedup a leader command and fan its payload out to the session.
///
/// `payload` is the command's data exactly as received; accepted payloads are
/// broadcast unchanged apart from a hub-stamped id when the sender sent none.
/// A command for a session that does not exist reaches nobody and creates no
/// state.
pub async fn dispatch(state: &AppState, command: SyncCommand, mut payload: Data) -> Dispatched {
    let kind = command.event.kind();
    let meta = match command.meta {
        Some(meta) => meta,
        None => {
            let stamped = EventMeta::fresh(kind);
            payload.insert(FIELD_ID.into(), stamped.id.as_str().into());
            payload
                .entry(FIELD_TIMESTAMP)
                .or_insert_with(|| stamped.timestamp.into());
            stamped
        }
    };
    let is_hedge = meta.is_backup || meta.id.original().is_some();
    let session_id = command.session_id;

    let mut sessions = state.sessions.write().await;
    let Some(session) = sessions.get_mut(&session_id) else {
        debug!(%session_id, event = kind.command(), "dispatch to unknown session");
        return Dispatched { sync_id: meta.id, status: AckStatus::Broadcasted, recipients: 0 };
    };

    let verdict = session
        .dedup
        .check(&meta.id, is_hedge, DedupEntry::new(Some(kind), payload.clone()));
    if !verdict.is_accepted() {
        debug!(%session_id, sync_id = %meta.id, ?verdict, "duplicate event suppressed");
        return Dispatched { sync_id: meta.id, status: verdict.ack_status(), recipients: 0 };
    }

    let recipients = if kind == EventKind::SessionEnd {
        let mut clients = state.clients.write().await;
        close_session(&mut sessions, &mut clients, &session_id)
    } else {
        fan_out(&session.members, &Frame::new(kind.broadcast(), payload))
    };
    info!(%session_id, sync_id = %meta.id, event = kind.broadcast(), recipients, "event broadcast");
    Dispatched { sync_id: meta.id, status: AckStatus::Broadcasted, recipients }
}

/// Broadcast `sessionEnded` and drop the session's membership and dedup
/// record. Returns the number of members notified.
pub async fn terminate(state: &AppState, session_id: &str) -> usize {
    let mut sessions = state.sessions.write().await;
    let mut clients = state.clients.write().await;
    close_session(&mut sessions, &mut clients, session_id)
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

pub async fn snapshot(state: &AppState) -> HubSnapshot {
    let sessions = state.sessions.read().await;
    let connected = state.clients.read().await.len();

    let mut summaries: Vec<SessionSummary> = sessions
        .iter()
        .map(|(session_id, s)| SessionSummary {
            session_id: session_id.clone(),
            members: s.members.len(),
            recorded_events: s.dedup.len(),
        })
        .collect();
    summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    HubSnapshot { connected, sessions: summaries, timestamp: frame::now_ms() }
}

// =============================================================================
// HELPERS
// =============================================================================

fn close_session(
    sessions: &mut HashMap<String, SessionState>,
    clients: &mut HashMap<Uuid, ConnectedClient>,
    session_id: &str,
) -> usize {
    let Some(session) = sessions.remove(session_id) else {
        return 0;
    };

    let ended = Frame::bare(SESSION_ENDED).with_session_id(session_id);
    let notified = fan_out(&session.members, &ended);

    for client_id in session.members.keys() {
        if let Some(client) = clients.get_mut(client_id) {
            if client.session_id.as_deref() == Some(session_id) {
                client.session_id = None;
            }
        }
    }
    info!(%session_id, notified, "session terminated");
    notified
}

/// Best-effort: a full or closed member channel is skipped, not awaited.
fn fan_out(members: &HashMap<Uuid, mpsc::Sender<Frame>>, frame: &Frame) -> usize {
    let mut delivered = 0;
    for (client_id, tx) in members {
        match tx.try_send(frame.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(%client_id, event = %frame.event, error = %e, "dropped frame for member"),
        }
    }
    delivered
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
