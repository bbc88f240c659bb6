//! Frame — the wire envelope for every hub/participant message.
//!
//! ARCHITECTURE
//! ============
//! Every WebSocket text message is one Frame: an event name plus a flat JSON
//! object payload. Participants send commands (`syncLine`, `joinSession`, ...),
//! the hub answers with replies (`sessionJoined`, `ack`, `error`) and fans out
//! broadcasts (`lineUpdated`, `sessionEnded`, ...).
//!
//! DESIGN
//! ======
//! - Flat data: payload is always a JSON object, never a bare scalar.
//! - The hub forwards accepted sync payloads verbatim, so `data` is kept as
//!   an untyped map here. Typed views live in `event` and `net::reply`.
//! - Errors that reach the wire implement `ErrorCode` so clients can match on
//!   a grepable code instead of message text.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// =============================================================================
// EVENT NAMES
// =============================================================================

pub const JOIN_SESSION: &str = "joinSession";
pub const LEAVE_SESSION: &str = "leaveSession";
pub const SESSION_JOINED: &str = "sessionJoined";
pub const SESSION_LEFT: &str = "sessionLeft";
pub const END_SESSION: &str = "endSession";
pub const SESSION_ENDED: &str = "sessionEnded";
pub const CONNECTION_CONFIRMED: &str = "connectionConfirmed";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const ACK: &str = "ack";
pub const ERROR: &str = "error";

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

pub const FIELD_SESSION_ID: &str = "sessionId";
pub const FIELD_ID: &str = "id";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_IS_BACKUP: &str = "isBackup";
pub const FIELD_EVENT: &str = "event";
pub const FIELD_MESSAGE: &str = "message";
pub const FIELD_CODE: &str = "code";
pub const FIELD_RETRYABLE: &str = "retryable";
pub const FIELD_SUCCESS: &str = "success";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = serde_json::Map<String, serde_json::Value>;

/// The universal message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Data,
}

/// How the hub disposed of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// First receipt: payload was fanned out to the session.
    Broadcasted,
    /// Exact id already processed.
    Duplicate,
    /// Hedge copy whose original was already processed.
    DuplicateBackup,
}

impl AckStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Broadcasted => "broadcasted",
            Self::Duplicate => "duplicate",
            Self::DuplicateBackup => "duplicate_backup",
        }
    }

    #[must_use]
    pub fn is_duplicate(self) -> bool {
        !matches!(self, Self::Broadcasted)
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Data) -> Self {
        Self { event: event.into(), data }
    }

    /// Frame with an empty payload.
    pub fn bare(event: impl Into<String>) -> Self {
        Self::new(event, Data::new())
    }

    /// Acknowledge this command back to its sender. Duplicates are
    /// acknowledged as success: hedge copies rely on that being non-fatal.
    #[must_use]
    pub fn ack(&self, sync_id: Option<&str>, status: AckStatus, recipients: usize) -> Self {
        Self::bare(ACK)
            .with_data(FIELD_EVENT, self.event.clone())
            .with_data("syncId", sync_id.map_or(serde_json::Value::Null, |id| id.into()))
            .with_data("status", status.as_str())
            .with_data(FIELD_SUCCESS, true)
            .with_data("recipients", recipients)
    }

    /// Error reply from a plain string.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        Self::bare(ERROR)
            .with_data(FIELD_EVENT, self.event.clone())
            .with_data(FIELD_MESSAGE, message.into())
            .with_data(FIELD_SUCCESS, false)
    }

    /// Structured error reply from a typed error.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::bare(ERROR)
            .with_data(FIELD_EVENT, self.event.clone())
            .with_data(FIELD_CODE, err.error_code())
            .with_data(FIELD_MESSAGE, err.to_string())
            .with_data(FIELD_RETRYABLE, err.retryable())
            .with_data(FIELD_SUCCESS, false)
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_session_id(self, session_id: impl Into<String>) -> Self {
        self.with_data(FIELD_SESSION_ID, session_id.into())
    }
}

// =============================================================================
// ACCESSORS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.str_field(FIELD_SESSION_ID).filter(|s| !s.is_empty())
    }

    /// Serialize to the JSON text carried by one WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns a serde error if the payload cannot be encoded.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one WebSocket text message.
    ///
    /// # Errors
    ///
    /// Returns a serde error if the text is not a `{event, data}` object.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
