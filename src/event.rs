//! Position events — typed view over sync commands and their broadcasts.
//!
//! DESIGN
//! ======
//! A leader command (`syncLine`, `selectSong`, ...) and the broadcast the hub
//! fans out for it (`lineUpdated`, `songSelected`, ...) carry the same
//! payload. `PositionEvent` is that payload with the wire names stripped off;
//! `EventMeta` is the delivery envelope (id, origin timestamp, hedge marker).
//!
//! Hedge copies reuse the original id plus `HEDGE_SUFFIX`, so any receiver can
//! map a hedge back to its original without extra bookkeeping.

use std::fmt;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::{self, Data, ErrorCode, FIELD_ID, FIELD_IS_BACKUP, FIELD_SESSION_ID, FIELD_TIMESTAMP, Frame};

pub const HEDGE_SUFFIX: &str = "_backup";

pub const FIELD_LINE_INDEX: &str = "lineIndex";
pub const FIELD_WORD_INDEX: &str = "wordIndex";
pub const FIELD_ENABLED: &str = "enabled";
pub const FIELD_SPEED_SECONDS: &str = "speedSeconds";
pub const FIELD_SONG_ID: &str = "songId";

/// Older senders spell the toggle flag this way.
const FIELD_ENABLED_LEGACY: &str = "isEnabled";

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: &'static str },
}

impl ErrorCode for EventError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownEvent(_) => "E_UNKNOWN_EVENT",
            Self::MissingField(_) | Self::InvalidField { .. } => "E_MALFORMED_EVENT",
        }
    }
}

// =============================================================================
// EVENT ID
// =============================================================================

/// Globally unique id of one logical event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id: `<kind>_<millis>_<9 random chars>`.
    #[must_use]
    pub fn generate(kind: EventKind) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(9)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self(format!("{}_{}_{suffix}", kind.id_prefix(), frame::now_ms()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id carried by the hedge copy of this event.
    #[must_use]
    pub fn hedge(&self) -> Self {
        Self(format!("{}{HEDGE_SUFFIX}", self.0))
    }

    /// Original id if this is a hedge id.
    #[must_use]
    pub fn original(&self) -> Option<Self> {
        self.0
            .strip_suffix(HEDGE_SUFFIX)
            .filter(|s| !s.is_empty())
            .map(|s| Self(s.to_owned()))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// EVENT KIND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LineSync,
    WordSync,
    ScrollToggle,
    SpeedUpdate,
    SongSelect,
    SessionEnd,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        Self::LineSync,
        Self::WordSync,
        Self::ScrollToggle,
        Self::SpeedUpdate,
        Self::SongSelect,
        Self::SessionEnd,
    ];

    /// Event name a leader sends to the hub.
    #[must_use]
    pub fn command(self) -> &'static str {
        match self {
            Self::LineSync => "syncLine",
            Self::WordSync => "syncWord",
            Self::ScrollToggle => "toggleAutoScroll",
            Self::SpeedUpdate => "updateAutoScrollSpeed",
            Self::SongSelect => "selectSong",
            Self::SessionEnd => frame::END_SESSION,
        }
    }

    /// Event name the hub fans out to session members.
    #[must_use]
    pub fn broadcast(self) -> &'static str {
        match self {
            Self::LineSync => "lineUpdated",
            Self::WordSync => "wordUpdated",
            Self::ScrollToggle => "autoScrollToggled",
            Self::SpeedUpdate => "autoScrollSpeedUpdated",
            Self::SongSelect => "songSelected",
            Self::SessionEnd => frame::SESSION_ENDED,
        }
    }

    #[must_use]
    pub fn from_command(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.command() == name)
    }

    #[must_use]
    pub fn from_broadcast(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.broadcast() == name)
    }

    fn id_prefix(self) -> &'static str {
        match self {
            Self::LineSync => "line_sync",
            Self::WordSync => "word_sync",
            Self::ScrollToggle => "scroll_toggle",
            Self::SpeedUpdate => "speed_update",
            Self::SongSelect => "song_select",
            Self::SessionEnd => "session_end",
        }
    }
}

// =============================================================================
// POSITION EVENT
// =============================================================================

/// Indexes stay signed: the wire may carry `-1` and receivers clamp or drop.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    LineSync { line_index: i64 },
    WordSync { line_index: i64, word_index: i64 },
    ScrollToggle { enabled: bool },
    SpeedUpdate { speed_seconds: f64 },
    SongSelect { song_id: String },
    SessionEnd,
}

impl PositionEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::LineSync { .. } => EventKind::LineSync,
            Self::WordSync { .. } => EventKind::WordSync,
            Self::ScrollToggle { .. } => EventKind::ScrollToggle,
            Self::SpeedUpdate { .. } => EventKind::SpeedUpdate,
            Self::SongSelect { .. } => EventKind::SongSelect,
            Self::SessionEnd => EventKind::SessionEnd,
        }
    }

    /// Write this event's payload fields into `data`.
    pub fn write_into(&self, data: &mut Data) {
        match self {
            Self::LineSync { line_index } => {
                data.insert(FIELD_LINE_INDEX.into(), Value::from(*line_index));
            }
            Self::WordSync { line_index, word_index } => {
                data.insert(FIELD_LINE_INDEX.into(), Value::from(*line_index));
                data.insert(FIELD_WORD_INDEX.into(), Value::from(*word_index));
            }
            Self::ScrollToggle { enabled } => {
                data.insert(FIELD_ENABLED.into(), Value::Bool(*enabled));
            }
            Self::SpeedUpdate { speed_seconds } => {
                data.insert(FIELD_SPEED_SECONDS.into(), Value::from(*speed_seconds));
            }
            Self::SongSelect { song_id } => {
                data.insert(FIELD_SONG_ID.into(), Value::String(song_id.clone()));
            }
            Self::SessionEnd => {}
        }
    }

    /// Build the command frame a leader sends for this event.
    #[must_use]
    pub fn command_frame(&self, session_id: &str, meta: &EventMeta) -> Frame {
        let mut data = Data::new();
        data.insert(FIELD_SESSION_ID.into(), Value::String(session_id.to_owned()));
        self.write_into(&mut data);
        meta.write_into(&mut data);
        Frame::new(self.kind().command(), data)
    }

    fn parse(kind: EventKind, data: &Data) -> Result<Self, EventError> {
        match kind {
            EventKind::LineSync => Ok(Self::LineSync { line_index: int_field(data, FIELD_LINE_INDEX)? }),
            EventKind::WordSync => Ok(Self::WordSync {
                line_index: int_field(data, FIELD_LINE_INDEX)?,
                word_index: int_field(data, FIELD_WORD_INDEX)?,
            }),
            EventKind::ScrollToggle => {
                let value = data
                    .get(FIELD_ENABLED)
                    .or_else(|| data.get(FIELD_ENABLED_LEGACY))
                    .ok_or(EventError::MissingField(FIELD_ENABLED))?;
                let enabled = value
                    .as_bool()
                    .ok_or(EventError::InvalidField { field: FIELD_ENABLED, reason: "expected a boolean" })?;
                Ok(Self::ScrollToggle { enabled })
            }
            EventKind::SpeedUpdate => {
                let speed_seconds = data
                    .get(FIELD_SPEED_SECONDS)
                    .ok_or(EventError::MissingField(FIELD_SPEED_SECONDS))?
                    .as_f64()
                    .filter(|s| s.is_finite() && *s > 0.0)
                    .ok_or(EventError::InvalidField { field: FIELD_SPEED_SECONDS, reason: "expected a positive number" })?;
                Ok(Self::SpeedUpdate { speed_seconds })
            }
            EventKind::SongSelect => {
                let song_id = data
                    .get(FIELD_SONG_ID)
                    .ok_or(EventError::MissingField(FIELD_SONG_ID))?
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .ok_or(EventError::InvalidField { field: FIELD_SONG_ID, reason: "expected a non-empty string" })?;
                Ok(Self::SongSelect { song_id: song_id.to_owned() })
            }
            EventKind::SessionEnd => Ok(Self::SessionEnd),
        }
    }
}

// =============================================================================
// EVENT META
// =============================================================================

/// Delivery envelope shared by an event and its hedge copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub id: EventId,
    /// Origin timestamp, milliseconds since Unix epoch.
    pub timestamp: i64,
    pub is_backup: bool,
}

impl EventMeta {
    #[must_use]
    pub fn fresh(kind: EventKind) -> Self {
        Self { id: EventId::generate(kind), timestamp: frame::now_ms(), is_backup: false }
    }

    /// Envelope for the hedge copy: derived id, same origin timestamp.
    #[must_use]
    pub fn hedge(&self) -> Self {
        Self { id: self.id.hedge(), timestamp: self.timestamp, is_backup: true }
    }

    pub fn write_into(&self, data: &mut Data) {
        data.insert(FIELD_ID.into(), Value::String(self.id.as_str().to_owned()));
        data.insert(FIELD_TIMESTAMP.into(), Value::from(self.timestamp));
        if self.is_backup {
            data.insert(FIELD_IS_BACKUP.into(), Value::Bool(true));
        }
    }

    /// Read the envelope from a payload. `Ok(None)` when no id is present.
    ///
    /// # Errors
    ///
    /// Returns `InvalidField` if `id` is present but not a non-empty string.
    pub fn from_data(data: &Data) -> Result<Option<Self>, EventError> {
        let Some(raw) = data.get(FIELD_ID) else {
            return Ok(None);
        };
        if raw.is_null() {
            return Ok(None);
        }
        let id = raw
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or(EventError::InvalidField { field: FIELD_ID, reason: "expected a non-empty string" })?;
        let timestamp = data.get(FIELD_TIMESTAMP).and_then(as_integer).unwrap_or(0);
        let is_backup = data
            .get(FIELD_IS_BACKUP)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Some(Self { id: EventId::new(id), timestamp, is_backup }))
    }
}

// =============================================================================
// COMMAND / RECEIVED VIEWS
// =============================================================================

/// A leader command as the hub sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCommand {
    pub session_id: String,
    /// `None` when the sender omitted an id; the hub stamps one.
    pub meta: Option<EventMeta>,
    pub event: PositionEvent,
}

impl SyncCommand {
    /// Validate a command frame.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEvent` for non-sync event names and `MissingField` /
    /// `InvalidField` for payloads that fail validation.
    pub fn from_frame(frame: &Frame) -> Result<Self, EventError> {
        let kind = EventKind::from_command(&frame.event).ok_or_else(|| EventError::UnknownEvent(frame.event.clone()))?;
        let session_id = frame
            .session_id()
            .ok_or(EventError::MissingField(FIELD_SESSION_ID))?
            .to_owned();
        let event = PositionEvent::parse(kind, &frame.data)?;
        let meta = EventMeta::from_data(&frame.data)?;
        Ok(Self { session_id, meta, event })
    }
}

/// A broadcast as a follower sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    pub meta: Option<EventMeta>,
    pub event: PositionEvent,
}

impl ReceivedEvent {
    /// Parse a hub broadcast.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEvent` for non-broadcast event names and field errors
    /// for payloads that fail validation.
    pub fn from_frame(frame: &Frame) -> Result<Self, EventError> {
        let kind = EventKind::from_broadcast(&frame.event).ok_or_else(|| EventError::UnknownEvent(frame.event.clone()))?;
        let event = PositionEvent::parse(kind, &frame.data)?;
        let meta = EventMeta::from_data(&frame.data)?;
        Ok(Self { meta, event })
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn int_field(data: &Data, key: &'static str) -> Result<i64, EventError> {
    let value = data.get(key).ok_or(EventError::MissingField(key))?;
    as_integer(value).ok_or(EventError::InvalidField { field: key, reason: "expected an integer" })
}

/// Accept integral floats (`2.0`) as well as integers.
#[allow(clippy::cast_possible_truncation)]
fn as_integer(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    (f.is_finite() && f.fract().abs() < f64::EPSILON).then_some(f as i64)
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
