//! Typed view of the hub's replies to a participant.

use crate::frame::{
    ACK, AckStatus, CONNECTION_CONFIRMED, ERROR, FIELD_CODE, FIELD_EVENT, FIELD_MESSAGE, Frame, PONG,
    SESSION_JOINED, SESSION_LEFT,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Confirmed { connection_id: String, client_count: u64 },
    Joined { session_id: String, member_count: u64 },
    Left { session_id: String },
    Ack { event: String, sync_id: Option<String>, status: AckStatus, recipients: u64 },
    Error { event: Option<String>, code: Option<String>, message: String },
    Pong { timestamp: i64 },
}

impl Reply {
    /// `None` for frames that are not replies (broadcasts, unknown events).
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        let u64_field = |key: &str| frame.data.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0);
        let owned = |key: &str| frame.str_field(key).map(str::to_owned);

        match frame.event.as_str() {
            CONNECTION_CONFIRMED => Some(Self::Confirmed {
                connection_id: owned("connectionId").unwrap_or_default(),
                client_count: u64_field("clientCount"),
            }),
            SESSION_JOINED => Some(Self::Joined {
                session_id: frame.session_id()?.to_owned(),
                member_count: u64_field("memberCount"),
            }),
            SESSION_LEFT => Some(Self::Left { session_id: frame.session_id()?.to_owned() }),
            ACK => {
                let status = frame
                    .data
                    .get("status")
                    .and_then(|v| serde_json::from_value::<AckStatus>(v.clone()).ok())?;
                Some(Self::Ack {
                    event: owned(FIELD_EVENT).unwrap_or_default(),
                    sync_id: owned("syncId"),
                    status,
                    recipients: u64_field("recipients"),
                })
            }
            ERROR => Some(Self::Error {
                event: owned(FIELD_EVENT),
                code: owned(FIELD_CODE),
                message: owned(FIELD_MESSAGE).unwrap_or_default(),
            }),
            PONG => Some(Self::Pong {
                timestamp: frame
                    .data
                    .get("timestamp")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "reply_test.rs"]
mod tests;
