use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::borrow::Cow;

/// Identifier of a logical client session (hex-encoded, 128 bits).
pub type SessionId = String;

pub const HEARTBEAT_EVENT: &str = "heartbeat";
pub const CONNECTED_EVENT: &str = "connected";

/// One unit of pushed data.
///
/// Events are immutable once built and are cloned by value into client
/// channels and session buffers. Two events are equal when their ids are equal.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    pub replayed: bool,
}

impl Event {
    /// Builds an event with a broker-generated, time-ordered id.
    pub fn new(event_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::with_id(uuid::Uuid::now_v7().to_string(), event_type, payload)
    }

    /// Builds an event carrying a producer-supplied id.
    pub fn with_id(
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            created_at: Utc::now(),
            replayed: false,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_EVENT, Bytes::from_static(b"{}"))
    }

    /// Control event written first on every accepted connection.
    pub fn connected(session_id: &str, reconnected: bool, replayed: usize) -> Self {
        let data = json!({
            "session_id": session_id,
            "reconnected": reconnected,
            "replayed": replayed,
        });
        Self::new(CONNECTED_EVENT, data.to_string())
    }

    pub fn into_replayed(mut self) -> Self {
        self.replayed = true;
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == HEARTBEAT_EVENT
    }

    /// Broker-generated events that carry no application data.
    pub fn is_control(&self) -> bool {
        self.is_heartbeat() || self.event_type == CONNECTED_EVENT
    }

    /// Payload as text; invalid UTF-8 sequences are replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

#[derive(Debug, Clone)]
pub struct Message {
    pub event: Event,
    pub scope: MessageScope,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageScope {
    /// Send to every live client and buffer for every disconnected session
    Broadcast,
    /// Send to the named sessions only, buffering for those that are disconnected
    Sessions { session_ids: Vec<SessionId> },
    /// Send to live clients only; never buffered (heartbeats)
    Live,
}
