//! Event and position types shared by every pipeline stage.
//!
//! Events are immutable values produced by an [`EventSource`](crate::EventSource)
//! and consumed read-only by the projector. No I/O happens here.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Location of an event in the global log.
///
/// Positions are strictly increasing along the log and unique within it.
/// They are used for ordering, batching and checkpoint resumption, and are
/// persisted as base-10 strings (see [`Checkpoints`](crate::Checkpoints)).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Position(u64);

impl Position {
    /// Wrap a raw global log position.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw global log position.
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Position {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Body of a recorded event.
///
/// Event stores accept both JSON and opaque binary bodies. Only JSON events
/// are projected by default (see [`DefaultFilter`](crate::DefaultFilter)).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A JSON document.
    Json(serde_json::Value),
    /// Bytes that are not valid JSON.
    Binary(Vec<u8>),
}

impl Payload {
    /// Classify raw payload bytes. Empty bodies count as JSON `null`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::Json(serde_json::Value::Null);
        }
        match serde_json::from_slice(bytes) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Binary(bytes.to_vec()),
        }
    }

    /// Returns the JSON value, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Binary(_) => None,
        }
    }

    /// Returns `true` for JSON payloads.
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json(_))
    }
}

/// An event read from the global log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Unique event identifier assigned by the writer.
    pub event_id: Uuid,
    /// Logical stream (entity) the event belongs to, e.g. `"Vehicle-O37"`.
    pub stream_id: String,
    /// Zero-based version of the event within its stream.
    pub stream_version: u64,
    /// Type discriminator, e.g. `"VehicleMoved"`.
    pub event_type: String,
    /// Event body.
    pub payload: Payload,
    /// Writer-supplied metadata; `Value::Null` when absent or not JSON.
    pub metadata: serde_json::Value,
    /// Position in the global log.
    pub position: Position,
    /// Server timestamp in milliseconds since the Unix epoch.
    pub recorded_at: u64,
}

impl RecordedEvent {
    /// Build an event with a JSON payload and a fresh event ID.
    ///
    /// Convenience for in-process sources and tests; remote adapters fill
    /// every field from the wire.
    ///
    /// # Arguments
    ///
    /// * `position` - Global log position of the event.
    /// * `stream_id` - Stream the event belongs to.
    /// * `event_type` - Type discriminator.
    /// * `payload` - JSON body.
    pub fn json(
        position: Position,
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            stream_id: stream_id.into(),
            stream_version: 0,
            event_type: event_type.into(),
            payload: Payload::Json(payload),
            metadata: serde_json::Value::Null,
            position,
            recorded_at: 0,
        }
    }

    /// Decode the event into a caller-defined tagged enum.
    ///
    /// The event is presented to serde as `{"type": <event_type>, "data":
    /// <payload>}`, so an enum annotated with
    /// `#[serde(tag = "type", content = "data")]` can be matched
    /// exhaustively instead of comparing type strings.
    ///
    /// # Returns
    ///
    /// `None` if the payload is binary or does not match any variant of `T`.
    /// Unknown event types are expected in a global log, so this is not an
    /// error.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        let data = self.payload.as_json()?.clone();
        let tagged = serde_json::json!({
            "type": self.event_type,
            "data": data,
        });
        serde_json::from_value(tagged).ok()
    }
}

/// Convert a gRPC [`RecordedEvent`](crate::proto::RecordedEvent) into a
/// [`RecordedEvent`].
///
/// Returns `None` when the event ID is not a valid UUID; such events were
/// not written by a well-behaved client and are skipped by the adapter.
#[cfg(feature = "grpc")]
pub(crate) fn from_proto(recorded: crate::proto::RecordedEvent) -> Option<RecordedEvent> {
    let event_id = Uuid::parse_str(&recorded.event_id).ok()?;
    let metadata = if recorded.metadata.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&recorded.metadata).unwrap_or(serde_json::Value::Null)
    };
    Some(RecordedEvent {
        event_id,
        stream_id: recorded.stream_id,
        stream_version: recorded.stream_version,
        event_type: recorded.event_type,
        payload: Payload::from_bytes(&recorded.payload),
        metadata,
        position: Position::new(recorded.global_position),
        recorded_at: recorded.recorded_at,
    })
}
