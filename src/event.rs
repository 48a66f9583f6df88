//! The Event value moved through the bus and stored in the event log.
//!
//! An Event is immutable once built: identity, timestamp, type and payload are
//! only set at construction. Retries and redeliveries carry the same value.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Open JSON object carried by every event.
pub type Payload = serde_json::Map<String, Value>;

/// Errors raised while encoding or decoding the wire/storage representation.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Event payload must be a JSON object, got {0}")]
    PayloadNotObject(&'static str),
}

/// Atomic unit moved through the system.
///
/// Timestamps are kept at microsecond precision so an event read back from
/// `TIMESTAMPTZ` storage compares equal to the one that was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    event_id: String,
    #[serde(with = "iso8601")]
    timestamp: DateTime<Utc>,
    event_type: String,
    payload: Payload,
}

impl Event {
    /// Create an event with a random v4 identity stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().trunc_subsecs(6),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Create an event from an arbitrary JSON value, which must be an object.
    pub fn from_value(event_type: impl Into<String>, payload: Value) -> Result<Self, EventError> {
        match payload {
            Value::Object(map) => Ok(Self::new(event_type, map)),
            other => Err(EventError::PayloadNotObject(json_kind(&other))),
        }
    }

    /// Rebuild an event from stored parts.
    pub fn from_parts(
        event_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        event_type: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: timestamp.trunc_subsecs(6),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Override the generated identity.
    pub fn with_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Override the creation timestamp (replay and tests).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(6);
        self
    }

    pub fn id(&self) -> &str {
        &self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Encode as the UTF-8 JSON message body.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(EventError::Encode)
    }

    /// Decode a message body produced by [`Event::to_json`] or a compatible producer.
    pub fn from_json(body: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(body).map_err(EventError::Decode)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// ISO-8601 timestamps. Offsets are normalised to UTC; naive timestamps are
/// read as UTC.
mod iso8601 {
    use super::*;
    use chrono::SecondsFormat;
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid ISO-8601 timestamp: {raw}")))
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc).trunc_subsecs(6));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc().trunc_subsecs(6))
    }
}
