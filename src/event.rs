//! Event envelope, stream entry ids and the stream wire format.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::subject::Subject;
use crate::transport::{StreamTransport, TransportError};

/// Stream field holding the JSON-encoded event envelope.
pub const EVENT_FIELD: &str = "event";

/// Position of an entry inside one subject's stream.
///
/// Assigned by the transport on append, strictly increasing per stream.
/// Orders delivery, not causality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    pub const MIN: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id strictly greater than this one.
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self::new(self.millis, seq),
            None => Self::new(self.millis.saturating_add(1), 0),
        }
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.millis, self.seq).cmp(&(other.millis, other.seq))
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid stream entry id: {0}")]
pub struct InvalidEntryId(pub String);

impl FromStr for EntryId {
    type Err = InvalidEntryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidEntryId(s.to_string());
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventCodecError {
    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Stream entry has no event payload")]
    MissingPayload,
}

fn default_schema_version() -> u32 {
    1
}

/// Domain event as carried on a subject stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub subject: Subject,
    pub aggregate_id: String,
    /// Monotonic per aggregate, starting at 1.
    pub version: u64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Create an event written in the subject's current schema.
    pub fn new(
        subject: Subject,
        aggregate_id: impl Into<String>,
        version: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            subject,
            aggregate_id: aggregate_id.into(),
            version,
            schema_version: subject.schema_version(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, EventCodecError> {
        serde_json::to_vec(self).map_err(EventCodecError::Encode)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, EventCodecError> {
        if raw.is_empty() {
            return Err(EventCodecError::MissingPayload);
        }
        serde_json::from_slice(raw).map_err(EventCodecError::Decode)
    }
}

/// Raw entry delivered by a transport read or claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub subject: Subject,
    /// Encoded [`Event`]; empty if the entry was trimmed while pending.
    pub payload: Vec<u8>,
}

impl StreamEntry {
    pub fn event(&self) -> Result<Event, EventCodecError> {
        Event::decode(&self.payload)
    }
}

/// Appends events to their subject's stream.
///
/// Producers only ever write the current schema; anything else is a
/// programming error and is rejected before it reaches the stream.
#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn StreamTransport>,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self { transport }
    }

    pub async fn publish(&self, event: &Event) -> Result<EntryId, TransportError> {
        if event.schema_version != event.subject.schema_version() {
            return Err(TransportError::InvalidEvent(format!(
                "{} must be published with schema v{}, got v{}",
                event.subject,
                event.subject.schema_version(),
                event.schema_version
            )));
        }
        if event.version == 0 {
            return Err(TransportError::InvalidEvent(format!(
                "{} for aggregate {} has version 0; versions start at 1",
                event.subject, event.aggregate_id
            )));
        }

        let payload = event
            .encode()
            .map_err(|e| TransportError::InvalidEvent(e.to_string()))?;
        let id = self.transport.append(event.subject, &payload).await?;

        debug!(
            subject = %event.subject,
            aggregate_id = %event.aggregate_id,
            version = event.version,
            entry_id = %id,
            "Published event"
        );

        Ok(id)
    }
}
