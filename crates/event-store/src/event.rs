use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AggregateId, EventStoreError, Result};

/// Unique identifier for a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-stream version used for optimistic concurrency.
///
/// A stream with no events is at version 0; its first event carries
/// version 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a stream that has not been written yet.
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A recorded domain event together with its stream coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: EventId,

    /// Position in the global journal, assigned on append. Zero until stored.
    pub sequence: u64,

    /// Event name such as `CommitmentOpened` or `StatusChanged`.
    pub event_type: String,

    pub aggregate_id: AggregateId,

    /// Stream family such as `BloodRequest` or `TransportJob`.
    pub aggregate_type: String,

    /// Stream version after this event.
    pub version: Version,

    /// Domain time of the transition (the orchestrator's clock, not wall time).
    pub recorded_at: DateTime<Utc>,

    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Deserializes the payload into a concrete event type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Builder for [`EventEnvelope`].
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_type: Option<String>,
    aggregate_id: Option<AggregateId>,
    aggregate_type: Option<String>,
    version: Option<Version>,
    recorded_at: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
}

impl EventEnvelopeBuilder {
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the domain time. Defaults to now.
    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }

    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the envelope, failing on the first missing required field.
    pub fn build(self) -> Result<EventEnvelope> {
        Ok(EventEnvelope {
            event_id: EventId::new(),
            sequence: 0,
            event_type: self
                .event_type
                .ok_or(EventStoreError::IncompleteEnvelope("event_type"))?,
            aggregate_id: self
                .aggregate_id
                .ok_or(EventStoreError::IncompleteEnvelope("aggregate_id"))?,
            aggregate_type: self
                .aggregate_type
                .ok_or(EventStoreError::IncompleteEnvelope("aggregate_type"))?,
            version: self
                .version
                .ok_or(EventStoreError::IncompleteEnvelope("version"))?,
            recorded_at: self.recorded_at.unwrap_or_else(Utc::now),
            payload: self
                .payload
                .ok_or(EventStoreError::IncompleteEnvelope("payload"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_sequence() {
        assert_eq!(Version::initial().next(), Version::first());
        assert!(Version::new(2) > Version::first());
        assert_eq!(Version::new(7).as_i64(), 7);
    }

    #[test]
    fn builder_populates_envelope() {
        let aggregate_id = AggregateId::new();
        let at = Utc::now();

        let envelope = EventEnvelope::builder()
            .event_type("CommitmentOpened")
            .aggregate_id(aggregate_id)
            .aggregate_type("BloodRequest")
            .version(Version::first())
            .recorded_at(at)
            .payload_raw(serde_json::json!({"units": 2}))
            .build()
            .unwrap();

        assert_eq!(envelope.event_type, "CommitmentOpened");
        assert_eq!(envelope.aggregate_id, aggregate_id);
        assert_eq!(envelope.recorded_at, at);
        assert_eq!(envelope.sequence, 0);
        assert_eq!(envelope.payload["units"], 2);
    }

    #[test]
    fn builder_reports_missing_field() {
        let result = EventEnvelope::builder()
            .event_type("RequestSubmitted")
            .build();
        assert!(matches!(
            result,
            Err(EventStoreError::IncompleteEnvelope("aggregate_id"))
        ));
    }

    #[test]
    fn decode_reads_payload() {
        #[derive(Deserialize)]
        struct Units {
            units: u32,
        }

        let envelope = EventEnvelope::builder()
            .event_type("DeliveryRecorded")
            .aggregate_id(AggregateId::new())
            .aggregate_type("BloodRequest")
            .version(Version::first())
            .payload_raw(serde_json::json!({"units": 3}))
            .build()
            .unwrap();

        let units: Units = envelope.decode().unwrap();
        assert_eq!(units.units, 3);
    }
}
