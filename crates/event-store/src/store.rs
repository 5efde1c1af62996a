use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::broadcast;

use crate::{AggregateId, EventEnvelope, EventQuery, EventStoreError, Result, Version};

/// Options for appending events to a stream.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Version the caller loaded the stream at. `None` skips the check.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// The stream must not exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// A stream of stored events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Live feed of envelopes appended after the subscription was taken.
pub type EventSubscription = broadcast::Receiver<EventEnvelope>;

/// Append-only journal of domain events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch to a single stream atomically.
    ///
    /// Fails with `ConcurrencyConflict` when `expected_version` is set and
    /// the stream has moved. Returns the stream version after the append.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version>;

    /// All events of one stream, oldest first.
    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>>;

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Every stored event in journal order.
    async fn stream_all_events(&self) -> Result<EventStream>;

    /// Current version of a stream, `None` if it was never written.
    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>>;

    /// Subscribes to envelopes appended from now on.
    fn subscribe(&self) -> EventSubscription;
}

/// Convenience helpers on top of [`EventStore`].
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Distinct stream ids of one aggregate family, in order of creation.
    async fn aggregate_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>> {
        let events = self
            .query_events(EventQuery::new().aggregate_type(aggregate_type))
            .await?;
        let mut ids = Vec::new();
        for event in events {
            if event.version == Version::first() {
                ids.push(event.aggregate_id);
            }
        }
        Ok(ids)
    }
}

impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Checks that a batch targets one stream with consecutive versions.
pub fn validate_events_for_append(events: &[EventEnvelope]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "cannot append an empty batch".to_string(),
        ));
    };

    let mut expected_version = first.version;
    for event in events.iter().skip(1) {
        if event.aggregate_id != first.aggregate_id
            || event.aggregate_type != first.aggregate_type
        {
            return Err(EventStoreError::InvalidAppend(
                "a batch must target a single stream".to_string(),
            ));
        }
        expected_version = expected_version.next();
        if event.version != expected_version {
            return Err(EventStoreError::InvalidAppend(format!(
                "versions must be consecutive: expected {}, got {}",
                expected_version, event.version
            )));
        }
    }

    Ok(())
}
