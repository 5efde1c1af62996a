use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};

use crate::{
    AggregateId, EventEnvelope, EventQuery, EventStoreError, Result, Version,
    store::{AppendOptions, EventStore, EventStream, EventSubscription, validate_events_for_append},
};

const SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Default)]
struct Journal {
    events: Vec<EventEnvelope>,
    streams: HashMap<AggregateId, Vec<usize>>,
}

impl Journal {
    fn version_of(&self, aggregate_id: AggregateId) -> Version {
        self.streams
            .get(&aggregate_id)
            .and_then(|positions| positions.last())
            .map(|&pos| self.events[pos].version)
            .unwrap_or_else(Version::initial)
    }
}

/// In-memory journal.
///
/// Cloning is cheap and every clone shares the same journal and feed.
#[derive(Clone)]
pub struct InMemoryEventStore {
    journal: Arc<RwLock<Journal>>,
    feed: broadcast::Sender<EventEnvelope>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            journal: Arc::new(RwLock::new(Journal::default())),
            feed,
        }
    }

    pub async fn event_count(&self) -> usize {
        self.journal.read().await.events.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[tracing::instrument(skip(self, events), fields(batch = events.len()))]
    async fn append(
        &self,
        mut events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<Version> {
        validate_events_for_append(&events)?;
        let aggregate_id = events[0].aggregate_id;

        let mut journal = self.journal.write().await;
        let current = journal.version_of(aggregate_id);

        if let Some(expected) = options.expected_version
            && current != expected
        {
            tracing::warn!(%aggregate_id, %expected, actual = %current, "stale append rejected");
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current,
            });
        }
        if events[0].version != current.next() {
            tracing::warn!(
                %aggregate_id,
                first = %events[0].version,
                actual = %current,
                "append out of sequence"
            );
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: Version::new(events[0].version.as_i64() - 1),
                actual: current,
            });
        }

        let mut last_version = current;
        for event in events.iter_mut() {
            let position = journal.events.len();
            event.sequence = position as u64 + 1;
            last_version = event.version;
            journal.events.push(event.clone());
            journal
                .streams
                .entry(aggregate_id)
                .or_default()
                .push(position);
        }
        drop(journal);
        tracing::debug!(%aggregate_id, version = %last_version, "events appended");

        metrics::counter!("journal_events_appended_total").increment(events.len() as u64);
        for event in events {
            // No receivers is not an error for the journal.
            let _ = self.feed.send(event);
        }

        Ok(last_version)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let journal = self.journal.read().await;
        Ok(journal
            .streams
            .get(&aggregate_id)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&pos| journal.events[pos].clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let journal = self.journal.read().await;
        let start = query.after_sequence.unwrap_or(0) as usize;
        Ok(journal
            .events
            .iter()
            .skip(start)
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }

    async fn stream_all_events(&self) -> Result<EventStream> {
        use futures_util::stream;

        let events = self.journal.read().await.events.clone();
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let journal = self.journal.read().await;
        Ok(journal
            .streams
            .contains_key(&aggregate_id)
            .then(|| journal.version_of(aggregate_id)))
    }

    fn subscribe(&self) -> EventSubscription {
        tracing::debug!(subscribers = self.feed.receiver_count() + 1, "journal subscription");
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::store::EventStoreExt;

    fn event(aggregate_id: AggregateId, version: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("BloodRequest")
            .event_type(event_type)
            .version(Version::new(version))
            .payload_raw(serde_json::json!({"version": version}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn append_assigns_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();

        store
            .append(vec![event(a, 1, "RequestSubmitted")], AppendOptions::expect_new())
            .await
            .unwrap();
        store
            .append(
                vec![event(b, 1, "RequestSubmitted"), event(b, 2, "CommitmentOpened")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let all = store.query_events(EventQuery::new()).await.unwrap();
        let sequences: Vec<_> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(vec![event(id, 1, "RequestSubmitted")], AppendOptions::expect_new())
            .await
            .unwrap();

        let result = store
            .append(
                vec![event(id, 2, "CommitmentOpened")],
                AppendOptions::expect_version(Version::initial()),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn version_gap_is_rejected_without_expected_version() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let result = store
            .append(vec![event(id, 3, "CommitmentOpened")], AppendOptions::new())
            .await;

        assert!(result.is_err());
        assert_eq!(store.get_aggregate_version(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let store = InMemoryEventStore::new();
        let result = store.append(vec![], AppendOptions::new()).await;
        assert!(matches!(result, Err(EventStoreError::InvalidAppend(_))));
    }

    #[tokio::test]
    async fn query_by_type_and_position() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(
                vec![
                    event(id, 1, "RequestSubmitted"),
                    event(id, 2, "CommitmentOpened"),
                    event(id, 3, "CommitmentOpened"),
                ],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let opened = store
            .query_events(EventQuery::new().event_type("CommitmentOpened"))
            .await
            .unwrap();
        assert_eq!(opened.len(), 2);

        let tail = store.query_events(EventQuery::new().after(2)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].version, Version::new(3));
    }

    #[tokio::test]
    async fn subscribers_see_appends_in_order() {
        let store = InMemoryEventStore::new();
        let mut feed = store.subscribe();
        let id = AggregateId::new();

        store
            .append(
                vec![event(id, 1, "RequestSubmitted"), event(id, 2, "CommitmentOpened")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let first = feed.recv().await.unwrap();
        let second = feed.recv().await.unwrap();
        assert_eq!(first.event_type, "RequestSubmitted");
        assert_eq!(second.event_type, "CommitmentOpened");
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn stream_all_events_replays_journal() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append(vec![event(id, 1, "RequestSubmitted")], AppendOptions::expect_new())
            .await
            .unwrap();

        let replayed: Vec<_> = store.stream_all_events().await.unwrap().collect().await;
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].is_ok());
    }

    #[tokio::test]
    async fn aggregate_ids_lists_streams_of_a_family() {
        let store = InMemoryEventStore::new();
        let request = AggregateId::new();
        let job = AggregateId::new();
        store
            .append(vec![event(request, 1, "RequestSubmitted")], AppendOptions::new())
            .await
            .unwrap();
        let mut transport = event(job, 1, "JobScheduled");
        transport.aggregate_type = "TransportJob".to_string();
        store
            .append(vec![transport], AppendOptions::new())
            .await
            .unwrap();

        let ids = store.aggregate_ids("BloodRequest").await.unwrap();
        assert_eq!(ids, vec![request]);
        assert_eq!(store.get_aggregate_version(job).await.unwrap(), Some(Version::first()));
    }
}
