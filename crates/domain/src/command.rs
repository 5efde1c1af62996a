//! Command handling infrastructure.

use std::marker::PhantomData;

use common::AggregateId;
use event_store::{AppendOptions, EventEnvelope, EventStore, Version};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// Outcome of a successfully executed command.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate with the new events applied.
    pub aggregate: A,

    /// Events recorded by this command. Empty when the command was a no-op.
    pub events: Vec<A::Event>,

    pub new_version: Version,
}

impl<A: Aggregate> CommandResult<A> {
    /// Returns true if the command recorded nothing.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// An intention addressed to one aggregate.
pub trait Command: Send + Sync {
    type Aggregate: Aggregate;

    fn aggregate_id(&self) -> AggregateId;
}

/// Loads aggregates from the journal, runs commands against them and
/// appends the resulting events with optimistic concurrency.
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replays an aggregate. Unknown ids yield the default instance.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        let events = self.store.get_events_for_aggregate(aggregate_id).await?;

        let mut aggregate = A::default();
        for envelope in events {
            let event: A::Event = serde_json::from_value(envelope.payload)?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
        }

        Ok(aggregate)
    }

    /// Replays an aggregate, returning `None` if it was never created.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        Ok(aggregate.id().is_some().then_some(aggregate))
    }

    /// Runs `command_fn` against the current state and persists its events.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        let current_version = aggregate.version();

        let events = command_fn(&aggregate)?;

        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
            });
        }

        let envelopes = self.build_envelopes(aggregate_id, current_version, &events)?;
        let new_version = self
            .store
            .append(envelopes, AppendOptions::expect_version(current_version))
            .await?;

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_version(new_version);

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }

    fn build_envelopes(
        &self,
        aggregate_id: AggregateId,
        current_version: Version,
        events: &[A::Event],
    ) -> Result<Vec<EventEnvelope>, DomainError> {
        let mut envelopes = Vec::with_capacity(events.len());
        let mut version = current_version;

        for event in events {
            version = version.next();
            let envelope = EventEnvelope::builder()
                .aggregate_id(aggregate_id)
                .aggregate_type(A::aggregate_type())
                .event_type(event.event_type())
                .version(version)
                .recorded_at(event.occurred_at())
                .payload(event)?
                .build()?;
            envelopes.push(envelope);
        }

        Ok(envelopes)
    }
}
