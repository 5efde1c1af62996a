//! Append-only journal for the event-sourced parts of the fulfillment system.
//!
//! Every appended envelope receives a global sequence number and is
//! broadcast to live subscribers, which is how notification and dashboard
//! layers follow request, commitment and transport transitions.

pub mod error;
pub mod event;
pub mod memory;
pub mod query;
pub mod store;

pub use common::AggregateId;
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::InMemoryEventStore;
pub use query::EventQuery;
pub use store::{AppendOptions, EventStore, EventStoreExt, EventStream, EventSubscription};
