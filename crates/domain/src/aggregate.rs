//! Core aggregate and domain event traits.

use chrono::{DateTime, Utc};
use common::AggregateId;
use event_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// A fact that happened in the domain, named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Event name used as the journal `event_type`.
    fn event_type(&self) -> &'static str;

    /// Domain time at which the fact happened.
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// An event-sourced consistency boundary.
///
/// State is rebuilt by replaying events through `apply`, which must be
/// deterministic and infallible. Commands validate against the current
/// state and return the events to record.
pub trait Aggregate: Default + Send + Sync + Sized {
    type Event: DomainEvent;

    type Error: std::error::Error + Send + Sync;

    /// Stream family name, e.g. `BloodRequest`.
    fn aggregate_type() -> &'static str;

    /// `None` until the creation event has been applied.
    fn id(&self) -> Option<AggregateId>;

    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
