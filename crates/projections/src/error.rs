//! Projection error types.

use thiserror::Error;

/// Errors raised while feeding the journal into read models.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Event store error: {0}")]
    EventStore(#[from] event_store::EventStoreError),

    /// A journal payload did not decode as the event its stream carries.
    #[error("Event deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// The live feed dropped events faster than they were consumed.
    #[error("Live feed lagged by {0} events")]
    Lagged(u64),
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
