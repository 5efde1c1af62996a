use thiserror::Error;

use crate::{AggregateId, Version};

/// Errors raised by the event journal.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream moved on since the caller loaded it.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// The batch handed to `append` is malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// An envelope was built without one of its required fields.
    #[error("Incomplete event envelope: missing {0}")]
    IncompleteEnvelope(&'static str),

    /// Payload (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
