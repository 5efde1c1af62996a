//! Domain error types.

use event_store::EventStoreError;
use thiserror::Error;

use crate::inventory::InventoryError;
use crate::request::RequestError;
use crate::testing::TestingError;
use crate::transport::TransportError;

/// Umbrella error for domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Testing error: {0}")]
    Testing(#[from] TestingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
