//! HTTP handlers, one module per group of actors.

pub mod donors;
pub mod facilities;
pub mod health;
pub mod inbound;
pub mod institutions;
pub mod metrics;
pub mod requests;
pub mod transport;

use common::{AggregateId, CommitmentId};
use uuid::Uuid;

use crate::error::ApiError;

pub(crate) fn parse_uuid(id: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|e| ApiError::BadRequest(format!("Invalid {what} id: {e}")))
}

pub(crate) fn parse_request_id(id: &str) -> Result<AggregateId, ApiError> {
    parse_uuid(id, "request").map(AggregateId::from)
}

pub(crate) fn parse_commitment_id(id: &str) -> Result<CommitmentId, ApiError> {
    parse_uuid(id, "commitment").map(CommitmentId::from)
}
