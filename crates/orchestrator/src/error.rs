//! Orchestrator error types.

use common::{CommitmentId, DonationId, JobId};
use domain::{DomainError, InventoryError, RequestId, TestingError};
use thiserror::Error;

/// Errors that can occur while orchestrating a request.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Commitment {commitment_id} not found on request {request_id}")]
    CommitmentNotFound {
        request_id: RequestId,
        commitment_id: CommitmentId,
    },

    #[error("Transport job not found: {0}")]
    JobNotFound(JobId),

    #[error("Donation not found: {0}")]
    DonationNotFound(DonationId),

    /// An inbound event does not fit the commitment it names.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Directory lookup failed: {0}")]
    Directory(String),

    #[error("Notification dispatch failed: {0}")]
    Notification(String),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    #[error("Testing error: {0}")]
    Testing(#[from] TestingError),
}

/// Convenience type alias for orchestrator results.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
