//! Blood request aggregate, its commitments and the request ledger.

mod aggregate;
mod commands;
mod commitment;
mod events;
mod service;
mod state;

pub use aggregate::BloodRequest;
pub use commands::*;
pub use commitment::{
    CancelReason, Channel, Commitment, CommitmentKind, CommitmentState, FailureReason,
};
pub use events::{
    CommitmentCancelledData, CommitmentFailedData, CommitmentOpenedData, CommitmentReducedData,
    DeliveryRecordedData, DonorResponseData, RequestCancelledData, RequestClosedData,
    RequestEvent, RequestSubmittedData,
};
pub use service::RequestLedger;
pub use state::RequestStatus;

use chrono::{DateTime, Utc};
use common::{AggregateId, CommitmentId};
use thiserror::Error;

/// Requests are identified by their stream id.
pub type RequestId = AggregateId;

/// Errors raised by the request ledger.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Request already created")]
    AlreadyCreated,

    #[error("Request has not been submitted")]
    NotSubmitted,

    #[error("Invalid state transition: cannot {action} from {current_status} status")]
    InvalidStateTransition {
        current_status: RequestStatus,
        action: &'static str,
    },

    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    #[error("Deadline {deadline} is not in the future")]
    DeadlineInPast { deadline: DateTime<Utc> },

    #[error("Deadline {deadline} has not been reached")]
    DeadlineNotReached { deadline: DateTime<Utc> },

    #[error(
        "Over-commitment: {committed} of {requested} units already committed, cannot add {additional}"
    )]
    OverCommitment {
        requested: u32,
        committed: u32,
        additional: u32,
    },

    #[error("Commitment not found: {commitment_id}")]
    CommitmentNotFound { commitment_id: CommitmentId },

    #[error("Commitment {commitment_id} is {state}, not open")]
    CommitmentNotOpen {
        commitment_id: CommitmentId,
        state: CommitmentState,
    },

    #[error("Commitment {commitment_id} is not a donor pledge")]
    NotADonorPledge { commitment_id: CommitmentId },

    #[error("Every slot of donor pledge {commitment_id} is taken")]
    PledgeFull { commitment_id: CommitmentId },

    #[error(
        "Cannot reduce commitment {commitment_id} from {promised} to {to_units} ({delivered} delivered)"
    )]
    InvalidReduction {
        commitment_id: CommitmentId,
        promised: u32,
        delivered: u32,
        to_units: u32,
    },

    #[error(
        "Delivery of {units} exceeds commitment {commitment_id} ({delivered} of {promised} delivered)"
    )]
    DeliveryExceedsCommitment {
        commitment_id: CommitmentId,
        promised: u32,
        delivered: u32,
        units: u32,
    },

    /// An open commitment on a closed request. Indicates a reconciliation bug.
    #[error("Delivery for open commitment {commitment_id} on a {status} request")]
    CommitmentOnClosedRequest {
        commitment_id: CommitmentId,
        status: RequestStatus,
    },
}
