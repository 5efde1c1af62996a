//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::{DomainError, InventoryError, RequestError, TestingError, TransportError};
use event_store::EventStoreError;
use orchestrator::OrchestratorError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Orchestrator(OrchestratorError),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Orchestrator(err) => (orchestrator_status(&err), err.to_string()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn orchestrator_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::RequestNotFound(_)
        | OrchestratorError::CommitmentNotFound { .. }
        | OrchestratorError::JobNotFound(_)
        | OrchestratorError::DonationNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::Directory(_) | OrchestratorError::Notification(_) => {
            StatusCode::BAD_GATEWAY
        }
        OrchestratorError::Domain(err) => domain_status(err),
        OrchestratorError::Inventory(err) => inventory_status(err),
        OrchestratorError::Testing(err) => testing_status(err),
    }
}

fn domain_status(err: &DomainError) -> StatusCode {
    match err {
        DomainError::Request(err) => request_status(err),
        DomainError::Inventory(err) => inventory_status(err),
        DomainError::Testing(err) => testing_status(err),
        DomainError::Transport(err) => match err {
            TransportError::NotScheduled => StatusCode::NOT_FOUND,
            TransportError::NoUnits => StatusCode::BAD_REQUEST,
            TransportError::AlreadyScheduled { .. }
            | TransportError::InvalidTransition { .. }
            | TransportError::JobClosed { .. } => StatusCode::CONFLICT,
        },
        DomainError::AggregateNotFound { .. } => StatusCode::NOT_FOUND,
        DomainError::EventStore(EventStoreError::ConcurrencyConflict { .. }) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn request_status(err: &RequestError) -> StatusCode {
    match err {
        RequestError::CommitmentNotFound { .. } | RequestError::NotSubmitted => {
            StatusCode::NOT_FOUND
        }
        RequestError::InvalidStateTransition { .. }
        | RequestError::CommitmentNotOpen { .. }
        | RequestError::PledgeFull { .. }
        | RequestError::OverCommitment { .. }
        | RequestError::AlreadyCreated => StatusCode::CONFLICT,
        RequestError::CommitmentOnClosedRequest { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        RequestError::InvalidQuantity { .. }
        | RequestError::DeadlineInPast { .. }
        | RequestError::DeadlineNotReached { .. }
        | RequestError::NotADonorPledge { .. }
        | RequestError::InvalidReduction { .. }
        | RequestError::DeliveryExceedsCommitment { .. } => StatusCode::BAD_REQUEST,
    }
}

fn inventory_status(err: &InventoryError) -> StatusCode {
    match err {
        InventoryError::UnitNotFound { .. } | InventoryError::UnknownBank { .. } => {
            StatusCode::NOT_FOUND
        }
        InventoryError::InsufficientStock { .. }
        | InventoryError::ReservationMismatch { .. }
        | InventoryError::InvalidTransition { .. } => StatusCode::CONFLICT,
        InventoryError::UnitExpired { .. } | InventoryError::InvalidQuantity { .. } => {
            StatusCode::BAD_REQUEST
        }
    }
}

fn testing_status(err: &TestingError) -> StatusCode {
    match err {
        TestingError::DonationNotFound { .. } => StatusCode::NOT_FOUND,
        TestingError::AlreadyDecided { .. } => StatusCode::CONFLICT,
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Orchestrator(err)
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        ApiError::Orchestrator(OrchestratorError::Domain(err))
    }
}
