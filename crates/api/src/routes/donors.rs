//! Donor responses, donation intake and screening results.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{BloodBankId, DonationId, DonorId};
use domain::{Pathogen, TestResult};
use event_store::EventStore;
use orchestrator::{EventOutcome, FulfillmentEvent};
use serde::Deserialize;

use super::{parse_commitment_id, parse_request_id, parse_uuid};
use crate::AppState;
use crate::error::ApiError;

type DonorPath = Path<(String, String, String)>;

#[derive(Deserialize)]
pub struct DonationBody {
    /// Bank where the donation was taken.
    pub bank_id: String,
}

#[derive(Deserialize)]
pub struct PanelResult {
    pub pathogen: Pathogen,
    pub result: TestResult,
}

#[derive(Deserialize)]
pub struct ResultsBody {
    pub results: Vec<PanelResult>,
}

/// POST /requests/{id}/commitments/{cid}/donors/{donor}/accept
#[tracing::instrument(skip(state))]
pub async fn accept<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((id, cid, donor)): DonorPath,
) -> Result<Json<EventOutcome>, ApiError> {
    let event = FulfillmentEvent::DonorAccepted {
        request_id: parse_request_id(&id)?,
        commitment_id: parse_commitment_id(&cid)?,
        donor_id: DonorId::new(donor),
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}

/// POST /requests/{id}/commitments/{cid}/donors/{donor}/withdraw
#[tracing::instrument(skip(state))]
pub async fn withdraw<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((id, cid, donor)): DonorPath,
) -> Result<Json<EventOutcome>, ApiError> {
    let event = FulfillmentEvent::DonorWithdrew {
        request_id: parse_request_id(&id)?,
        commitment_id: parse_commitment_id(&cid)?,
        donor_id: DonorId::new(donor),
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}

/// POST /requests/{id}/commitments/{cid}/donors/{donor}/donate: the donor
/// gave blood; the donation waits at the testing gate.
#[tracing::instrument(skip(state, body))]
pub async fn donate<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((id, cid, donor)): DonorPath,
    Json(body): Json<DonationBody>,
) -> Result<Json<EventOutcome>, ApiError> {
    let event = FulfillmentEvent::DonationCollected {
        request_id: parse_request_id(&id)?,
        commitment_id: parse_commitment_id(&cid)?,
        donor_id: DonorId::new(donor),
        bank_id: BloodBankId::new(body.bank_id),
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}

/// POST /donations/{id}/results
#[tracing::instrument(skip(state, body))]
pub async fn results<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(body): Json<ResultsBody>,
) -> Result<Json<EventOutcome>, ApiError> {
    if body.results.is_empty() {
        return Err(ApiError::BadRequest("No test results given".into()));
    }
    let event = FulfillmentEvent::TestResult {
        donation_id: DonationId::from(parse_uuid(&id, "donation")?),
        results: body
            .results
            .into_iter()
            .map(|r| (r.pathogen, r.result))
            .collect(),
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}
