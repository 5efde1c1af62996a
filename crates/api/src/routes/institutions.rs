//! Institution cohort reports.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::InstitutionId;
use event_store::EventStore;
use orchestrator::{EventOutcome, FulfillmentEvent};
use serde::Deserialize;

use super::{parse_commitment_id, parse_request_id};
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct DeliveredBody {
    pub institution_id: String,
    pub units: u32,
    /// Dispatch reference; repeating it is harmless.
    pub reference: String,
}

#[derive(Deserialize)]
pub struct DeclinedBody {
    pub institution_id: String,
}

/// POST /requests/{id}/commitments/{cid}/institution/deliver
#[tracing::instrument(skip(state, body))]
pub async fn deliver<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((id, cid)): Path<(String, String)>,
    Json(body): Json<DeliveredBody>,
) -> Result<Json<EventOutcome>, ApiError> {
    let event = FulfillmentEvent::InstitutionDelivered {
        request_id: parse_request_id(&id)?,
        commitment_id: parse_commitment_id(&cid)?,
        institution_id: InstitutionId::new(body.institution_id),
        units: body.units,
        reference: body.reference,
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}

/// POST /requests/{id}/commitments/{cid}/institution/decline
#[tracing::instrument(skip(state, body))]
pub async fn decline<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((id, cid)): Path<(String, String)>,
    Json(body): Json<DeclinedBody>,
) -> Result<Json<EventOutcome>, ApiError> {
    let event = FulfillmentEvent::InstitutionDeclined {
        request_id: parse_request_id(&id)?,
        commitment_id: parse_commitment_id(&cid)?,
        institution_id: InstitutionId::new(body.institution_id),
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}
