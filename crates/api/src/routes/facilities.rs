//! Directory registration and bank stock intake.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{BloodBankId, UnitId};
use domain::{BloodGroup, Component};
use event_store::EventStore;
use orchestrator::Facility;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct StockIntake {
    pub blood_group: BloodGroup,
    pub component: Component,
    pub units: u32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct StockAdmittedResponse {
    pub bank_id: BloodBankId,
    pub unit_ids: Vec<UnitId>,
}

/// POST /facilities: registers (or replaces) a bank, donor or institution.
#[tracing::instrument(
    skip(state, facility),
    fields(facility_id = %facility.id, kind = ?facility.kind)
)]
pub async fn register<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(facility): Json<Facility>,
) -> Result<(StatusCode, Json<Facility>), ApiError> {
    if facility.id.trim().is_empty() {
        return Err(ApiError::BadRequest("Facility id must not be empty".into()));
    }
    state.directory.register(facility.clone());
    tracing::info!(registered = state.directory.len(), "facility registered");
    Ok((StatusCode::CREATED, Json(facility)))
}

/// POST /banks/{id}/units: takes cleared units into stock and offers them to
/// open requests.
#[tracing::instrument(skip(state, intake))]
pub async fn add_units<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(bank): Path<String>,
    Json(intake): Json<StockIntake>,
) -> Result<(StatusCode, Json<StockAdmittedResponse>), ApiError> {
    let bank_id = BloodBankId::new(bank);
    let unit_ids = state
        .orchestrator
        .admit_stock(
            bank_id.clone(),
            intake.blood_group,
            intake.component,
            intake.units,
            intake.expires_at,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StockAdmittedResponse { bank_id, unit_ids }),
    ))
}
