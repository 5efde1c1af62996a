//! Hospital-facing request endpoints and the read-model listings.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use domain::{Channel, RequestSpec, RequestStatus};
use event_store::EventStore;
use common::AggregateId;
use orchestrator::RequestStatusView;
use projections::{ChannelActivity, RequestBoardRow};
use serde::{Deserialize, Serialize};

use super::parse_request_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct RequestCreatedResponse {
    pub request_id: String,
    pub status: RequestStatusView,
}

#[derive(Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<RequestStatus>,
}

#[derive(Serialize)]
pub struct EventEnvelopeResponse {
    pub sequence: u64,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub version: i64,
    pub recorded_at: String,
    pub payload: serde_json::Value,
}

/// POST /requests
#[tracing::instrument(skip(state, spec), fields(hospital_id = %spec.hospital_id))]
pub async fn submit<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(spec): Json<RequestSpec>,
) -> Result<(StatusCode, Json<RequestCreatedResponse>), ApiError> {
    let request_id = state.orchestrator.submit(spec).await?;
    let status = state.orchestrator.status(request_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(RequestCreatedResponse {
            request_id: request_id.to_string(),
            status,
        }),
    ))
}

/// GET /requests, optionally filtered with `?status=`.
#[tracing::instrument(skip(state, query))]
pub async fn list<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RequestBoardRow>>, ApiError> {
    state
        .projection_processor
        .run_catch_up()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let rows = match query.status {
        Some(status) => state.board.by_status(status).await,
        None => state.board.all().await,
    };
    Ok(Json(rows))
}

/// GET /requests/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<RequestStatusView>, ApiError> {
    let request_id = parse_request_id(&id)?;
    Ok(Json(state.orchestrator.status(request_id).await?))
}

/// POST /requests/{id}/cancel, with an optional `{"reason": ...}` body.
#[tracing::instrument(skip(state, body))]
pub async fn cancel<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<RequestStatusView>, ApiError> {
    let request_id = parse_request_id(&id)?;
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<CancelBody>(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid cancel body: {e}")))?
            .reason
    }
    .unwrap_or_else(|| "cancelled by hospital".to_string());
    Ok(Json(state.orchestrator.cancel(request_id, &reason).await?))
}

/// GET /requests/{id}/events: the request stream and its transport jobs,
/// in journal order.
#[tracing::instrument(skip(state))]
pub async fn events<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventEnvelopeResponse>>, ApiError> {
    let request_id = parse_request_id(&id)?;
    let request = state
        .orchestrator
        .requests()
        .get(request_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Request {id} not found")))?;

    let mut streams = vec![request_id];
    streams.extend(
        request
            .commitments()
            .iter()
            .filter_map(|c| c.kind.job_id())
            .map(AggregateId::from),
    );

    let mut envelopes = Vec::new();
    for stream in streams {
        envelopes.extend(
            state
                .event_store
                .get_events_for_aggregate(stream)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?,
        );
    }
    envelopes.sort_by_key(|e| e.sequence);

    let responses = envelopes
        .into_iter()
        .map(|e| EventEnvelopeResponse {
            sequence: e.sequence,
            event_type: e.event_type,
            aggregate_type: e.aggregate_type,
            aggregate_id: e.aggregate_id.to_string(),
            version: e.version.as_i64(),
            recorded_at: e.recorded_at.to_rfc3339(),
            payload: e.payload,
        })
        .collect();

    Ok(Json(responses))
}

/// GET /channels: commitment activity per supply channel.
pub async fn channels<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<BTreeMap<Channel, ChannelActivity>>, ApiError> {
    state
        .projection_processor
        .run_catch_up()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(state.activity.all().await))
}
