//! Raw event intake for integrations that report asynchronously.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use event_store::EventStore;
use orchestrator::FulfillmentEvent;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct QueuedResponse {
    pub queued: &'static str,
}

/// POST /events: queues any inbound event for the orchestrator's event loop.
/// The outcome is not reported back; follow it on `/requests/{id}`.
#[tracing::instrument(skip(state, event), fields(event = event.kind()))]
pub async fn enqueue<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(event): Json<FulfillmentEvent>,
) -> Result<(StatusCode, Json<QueuedResponse>), ApiError> {
    let kind = event.kind();
    state
        .events
        .send(event)
        .await
        .map_err(|_| ApiError::Internal("Event loop is not running".into()))?;
    metrics::counter!("api_events_queued_total", "event" => kind).increment(1);
    Ok((StatusCode::ACCEPTED, Json(QueuedResponse { queued: kind })))
}
