//! Courier reports for transport jobs.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use common::JobId;
use domain::transport::IssueKind;
use domain::{Severity, TransportIssue, TransportStatus};
use event_store::EventStore;
use orchestrator::{EventOutcome, FulfillmentEvent};
use serde::Deserialize;

use super::parse_uuid;
use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct StatusBody {
    pub status: TransportStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Deserialize)]
pub struct TemperatureBody {
    pub celsius: f64,
    /// Defaults to the orchestrator's clock.
    #[serde(default)]
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct IssueBody {
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    parse_uuid(id, "transport job").map(JobId::from)
}

/// POST /transport/{job}/status
#[tracing::instrument(skip(state, body), fields(status = ?body.status))]
pub async fn status<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(job): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<EventOutcome>, ApiError> {
    let event = FulfillmentEvent::TransportProgress {
        job_id: parse_job_id(&job)?,
        status: body.status,
        reason: body.reason,
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}

/// POST /transport/{job}/temperature
#[tracing::instrument(skip(state, body), fields(celsius = body.celsius))]
pub async fn temperature<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(job): Path<String>,
    Json(body): Json<TemperatureBody>,
) -> Result<Json<EventOutcome>, ApiError> {
    if !body.celsius.is_finite() {
        return Err(ApiError::BadRequest("Temperature must be a finite number".into()));
    }
    let event = FulfillmentEvent::TemperatureReading {
        job_id: parse_job_id(&job)?,
        celsius: body.celsius,
        recorded_at: body
            .recorded_at
            .unwrap_or_else(|| state.orchestrator.now()),
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}

/// POST /transport/{job}/issues
#[tracing::instrument(skip(state, body), fields(severity = ?body.severity))]
pub async fn issues<S: EventStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(job): Path<String>,
    Json(body): Json<IssueBody>,
) -> Result<Json<EventOutcome>, ApiError> {
    let issue = TransportIssue::new(
        body.kind,
        body.severity,
        body.description,
        body.reported_at
            .unwrap_or_else(|| state.orchestrator.now()),
    );
    let event = FulfillmentEvent::TransportIssue {
        job_id: parse_job_id(&job)?,
        issue,
    };
    Ok(Json(state.orchestrator.handle(event).await?))
}
