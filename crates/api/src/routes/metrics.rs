//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use domain::Urgency;
use metrics_exporter_prometheus::PrometheusHandle;
use projections::RequestBoardView;

/// Recorder handle plus the board used to refresh open-request gauges.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub board: RequestBoardView,
}

/// GET /metrics
pub async fn get(State(state): State<MetricsState>) -> impl IntoResponse {
    let open = state.board.open().await;
    for urgency in [Urgency::Low, Urgency::Medium, Urgency::High, Urgency::Critical] {
        let count = open.iter().filter(|r| r.urgency == urgency).count();
        metrics::gauge!("requests_open", "urgency" => urgency.as_str()).set(count as f64);
    }

    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.handle.render(),
    )
}
