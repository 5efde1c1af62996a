//! HTTP surface of the blood supply fulfillment orchestrator.
//!
//! Hospitals submit and follow requests, and banks, donors, institutions and
//! couriers report what they did. Structured logging comes from tracing and
//! Prometheus metrics are served at `/metrics`.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::{
    FulfillmentEvent, FulfillmentOrchestrator, InMemoryFacilityDirectory, OrchestratorConfig,
    TracingNotifier,
};
use projections::{ChannelActivityView, Projection, ProjectionProcessor, RequestBoardView};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Orchestrator wired to the in-memory directory and the logging notifier.
pub type Orchestrator<S> = FulfillmentOrchestrator<S, InMemoryFacilityDirectory, TracingNotifier>;

/// Capacity of the queue behind `POST /events`.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Shared application state accessible from all handlers.
pub struct AppState<S: EventStore + Clone> {
    pub orchestrator: Arc<Orchestrator<S>>,
    pub directory: InMemoryFacilityDirectory,
    pub board: RequestBoardView,
    pub activity: ChannelActivityView,
    pub event_store: S,
    pub projection_processor: Arc<ProjectionProcessor<S>>,
    /// Feeds the orchestrator's event loop.
    pub events: mpsc::Sender<FulfillmentEvent>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: EventStore + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(routes::metrics::MetricsState {
            handle: metrics_handle,
            board: state.board.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/requests",
            post(routes::requests::submit::<S>).get(routes::requests::list::<S>),
        )
        .route("/requests/{id}", get(routes::requests::get::<S>))
        .route("/requests/{id}/cancel", post(routes::requests::cancel::<S>))
        .route("/requests/{id}/events", get(routes::requests::events::<S>))
        .route("/channels", get(routes::requests::channels::<S>))
        .route("/facilities", post(routes::facilities::register::<S>))
        .route("/banks/{id}/units", post(routes::facilities::add_units::<S>))
        .route(
            "/requests/{id}/commitments/{cid}/donors/{donor}/accept",
            post(routes::donors::accept::<S>),
        )
        .route(
            "/requests/{id}/commitments/{cid}/donors/{donor}/withdraw",
            post(routes::donors::withdraw::<S>),
        )
        .route(
            "/requests/{id}/commitments/{cid}/donors/{donor}/donate",
            post(routes::donors::donate::<S>),
        )
        .route("/donations/{id}/results", post(routes::donors::results::<S>))
        .route(
            "/requests/{id}/commitments/{cid}/institution/deliver",
            post(routes::institutions::deliver::<S>),
        )
        .route(
            "/requests/{id}/commitments/{cid}/institution/decline",
            post(routes::institutions::decline::<S>),
        )
        .route("/transport/{job}/status", post(routes::transport::status::<S>))
        .route(
            "/transport/{job}/temperature",
            post(routes::transport::temperature::<S>),
        )
        .route("/transport/{job}/issues", post(routes::transport::issues::<S>))
        .route("/events", post(routes::inbound::enqueue::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the orchestrator, its read models and the event loop.
///
/// Must be called inside a Tokio runtime: the orchestrator's event loop is
/// spawned here.
pub fn create_default_state<S: EventStore + Clone + 'static>(
    event_store: S,
    config: OrchestratorConfig,
) -> (Arc<AppState<S>>, Arc<ProjectionProcessor<S>>) {
    let directory = InMemoryFacilityDirectory::new();
    let orchestrator = Arc::new(FulfillmentOrchestrator::new(
        event_store.clone(),
        directory.clone(),
        TracingNotifier,
        config,
    ));

    let board = RequestBoardView::new();
    let activity = ChannelActivityView::new();

    let mut processor = ProjectionProcessor::new(event_store.clone());
    processor.register(Box::new(board.clone()) as Box<dyn Projection>);
    processor.register(Box::new(activity.clone()) as Box<dyn Projection>);
    let processor = Arc::new(processor);

    let (events, inbound) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    Arc::clone(&orchestrator).spawn_event_loop(inbound);

    let state = Arc::new(AppState {
        orchestrator,
        directory,
        board,
        activity,
        event_store,
        projection_processor: Arc::clone(&processor),
        events,
    });

    (state, processor)
}
