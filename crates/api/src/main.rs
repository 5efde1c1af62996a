//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use event_store::InMemoryEventStore;
use orchestrator::OrchestratorConfig;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Periodically sweeps expired units, due timers and deadlines.
fn spawn_sweeper(
    orchestrator: Arc<api::Orchestrator<InMemoryEventStore>>,
    config: &Config,
) -> JoinHandle<()> {
    let mut interval = tokio::time::interval(config.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            let report = orchestrator.tick(orchestrator.now()).await;
            if report.expired_units > 0 || report.timers_fired > 0 {
                tracing::info!(
                    expired_units = report.expired_units,
                    timers_fired = report.timers_fired,
                    "sweep"
                );
            }
        }
    })
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let event_store = InMemoryEventStore::new();
    let orchestrator_config = OrchestratorConfig::from_env();
    tracing::info!(?orchestrator_config, "orchestrator configured");
    let (state, processor) = api::create_default_state(event_store, orchestrator_config);

    // Replays anything already journaled, then follows the live feed.
    let projections = processor.spawn_follow();
    let sweeper = spawn_sweeper(Arc::clone(&state.orchestrator), &config);

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, sweep_secs = config.sweep_interval.as_secs(), "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    sweeper.abort();
    projections.abort();
    tracing::info!("server shut down gracefully");
}
