//! Feeds journal envelopes to registered projections.

use std::sync::Arc;

use event_store::{EventEnvelope, EventStore, EventSubscription};
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::Result;
use crate::projection::Projection;

/// Drives projections from an event store.
///
/// - Catch-up replays the whole journal, skipping envelopes a projection has
///   already applied.
/// - The live feed applies envelopes as the journal broadcasts them and falls
///   back to catch-up when it lags.
/// - Rebuild resets every projection and replays from scratch.
pub struct ProjectionProcessor<S: EventStore> {
    store: S,
    projections: Vec<Box<dyn Projection>>,
    /// Serializes delivery so a replay racing the live feed applies each
    /// envelope once.
    delivery: Mutex<()>,
}

impl<S: EventStore> ProjectionProcessor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            projections: Vec::new(),
            delivery: Mutex::new(()),
        }
    }

    pub fn register(&mut self, projection: Box<dyn Projection>) {
        self.projections.push(projection);
    }

    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }

    #[tracing::instrument(skip(self))]
    pub async fn run_catch_up(&self) -> Result<()> {
        let mut stream = self.store.stream_all_events().await?;
        let mut replayed: u64 = 0;

        while let Some(result) = stream.next().await {
            let event = result?;
            replayed += 1;
            self.process_event(&event).await?;
        }

        tracing::info!(replayed, "catch-up complete");
        Ok(())
    }

    /// Delivers one envelope to every projection that has not applied it yet.
    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, sequence = event.sequence)
    )]
    pub async fn process_event(&self, event: &EventEnvelope) -> Result<()> {
        let _delivery = self.delivery.lock().await;
        for projection in &self.projections {
            if projection.position().await.has_seen(event.sequence) {
                continue;
            }
            projection.handle(event).await?;
            metrics::counter!("projections_events_processed", "projection" => projection.name())
                .increment(1);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn rebuild_all(&self) -> Result<()> {
        for projection in &self.projections {
            projection.reset().await?;
        }
        self.run_catch_up().await
    }

    /// Applies live envelopes until the journal feed closes.
    pub async fn run_live(&self, mut subscription: EventSubscription) -> Result<()> {
        loop {
            match subscription.recv().await {
                Ok(event) => self.process_event(&event).await?,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "projection feed lagged, replaying journal");
                    self.run_catch_up().await?;
                }
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Catches up, then follows the live feed. The subscription is taken
    /// before the replay so nothing appended in between is missed.
    pub async fn follow(&self) -> Result<()> {
        let subscription = self.store.subscribe();
        self.run_catch_up().await?;
        self.run_live(subscription).await
    }

    /// Runs [`follow`](Self::follow) on a background task.
    pub fn spawn_follow(self: Arc<Self>) -> JoinHandle<()>
    where
        S: 'static,
    {
        tokio::spawn(async move {
            if let Err(error) = self.follow().await {
                tracing::error!(%error, "projection processor stopped");
            }
        })
    }
}
