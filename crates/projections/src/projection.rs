//! Core projection trait and journal position tracking.

use async_trait::async_trait;
use event_store::EventEnvelope;

use crate::Result;

/// How far into the journal a projection has read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionPosition {
    /// Global sequence of the last envelope applied.
    pub sequence: u64,
    pub events_processed: u64,
}

impl ProjectionPosition {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Position after applying the envelope at `sequence`.
    pub fn advance(&self, sequence: u64) -> Self {
        Self {
            sequence: sequence.max(self.sequence),
            events_processed: self.events_processed + 1,
        }
    }

    /// Whether the envelope at `sequence` has already been applied.
    pub fn has_seen(&self, sequence: u64) -> bool {
        sequence != 0 && sequence <= self.sequence
    }
}

impl std::fmt::Display for ProjectionPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position({}, {} events)", self.sequence, self.events_processed)
    }
}

/// Folds journal envelopes into a read model.
///
/// `handle` sees every envelope in journal order, including streams the
/// projection does not care about; it must still advance its position for
/// those.
#[async_trait]
pub trait Projection: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &EventEnvelope) -> Result<()>;

    async fn position(&self) -> ProjectionPosition;

    /// Clears the read model so the journal can be replayed into it.
    async fn reset(&self) -> Result<()>;
}
