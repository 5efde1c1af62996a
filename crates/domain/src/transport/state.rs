//! Transport job lifecycle.

use serde::{Deserialize, Serialize};

/// Status of a transport job.
///
/// ```text
/// Scheduled ──► Dispatched ──► EnRoute ──► Arrived ──► Delivered
///     │             │             │           │
///     └─► Cancelled ◄┘            └───────────┴──► Failed
///                   └──────────────────────────────► Failed
/// ```
///
/// Once en route a job can only end delivered or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    #[default]
    Scheduled,
    Dispatched,
    EnRoute,
    Arrived,
    Delivered,
    Cancelled,
    Failed,
}

impl TransportStatus {
    pub fn can_transition_to(&self, next: TransportStatus) -> bool {
        use TransportStatus::*;
        matches!(
            (self, next),
            (Scheduled, Dispatched)
                | (Dispatched, EnRoute)
                | (EnRoute, Arrived)
                | (Arrived, Delivered)
                | (Scheduled | Dispatched, Cancelled)
                | (Dispatched | EnRoute | Arrived, Failed)
        )
    }

    pub fn can_cancel(&self) -> bool {
        self.can_transition_to(TransportStatus::Cancelled)
    }

    /// Units are physically moving and the job can no longer be called off.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TransportStatus::EnRoute | TransportStatus::Arrived)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportStatus::Delivered | TransportStatus::Cancelled | TransportStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportStatus::Scheduled => "scheduled",
            TransportStatus::Dispatched => "dispatched",
            TransportStatus::EnRoute => "en_route",
            TransportStatus::Arrived => "arrived",
            TransportStatus::Delivered => "delivered",
            TransportStatus::Cancelled => "cancelled",
            TransportStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
