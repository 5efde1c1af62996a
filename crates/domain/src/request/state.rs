//! Request lifecycle.

use serde::{Deserialize, Serialize};

/// Status of a blood request.
///
/// ```text
/// Pending ──► Processing ──► Fulfilled
///    │            │
///    └────────────┴──► Cancelled | Expired
/// ```
///
/// `PartiallyFulfilled` is never stored. It is derived from `Processing`
/// when some units have arrived and the deadline is close (see
/// `BloodRequest::status_at`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Pending,
    Processing,
    PartiallyFulfilled,
    Fulfilled,
    Cancelled,
    Expired,
}

impl RequestStatus {
    /// New commitments may only be opened while the request is live.
    pub fn can_open_commitment(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending | RequestStatus::Processing | RequestStatus::PartiallyFulfilled
        )
    }

    pub fn can_expire(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Fulfilled | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::PartiallyFulfilled => "partially_fulfilled",
            RequestStatus::Fulfilled => "fulfilled",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
