//! Blood units and their lifecycle.

use chrono::{DateTime, Utc};
use common::{BloodBankId, UnitId};
use serde::{Deserialize, Serialize};

use crate::blood::{BloodGroup, Component};
use crate::request::RequestId;

/// Status of a physical unit.
///
/// ```text
/// AwaitingTest ──► Available ◄──► Reserved ──► Issued
///       │              │              │
///       └──────────────┴──────────────┴──► Expired | Discarded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    AwaitingTest,
    Available,
    Reserved,
    Issued,
    Expired,
    Discarded,
}

impl UnitStatus {
    pub fn can_reserve(&self) -> bool {
        matches!(self, UnitStatus::Available)
    }

    pub fn can_issue(&self) -> bool {
        matches!(self, UnitStatus::Reserved)
    }

    /// Expiry and discard apply to any unit not yet out of circulation.
    pub fn can_expire(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Issued | UnitStatus::Expired | UnitStatus::Discarded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::AwaitingTest => "awaiting_test",
            UnitStatus::Available => "available",
            UnitStatus::Reserved => "reserved",
            UnitStatus::Issued => "issued",
            UnitStatus::Expired => "expired",
            UnitStatus::Discarded => "discarded",
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hold tying a unit to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub request_id: RequestId,
    pub reserved_at: DateTime<Utc>,
}

/// One physically distinct unit of a blood component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodUnit {
    pub id: UnitId,
    pub bank_id: BloodBankId,
    pub blood_group: BloodGroup,
    pub component: Component,
    pub status: UnitStatus,
    pub expires_at: DateTime<Utc>,
    pub reservation: Option<Reservation>,
}

impl BloodUnit {
    /// A freshly collected unit, held until its tests clear.
    pub fn collected(
        bank_id: BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UnitId::new(),
            bank_id,
            blood_group,
            component,
            status: UnitStatus::AwaitingTest,
            expires_at,
            reservation: None,
        }
    }

    pub fn matches(&self, blood_group: BloodGroup, component: Component) -> bool {
        self.blood_group == blood_group && self.component == component
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Reservable right now.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.can_reserve() && !self.is_expired_at(now)
    }

    pub fn reserved_for(&self) -> Option<RequestId> {
        self.reservation.map(|r| r.request_id)
    }
}
