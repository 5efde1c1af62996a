//! Commitments: promises of units toward a request from one supply channel.

use chrono::{DateTime, Utc};
use common::{BloodBankId, CommitmentId, DonorId, InstitutionId, JobId, UnitId};
use serde::{Deserialize, Serialize};

/// Supply channel a commitment comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Bank,
    Donor,
    Institution,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Bank => "bank",
            Channel::Donor => "donor",
            Channel::Institution => "institution",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel-specific part of a commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum CommitmentKind {
    /// Units reserved at a bank and moving under one transport job.
    BankReservation {
        bank_id: BloodBankId,
        unit_ids: Vec<UnitId>,
        job_id: JobId,
        earliest_expiry: DateTime<Utc>,
    },
    /// Donors asked to give one unit each.
    DonorPledge {
        donors: Vec<DonorId>,
        respond_by: DateTime<Utc>,
    },
    /// Institutions asked to recruit a cohort.
    InstitutionPledge {
        institutions: Vec<InstitutionId>,
        due_by: DateTime<Utc>,
    },
}

impl CommitmentKind {
    pub fn channel(&self) -> Channel {
        match self {
            CommitmentKind::BankReservation { .. } => Channel::Bank,
            CommitmentKind::DonorPledge { .. } => Channel::Donor,
            CommitmentKind::InstitutionPledge { .. } => Channel::Institution,
        }
    }

    /// Identity of the source, for read models and logs.
    pub fn source(&self) -> String {
        match self {
            CommitmentKind::BankReservation { bank_id, .. } => bank_id.to_string(),
            CommitmentKind::DonorPledge { donors, .. } => format!("{} donors", donors.len()),
            CommitmentKind::InstitutionPledge { institutions, .. } => institutions
                .iter()
                .map(|i| i.as_str())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            CommitmentKind::BankReservation { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }
}

/// Commitment state. `Open` moves to exactly one of the others, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentState {
    #[default]
    Open,
    Delivered,
    Cancelled,
    Failed,
}

impl CommitmentState {
    pub fn is_open(&self) -> bool {
        matches!(self, CommitmentState::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentState::Open => "open",
            CommitmentState::Delivered => "delivered",
            CommitmentState::Cancelled => "cancelled",
            CommitmentState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CommitmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a commitment was withdrawn without fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CancelReason {
    RequestFulfilled,
    RequestCancelled(String),
    DeadlineExceeded,
    SupersededByBankStock,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::RequestFulfilled => "request_fulfilled",
            CancelReason::RequestCancelled(_) => "request_cancelled",
            CancelReason::DeadlineExceeded => "deadline_exceeded",
            CancelReason::SupersededByBankStock => "superseded_by_bank_stock",
        }
    }
}

/// Why a commitment could not be honoured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    ReservationExpired,
    TransportFailed(String),
    ColdChainBreach,
    ReservationMismatch,
    DonorsUnresponsive,
    DonorWithdrew,
    DonationRejected,
    InstitutionUnderDelivered,
    InstitutionDeclined,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ReservationExpired => "reservation_expired",
            FailureReason::TransportFailed(_) => "transport_failed",
            FailureReason::ColdChainBreach => "cold_chain_breach",
            FailureReason::ReservationMismatch => "reservation_mismatch",
            FailureReason::DonorsUnresponsive => "donors_unresponsive",
            FailureReason::DonorWithdrew => "donor_withdrew",
            FailureReason::DonationRejected => "donation_rejected",
            FailureReason::InstitutionUnderDelivered => "institution_under_delivered",
            FailureReason::InstitutionDeclined => "institution_declined",
        }
    }
}

/// A tracked promise of units toward one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    pub id: CommitmentId,
    pub kind: CommitmentKind,
    pub units_promised: u32,
    pub units_delivered: u32,
    pub state: CommitmentState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Donors who confirmed they will donate (donor pledges only).
    pub accepted_donors: Vec<DonorId>,
    /// Delivery references already applied.
    pub references: Vec<String>,
    pub cancel_reason: Option<CancelReason>,
    pub failure_reason: Option<FailureReason>,
}

impl Commitment {
    pub fn new(
        id: CommitmentId,
        kind: CommitmentKind,
        units: u32,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            units_promised: units,
            units_delivered: 0,
            state: CommitmentState::Open,
            opened_at,
            closed_at: None,
            accepted_donors: Vec::new(),
            references: Vec::new(),
            cancel_reason: None,
            failure_reason: None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.kind.channel()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Units still expected from this commitment.
    pub fn outstanding(&self) -> u32 {
        if self.is_open() {
            self.units_promised - self.units_delivered
        } else {
            0
        }
    }

    /// Donor slots nobody has accepted yet.
    pub fn unaccepted_slots(&self) -> u32 {
        match self.kind {
            CommitmentKind::DonorPledge { .. } if self.is_open() => self
                .units_promised
                .saturating_sub(self.accepted_donors.len() as u32),
            _ => 0,
        }
    }

    pub fn has_reference(&self, reference: &str) -> bool {
        self.references.iter().any(|r| r == reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn donor_pledge(units: u32) -> Commitment {
        Commitment::new(
            CommitmentId::new(),
            CommitmentKind::DonorPledge {
                donors: vec![DonorId::new("D1"), DonorId::new("D2"), DonorId::new("D3")],
                respond_by: Utc::now(),
            },
            units,
            Utc::now(),
        )
    }

    #[test]
    fn outstanding_counts_only_open_commitments() {
        let mut c = donor_pledge(3);
        c.units_delivered = 1;
        assert_eq!(c.outstanding(), 2);

        c.state = CommitmentState::Cancelled;
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn unaccepted_slots_for_donor_pledges() {
        let mut c = donor_pledge(3);
        c.accepted_donors.push(DonorId::new("D2"));
        assert_eq!(c.unaccepted_slots(), 2);
        assert_eq!(c.channel(), Channel::Donor);
    }

    #[test]
    fn bank_reservation_exposes_job() {
        let job = JobId::new();
        let kind = CommitmentKind::BankReservation {
            bank_id: BloodBankId::new("BB-1"),
            unit_ids: vec![UnitId::new()],
            job_id: job,
            earliest_expiry: Utc::now(),
        };
        assert_eq!(kind.job_id(), Some(job));
        assert_eq!(kind.channel(), Channel::Bank);
        assert_eq!(kind.source(), "BB-1");
    }

    #[test]
    fn kind_serializes_with_channel_tag() {
        let kind = CommitmentKind::InstitutionPledge {
            institutions: vec![InstitutionId::new("COL-1")],
            due_by: Utc::now(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["channel"], "institution_pledge");
    }
}
