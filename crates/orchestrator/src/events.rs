//! Events reported into the orchestrator by external actors and timers.

use chrono::{DateTime, Utc};
use common::{BloodBankId, CommitmentId, DonationId, DonorId, InstitutionId, JobId, UnitId};
use domain::{
    BloodGroup, Component, Pathogen, RequestId, TestOutcome, TestResult, TransportIssue,
    TransportStatus,
};
use serde::{Deserialize, Serialize};

/// Inbound event, in whatever order the outside world produces them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FulfillmentEvent {
    TransportProgress {
        job_id: JobId,
        status: TransportStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    TemperatureReading {
        job_id: JobId,
        celsius: f64,
        recorded_at: DateTime<Utc>,
    },
    TransportIssue {
        job_id: JobId,
        issue: TransportIssue,
    },
    DonorAccepted {
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
    },
    DonorWithdrew {
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
    },
    DonationCollected {
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        bank_id: BloodBankId,
    },
    TestResult {
        donation_id: DonationId,
        results: Vec<(Pathogen, TestResult)>,
    },
    InstitutionDelivered {
        request_id: RequestId,
        commitment_id: CommitmentId,
        institution_id: InstitutionId,
        units: u32,
        reference: String,
    },
    InstitutionDeclined {
        request_id: RequestId,
        commitment_id: CommitmentId,
        institution_id: InstitutionId,
    },
    StockAdded {
        bank_id: BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        units: u32,
        expires_at: DateTime<Utc>,
    },
    Tick {
        now: DateTime<Utc>,
    },
}

impl FulfillmentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FulfillmentEvent::TransportProgress { .. } => "transport_progress",
            FulfillmentEvent::TemperatureReading { .. } => "temperature_reading",
            FulfillmentEvent::TransportIssue { .. } => "transport_issue",
            FulfillmentEvent::DonorAccepted { .. } => "donor_accepted",
            FulfillmentEvent::DonorWithdrew { .. } => "donor_withdrew",
            FulfillmentEvent::DonationCollected { .. } => "donation_collected",
            FulfillmentEvent::TestResult { .. } => "test_result",
            FulfillmentEvent::InstitutionDelivered { .. } => "institution_delivered",
            FulfillmentEvent::InstitutionDeclined { .. } => "institution_declined",
            FulfillmentEvent::StockAdded { .. } => "stock_added",
            FulfillmentEvent::Tick { .. } => "tick",
        }
    }
}

/// What handling an event did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    /// The event arrived for something already settled and changed nothing.
    Ignored { reason: String },
    DonationRegistered { donation_id: DonationId },
    Screened { screening: TestOutcome },
    StockAdmitted { unit_ids: Vec<UnitId> },
}

impl EventOutcome {
    pub(crate) fn ignored(reason: impl Into<String>) -> Self {
        EventOutcome::Ignored {
            reason: reason.into(),
        }
    }
}
