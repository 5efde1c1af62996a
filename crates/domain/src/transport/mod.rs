//! Transport jobs between banks and hospitals, with cold-chain monitoring.

mod aggregate;
mod cold_chain;
mod events;
mod service;
mod state;

pub use aggregate::TransportJob;
pub use cold_chain::{ColdChainPolicy, IssueKind, Severity, TemperatureReading, TransportIssue};
pub use events::{
    IssueReportedData, JobScheduledData, StatusChangedData, TemperatureRecordedData,
    TransportEvent,
};
pub use service::{ColdChainAssessment, TransportCoordinator};
pub use state::TransportStatus;

use common::{BloodBankId, CommitmentId, HospitalId, JobId, UnitId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::RequestId;

/// Everything needed to move reserved units for one commitment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTransport {
    pub request_id: RequestId,
    pub commitment_id: CommitmentId,
    pub source: BloodBankId,
    pub destination: HospitalId,
    pub unit_ids: Vec<UnitId>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport job {job_id} already scheduled")]
    AlreadyScheduled { job_id: JobId },

    #[error("Transport job has not been scheduled")]
    NotScheduled,

    #[error("Transport job must carry at least one unit")]
    NoUnits,

    #[error("Transport job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: TransportStatus,
        to: TransportStatus,
    },

    #[error("Transport job {job_id} is closed ({status})")]
    JobClosed {
        job_id: JobId,
        status: TransportStatus,
    },
}
