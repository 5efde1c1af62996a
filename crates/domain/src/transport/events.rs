//! Transport job domain events.

use chrono::{DateTime, Utc};
use common::{BloodBankId, CommitmentId, HospitalId, JobId, UnitId};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;
use crate::request::RequestId;

use super::{TemperatureReading, TransportIssue, TransportStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransportEvent {
    JobScheduled(JobScheduledData),
    StatusChanged(StatusChangedData),
    TemperatureRecorded(TemperatureRecordedData),
    IssueReported(IssueReportedData),
}

impl DomainEvent for TransportEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransportEvent::JobScheduled(_) => "JobScheduled",
            TransportEvent::StatusChanged(_) => "StatusChanged",
            TransportEvent::TemperatureRecorded(_) => "TemperatureRecorded",
            TransportEvent::IssueReported(_) => "IssueReported",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransportEvent::JobScheduled(d) => d.scheduled_at,
            TransportEvent::StatusChanged(d) => d.at,
            TransportEvent::TemperatureRecorded(d) => d.reading.recorded_at,
            TransportEvent::IssueReported(d) => d.issue.reported_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobScheduledData {
    pub job_id: JobId,
    pub request_id: RequestId,
    pub commitment_id: CommitmentId,
    pub source: BloodBankId,
    pub destination: HospitalId,
    pub unit_ids: Vec<UnitId>,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangedData {
    pub from: TransportStatus,
    pub to: TransportStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureRecordedData {
    pub reading: TemperatureReading,
    pub in_range: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueReportedData {
    pub issue: TransportIssue,
}
