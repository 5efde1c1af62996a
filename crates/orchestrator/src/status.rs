//! Read model returned by `status`.

use chrono::{DateTime, Duration, Utc};
use common::{CommitmentId, HospitalId, JobId};
use domain::{
    BloodGroup, BloodRequest, Channel, Commitment, CommitmentState, Component,
    RequestId, RequestStatus, TransportJob, TransportStatus, Urgency,
};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RequestStatusView {
    pub request_id: RequestId,
    pub hospital_id: Option<HospitalId>,
    pub blood_group: BloodGroup,
    pub component: Component,
    pub urgency: Urgency,
    pub status: RequestStatus,
    pub units_requested: u32,
    pub fulfilled_units: u32,
    pub shortfall: u32,
    pub deadline: DateTime<Utc>,
    pub commitments: Vec<CommitmentView>,
    pub transport_jobs: Vec<TransportJobView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitmentView {
    pub commitment_id: CommitmentId,
    pub channel: Channel,
    pub source: String,
    pub units_promised: u32,
    pub units_delivered: u32,
    pub state: CommitmentState,
    /// Cancellation or failure reason, if closed without delivering.
    pub closed_because: Option<&'static str>,
}

impl From<&Commitment> for CommitmentView {
    fn from(c: &Commitment) -> Self {
        let closed_because = c
            .cancel_reason
            .as_ref()
            .map(|r| r.as_str())
            .or_else(|| c.failure_reason.as_ref().map(|r| r.as_str()));
        Self {
            commitment_id: c.id,
            channel: c.channel(),
            source: c.kind.source(),
            units_promised: c.units_promised,
            units_delivered: c.units_delivered,
            state: c.state,
            closed_because,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportJobView {
    pub job_id: Option<JobId>,
    pub commitment_id: Option<CommitmentId>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub status: TransportStatus,
    pub units: usize,
    pub issues: usize,
    pub last_celsius: Option<f64>,
}

impl From<&TransportJob> for TransportJobView {
    fn from(job: &TransportJob) -> Self {
        Self {
            job_id: job.job_id(),
            commitment_id: job.commitment_id(),
            source: job.source().map(ToString::to_string),
            destination: job.destination().map(ToString::to_string),
            status: job.status(),
            units: job.unit_ids().len(),
            issues: job.issues().len(),
            last_celsius: job.temperature_log().last().map(|r| r.celsius),
        }
    }
}

impl RequestStatusView {
    pub(crate) fn build(
        request_id: RequestId,
        request: &BloodRequest,
        jobs: &[TransportJob],
        now: DateTime<Utc>,
        closing_window: Duration,
    ) -> Self {
        Self {
            request_id,
            hospital_id: request.hospital_id().cloned(),
            blood_group: request.blood_group(),
            component: request.component(),
            urgency: request.urgency(),
            status: request.status_at(now, closing_window),
            units_requested: request.units_requested(),
            fulfilled_units: request.fulfilled_units(),
            shortfall: request.shortfall(),
            deadline: request.deadline(),
            commitments: request.commitments().iter().map(CommitmentView::from).collect(),
            transport_jobs: jobs.iter().map(TransportJobView::from).collect(),
        }
    }
}
