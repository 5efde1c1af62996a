//! Blood request domain events.

use chrono::{DateTime, Utc};
use common::{CommitmentId, DonorId, HospitalId};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;
use crate::blood::{BloodGroup, Component, Urgency};
use crate::geo::GeoPoint;

use super::{CancelReason, CommitmentKind, FailureReason, RequestId};

/// Events recorded on a blood request stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RequestEvent {
    RequestSubmitted(RequestSubmittedData),
    CommitmentOpened(CommitmentOpenedData),
    DonorAccepted(DonorResponseData),
    DonorReleased(DonorResponseData),
    CommitmentReduced(CommitmentReducedData),
    DeliveryRecorded(DeliveryRecordedData),
    CommitmentCancelled(CommitmentCancelledData),
    CommitmentFailed(CommitmentFailedData),
    RequestFulfilled(RequestClosedData),
    RequestCancelled(RequestCancelledData),
    RequestExpired(RequestClosedData),
}

impl DomainEvent for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RequestEvent::RequestSubmitted(_) => "RequestSubmitted",
            RequestEvent::CommitmentOpened(_) => "CommitmentOpened",
            RequestEvent::DonorAccepted(_) => "DonorAccepted",
            RequestEvent::DonorReleased(_) => "DonorReleased",
            RequestEvent::CommitmentReduced(_) => "CommitmentReduced",
            RequestEvent::DeliveryRecorded(_) => "DeliveryRecorded",
            RequestEvent::CommitmentCancelled(_) => "CommitmentCancelled",
            RequestEvent::CommitmentFailed(_) => "CommitmentFailed",
            RequestEvent::RequestFulfilled(_) => "RequestFulfilled",
            RequestEvent::RequestCancelled(_) => "RequestCancelled",
            RequestEvent::RequestExpired(_) => "RequestExpired",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RequestEvent::RequestSubmitted(d) => d.submitted_at,
            RequestEvent::CommitmentOpened(d) => d.opened_at,
            RequestEvent::DonorAccepted(d) | RequestEvent::DonorReleased(d) => d.at,
            RequestEvent::CommitmentReduced(d) => d.reduced_at,
            RequestEvent::DeliveryRecorded(d) => d.delivered_at,
            RequestEvent::CommitmentCancelled(d) => d.cancelled_at,
            RequestEvent::CommitmentFailed(d) => d.failed_at,
            RequestEvent::RequestFulfilled(d) | RequestEvent::RequestExpired(d) => d.at,
            RequestEvent::RequestCancelled(d) => d.cancelled_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSubmittedData {
    pub request_id: RequestId,
    pub hospital_id: HospitalId,
    pub blood_group: BloodGroup,
    pub component: Component,
    pub units: u32,
    pub urgency: Urgency,
    pub deadline: DateTime<Utc>,
    /// Where the units must be delivered.
    pub location: GeoPoint,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentOpenedData {
    pub commitment_id: CommitmentId,
    pub kind: CommitmentKind,
    pub units: u32,
    pub opened_at: DateTime<Utc>,
}

/// A donor accepting or leaving a pledge slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonorResponseData {
    pub commitment_id: CommitmentId,
    pub donor_id: DonorId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentReducedData {
    pub commitment_id: CommitmentId,
    pub from_units: u32,
    pub to_units: u32,
    pub reduced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecordedData {
    pub commitment_id: CommitmentId,
    pub units: u32,
    /// Transport job, donation or institution dispatch that produced the units.
    pub reference: String,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentCancelledData {
    pub commitment_id: CommitmentId,
    pub reason: CancelReason,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentFailedData {
    pub commitment_id: CommitmentId,
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}

/// Terminal transition carrying the final fulfilled count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestClosedData {
    pub fulfilled_units: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCancelledData {
    pub reason: String,
    pub fulfilled_units: u32,
    pub cancelled_at: DateTime<Utc>,
}

impl RequestEvent {
    pub fn commitment_opened(
        commitment_id: CommitmentId,
        kind: CommitmentKind,
        units: u32,
        at: DateTime<Utc>,
    ) -> Self {
        RequestEvent::CommitmentOpened(CommitmentOpenedData {
            commitment_id,
            kind,
            units,
            opened_at: at,
        })
    }

    pub fn donor_accepted(
        commitment_id: CommitmentId,
        donor_id: DonorId,
        at: DateTime<Utc>,
    ) -> Self {
        RequestEvent::DonorAccepted(DonorResponseData {
            commitment_id,
            donor_id,
            at,
        })
    }

    pub fn donor_released(
        commitment_id: CommitmentId,
        donor_id: DonorId,
        at: DateTime<Utc>,
    ) -> Self {
        RequestEvent::DonorReleased(DonorResponseData {
            commitment_id,
            donor_id,
            at,
        })
    }

    pub fn commitment_reduced(
        commitment_id: CommitmentId,
        from_units: u32,
        to_units: u32,
        at: DateTime<Utc>,
    ) -> Self {
        RequestEvent::CommitmentReduced(CommitmentReducedData {
            commitment_id,
            from_units,
            to_units,
            reduced_at: at,
        })
    }

    pub fn delivery_recorded(
        commitment_id: CommitmentId,
        units: u32,
        reference: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        RequestEvent::DeliveryRecorded(DeliveryRecordedData {
            commitment_id,
            units,
            reference: reference.into(),
            delivered_at: at,
        })
    }

    pub fn commitment_cancelled(
        commitment_id: CommitmentId,
        reason: CancelReason,
        at: DateTime<Utc>,
    ) -> Self {
        RequestEvent::CommitmentCancelled(CommitmentCancelledData {
            commitment_id,
            reason,
            cancelled_at: at,
        })
    }

    pub fn commitment_failed(
        commitment_id: CommitmentId,
        reason: FailureReason,
        at: DateTime<Utc>,
    ) -> Self {
        RequestEvent::CommitmentFailed(CommitmentFailedData {
            commitment_id,
            reason,
            failed_at: at,
        })
    }

    /// The commitment this event concerns, if any.
    pub fn commitment_id(&self) -> Option<CommitmentId> {
        match self {
            RequestEvent::CommitmentOpened(d) => Some(d.commitment_id),
            RequestEvent::DonorAccepted(d) | RequestEvent::DonorReleased(d) => {
                Some(d.commitment_id)
            }
            RequestEvent::CommitmentReduced(d) => Some(d.commitment_id),
            RequestEvent::DeliveryRecorded(d) => Some(d.commitment_id),
            RequestEvent::CommitmentCancelled(d) => Some(d.commitment_id),
            RequestEvent::CommitmentFailed(d) => Some(d.commitment_id),
            _ => None,
        }
    }
}
