//! Blood request aggregate.

use chrono::{DateTime, Duration, Utc};
use common::{AggregateId, CommitmentId, DonorId, HospitalId};
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::blood::{BloodGroup, Component, Urgency};
use crate::geo::GeoPoint;

use super::{
    CancelReason, Commitment, CommitmentKind, CommitmentState, FailureReason, RequestError,
    RequestEvent, RequestSpec, RequestStatus,
    events::{RequestCancelledData, RequestClosedData, RequestSubmittedData},
};

/// A hospital's need for blood, and the authoritative record of how much of
/// it is covered.
///
/// The aggregate is the single writer of the fulfilled counter. Other
/// components only emit the commands that move it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BloodRequest {
    id: Option<AggregateId>,

    #[serde(default)]
    version: Version,

    hospital_id: Option<HospitalId>,
    blood_group: BloodGroup,
    component: Component,
    units_requested: u32,
    urgency: Urgency,
    deadline: DateTime<Utc>,
    location: GeoPoint,
    submitted_at: DateTime<Utc>,
    status: RequestStatus,
    fulfilled_units: u32,
    commitments: Vec<Commitment>,
    closed_at: Option<DateTime<Utc>>,
}

impl Aggregate for BloodRequest {
    type Event = RequestEvent;
    type Error = RequestError;

    fn aggregate_type() -> &'static str {
        "BloodRequest"
    }

    fn id(&self) -> Option<AggregateId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            RequestEvent::RequestSubmitted(data) => self.apply_submitted(data),
            RequestEvent::CommitmentOpened(data) => {
                self.commitments.push(Commitment::new(
                    data.commitment_id,
                    data.kind,
                    data.units,
                    data.opened_at,
                ));
                self.status = RequestStatus::Processing;
            }
            RequestEvent::DonorAccepted(data) => {
                if let Some(c) = self.commitment_mut(data.commitment_id) {
                    c.accepted_donors.push(data.donor_id);
                }
            }
            RequestEvent::DonorReleased(data) => {
                if let Some(c) = self.commitment_mut(data.commitment_id) {
                    c.accepted_donors.retain(|d| d != &data.donor_id);
                }
            }
            RequestEvent::CommitmentReduced(data) => {
                if let Some(c) = self.commitment_mut(data.commitment_id) {
                    c.units_promised = data.to_units;
                    if c.units_delivered == c.units_promised {
                        c.state = CommitmentState::Delivered;
                        c.closed_at = Some(data.reduced_at);
                    }
                }
            }
            RequestEvent::DeliveryRecorded(data) => {
                if let Some(c) = self.commitment_mut(data.commitment_id) {
                    c.units_delivered += data.units;
                    c.references.push(data.reference);
                    if c.units_delivered == c.units_promised {
                        c.state = CommitmentState::Delivered;
                        c.closed_at = Some(data.delivered_at);
                    }
                }
                self.fulfilled_units += data.units;
                self.status = RequestStatus::Processing;
            }
            RequestEvent::CommitmentCancelled(data) => {
                if let Some(c) = self.commitment_mut(data.commitment_id) {
                    c.state = CommitmentState::Cancelled;
                    c.cancel_reason = Some(data.reason);
                    c.closed_at = Some(data.cancelled_at);
                }
            }
            RequestEvent::CommitmentFailed(data) => {
                if let Some(c) = self.commitment_mut(data.commitment_id) {
                    c.state = CommitmentState::Failed;
                    c.failure_reason = Some(data.reason);
                    c.closed_at = Some(data.failed_at);
                }
            }
            RequestEvent::RequestFulfilled(data) => {
                self.status = RequestStatus::Fulfilled;
                self.closed_at = Some(data.at);
            }
            RequestEvent::RequestCancelled(data) => {
                self.status = RequestStatus::Cancelled;
                self.closed_at = Some(data.cancelled_at);
            }
            RequestEvent::RequestExpired(data) => {
                self.status = RequestStatus::Expired;
                self.closed_at = Some(data.at);
            }
        }
    }
}

// Query methods
impl BloodRequest {
    pub fn hospital_id(&self) -> Option<&HospitalId> {
        self.hospital_id.as_ref()
    }

    pub fn blood_group(&self) -> BloodGroup {
        self.blood_group
    }

    pub fn component(&self) -> Component {
        self.component
    }

    pub fn units_requested(&self) -> u32 {
        self.units_requested
    }

    pub fn urgency(&self) -> Urgency {
        self.urgency
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn location(&self) -> GeoPoint {
        self.location
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    /// Stored status. Never `PartiallyFulfilled`.
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Status for presentation: `Processing` reads as `PartiallyFulfilled`
    /// once units have arrived and the deadline is within `closing_window`.
    pub fn status_at(&self, now: DateTime<Utc>, closing_window: Duration) -> RequestStatus {
        if self.status == RequestStatus::Processing
            && self.fulfilled_units > 0
            && self.deadline - now <= closing_window
        {
            RequestStatus::PartiallyFulfilled
        } else {
            self.status
        }
    }

    pub fn fulfilled_units(&self) -> u32 {
        self.fulfilled_units
    }

    pub fn commitments(&self) -> &[Commitment] {
        &self.commitments
    }

    pub fn commitment(&self, id: CommitmentId) -> Option<&Commitment> {
        self.commitments.iter().find(|c| c.id == id)
    }

    pub fn open_commitments(&self) -> impl Iterator<Item = &Commitment> {
        self.commitments.iter().filter(|c| c.is_open())
    }

    /// Fulfilled units plus everything still expected from open commitments.
    pub fn committed_units(&self) -> u32 {
        self.fulfilled_units + self.open_commitments().map(Commitment::outstanding).sum::<u32>()
    }

    /// Units nobody has promised yet.
    pub fn shortfall(&self) -> u32 {
        self.units_requested.saturating_sub(self.committed_units())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn commitment_mut(&mut self, id: CommitmentId) -> Option<&mut Commitment> {
        self.commitments.iter_mut().find(|c| c.id == id)
    }

    fn find_commitment(&self, id: CommitmentId) -> Result<&Commitment, RequestError> {
        self.commitment(id)
            .ok_or(RequestError::CommitmentNotFound { commitment_id: id })
    }

    fn ensure_created(&self) -> Result<(), RequestError> {
        if self.id.is_none() {
            return Err(RequestError::NotSubmitted);
        }
        Ok(())
    }
}

// Command methods (return events)
impl BloodRequest {
    pub fn submit(
        &self,
        request_id: AggregateId,
        spec: RequestSpec,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        if self.id.is_some() {
            return Err(RequestError::AlreadyCreated);
        }
        if spec.units == 0 {
            return Err(RequestError::InvalidQuantity { quantity: 0 });
        }
        if spec.deadline <= now {
            return Err(RequestError::DeadlineInPast {
                deadline: spec.deadline,
            });
        }

        Ok(vec![RequestEvent::RequestSubmitted(RequestSubmittedData {
            request_id,
            hospital_id: spec.hospital_id,
            blood_group: spec.blood_group,
            component: spec.component,
            units: spec.units,
            urgency: spec.urgency,
            deadline: spec.deadline,
            location: spec.location,
            submitted_at: now,
        })])
    }

    /// Opens a commitment for `units`, refusing anything that would promise
    /// more than was requested.
    pub fn open_commitment(
        &self,
        commitment_id: CommitmentId,
        kind: CommitmentKind,
        units: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        self.ensure_created()?;
        if !self.status.can_open_commitment() {
            return Err(RequestError::InvalidStateTransition {
                current_status: self.status,
                action: "open commitment",
            });
        }
        if units == 0 {
            return Err(RequestError::InvalidQuantity { quantity: 0 });
        }
        let committed = self.committed_units();
        if committed + units > self.units_requested {
            return Err(RequestError::OverCommitment {
                requested: self.units_requested,
                committed,
                additional: units,
            });
        }

        Ok(vec![RequestEvent::commitment_opened(
            commitment_id,
            kind,
            units,
            now,
        )])
    }

    /// Records a donor taking one slot of a donor pledge. Responses to a
    /// closed pledge are ignored.
    pub fn accept_donor(
        &self,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        let commitment = self.find_commitment(commitment_id)?;
        if !matches!(commitment.kind, CommitmentKind::DonorPledge { .. }) {
            return Err(RequestError::NotADonorPledge { commitment_id });
        }
        if !commitment.is_open() || commitment.accepted_donors.contains(&donor_id) {
            return Ok(vec![]);
        }
        if commitment.unaccepted_slots() == 0 {
            return Err(RequestError::PledgeFull { commitment_id });
        }

        Ok(vec![RequestEvent::donor_accepted(
            commitment_id,
            donor_id,
            now,
        )])
    }

    /// Frees the slot a donor held.
    pub fn release_donor(
        &self,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        let commitment = self.find_commitment(commitment_id)?;
        if !commitment.is_open() || !commitment.accepted_donors.contains(&donor_id) {
            return Ok(vec![]);
        }

        Ok(vec![RequestEvent::donor_released(
            commitment_id,
            donor_id,
            now,
        )])
    }

    /// Shrinks an open commitment's promise. Shrinking to exactly what was
    /// delivered closes it as delivered.
    pub fn reduce_commitment(
        &self,
        commitment_id: CommitmentId,
        to_units: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        let commitment = self.find_commitment(commitment_id)?;
        if !commitment.is_open() {
            return Err(RequestError::CommitmentNotOpen {
                commitment_id,
                state: commitment.state,
            });
        }
        if to_units == 0
            || to_units < commitment.units_delivered
            || to_units >= commitment.units_promised
        {
            return Err(RequestError::InvalidReduction {
                commitment_id,
                promised: commitment.units_promised,
                delivered: commitment.units_delivered,
                to_units,
            });
        }

        Ok(vec![RequestEvent::commitment_reduced(
            commitment_id,
            commitment.units_promised,
            to_units,
            now,
        )])
    }

    /// Applies a delivery from one commitment.
    ///
    /// Re-applying a `reference` is a no-op, as is a delivery against a
    /// commitment that was already cancelled or failed. Reaching the
    /// requested quantity fulfils the request.
    pub fn record_delivery(
        &self,
        commitment_id: CommitmentId,
        units: u32,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        let commitment = self.find_commitment(commitment_id)?;
        if commitment.has_reference(reference) || !commitment.is_open() {
            return Ok(vec![]);
        }
        if self.is_terminal() {
            return Err(RequestError::CommitmentOnClosedRequest {
                commitment_id,
                status: self.status,
            });
        }
        if units == 0 {
            return Err(RequestError::InvalidQuantity { quantity: 0 });
        }
        if commitment.units_delivered + units > commitment.units_promised {
            return Err(RequestError::DeliveryExceedsCommitment {
                commitment_id,
                promised: commitment.units_promised,
                delivered: commitment.units_delivered,
                units,
            });
        }

        let mut events = vec![RequestEvent::delivery_recorded(
            commitment_id,
            units,
            reference,
            now,
        )];

        let fulfilled = self.fulfilled_units + units;
        if fulfilled == self.units_requested {
            for other in self.open_commitments().filter(|c| c.id != commitment_id) {
                events.push(close_event(
                    other,
                    Closure::Cancel(CancelReason::RequestFulfilled),
                    now,
                ));
            }
            events.push(RequestEvent::RequestFulfilled(RequestClosedData {
                fulfilled_units: fulfilled,
                at: now,
            }));
        }

        Ok(events)
    }

    /// Withdraws an open commitment. Already closed commitments are left as
    /// they are, so a delivery that won the race keeps counting.
    pub fn cancel_commitment(
        &self,
        commitment_id: CommitmentId,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        let commitment = self.find_commitment(commitment_id)?;
        if !commitment.is_open() {
            return Ok(vec![]);
        }
        Ok(vec![close_event(commitment, Closure::Cancel(reason), now)])
    }

    /// Marks an open commitment as failed. A partially delivered commitment
    /// is instead shrunk to what it delivered.
    pub fn fail_commitment(
        &self,
        commitment_id: CommitmentId,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        let commitment = self.find_commitment(commitment_id)?;
        if !commitment.is_open() {
            return Ok(vec![]);
        }
        Ok(vec![close_event(commitment, Closure::Fail(reason), now)])
    }

    /// Cancels the request and every open commitment.
    pub fn cancel(
        &self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, RequestError> {
        self.ensure_created()?;
        if !self.status.can_cancel() {
            return Err(RequestError::InvalidStateTransition {
                current_status: self.status,
                action: "cancel",
            });
        }

        let reason = reason.into();
        let mut events: Vec<_> = self
            .open_commitments()
            .map(|c| {
                close_event(
                    c,
                    Closure::Cancel(CancelReason::RequestCancelled(reason.clone())),
                    now,
                )
            })
            .collect();
        events.push(RequestEvent::RequestCancelled(RequestCancelledData {
            reason,
            fulfilled_units: self.fulfilled_units,
            cancelled_at: now,
        }));
        Ok(events)
    }

    /// Expires a request whose deadline has passed, cancelling whatever is
    /// still open.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<Vec<RequestEvent>, RequestError> {
        self.ensure_created()?;
        if !self.status.can_expire() {
            return Err(RequestError::InvalidStateTransition {
                current_status: self.status,
                action: "expire",
            });
        }
        if now < self.deadline {
            return Err(RequestError::DeadlineNotReached {
                deadline: self.deadline,
            });
        }

        let mut events: Vec<_> = self
            .open_commitments()
            .map(|c| close_event(c, Closure::Cancel(CancelReason::DeadlineExceeded), now))
            .collect();
        events.push(RequestEvent::RequestExpired(RequestClosedData {
            fulfilled_units: self.fulfilled_units,
            at: now,
        }));
        Ok(events)
    }

    fn apply_submitted(&mut self, data: RequestSubmittedData) {
        self.id = Some(data.request_id);
        self.hospital_id = Some(data.hospital_id);
        self.blood_group = data.blood_group;
        self.component = data.component;
        self.units_requested = data.units;
        self.urgency = data.urgency;
        self.deadline = data.deadline;
        self.location = data.location;
        self.submitted_at = data.submitted_at;
        self.status = RequestStatus::Pending;
    }
}

enum Closure {
    Cancel(CancelReason),
    Fail(FailureReason),
}

/// Closes an open commitment. Units it already delivered stay counted: a
/// partially delivered commitment is shrunk to its deliveries instead.
fn close_event(commitment: &Commitment, closure: Closure, now: DateTime<Utc>) -> RequestEvent {
    if commitment.units_delivered > 0 {
        return RequestEvent::commitment_reduced(
            commitment.id,
            commitment.units_promised,
            commitment.units_delivered,
            now,
        );
    }
    match closure {
        Closure::Cancel(reason) => RequestEvent::commitment_cancelled(commitment.id, reason, now),
        Closure::Fail(reason) => RequestEvent::commitment_failed(commitment.id, reason, now),
    }
}
