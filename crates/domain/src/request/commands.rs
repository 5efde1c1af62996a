//! Request commands.

use chrono::{DateTime, Utc};
use common::{AggregateId, CommitmentId, HospitalId};
use serde::{Deserialize, Serialize};

use crate::blood::{BloodGroup, Component, Urgency};
use crate::command::Command;
use crate::geo::GeoPoint;

use super::{BloodRequest, CommitmentKind};

/// What a hospital asks for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSpec {
    pub hospital_id: HospitalId,
    pub blood_group: BloodGroup,
    pub component: Component,
    pub units: u32,
    pub urgency: Urgency,
    pub deadline: DateTime<Utc>,
    pub location: GeoPoint,
}

/// Command to submit a new request.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub request_id: AggregateId,
    pub spec: RequestSpec,
    pub now: DateTime<Utc>,
}

impl SubmitRequest {
    /// Creates the command with a generated request id.
    pub fn new(spec: RequestSpec, now: DateTime<Utc>) -> Self {
        Self {
            request_id: AggregateId::new(),
            spec,
            now,
        }
    }
}

impl Command for SubmitRequest {
    type Aggregate = BloodRequest;

    fn aggregate_id(&self) -> AggregateId {
        self.request_id
    }
}

/// Command to open a commitment on a request.
#[derive(Debug, Clone)]
pub struct OpenCommitment {
    pub request_id: AggregateId,
    pub commitment_id: CommitmentId,
    pub kind: CommitmentKind,
    pub units: u32,
    pub now: DateTime<Utc>,
}

impl OpenCommitment {
    /// Creates the command with a generated commitment id.
    pub fn new(
        request_id: AggregateId,
        kind: CommitmentKind,
        units: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            commitment_id: CommitmentId::new(),
            kind,
            units,
            now,
        }
    }
}

impl Command for OpenCommitment {
    type Aggregate = BloodRequest;

    fn aggregate_id(&self) -> AggregateId {
        self.request_id
    }
}

/// Command to record units delivered by a commitment.
#[derive(Debug, Clone)]
pub struct RecordDelivery {
    pub request_id: AggregateId,
    pub commitment_id: CommitmentId,
    pub units: u32,
    pub reference: String,
    pub now: DateTime<Utc>,
}

impl RecordDelivery {
    pub fn new(
        request_id: AggregateId,
        commitment_id: CommitmentId,
        units: u32,
        reference: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            commitment_id,
            units,
            reference: reference.into(),
            now,
        }
    }
}

impl Command for RecordDelivery {
    type Aggregate = BloodRequest;

    fn aggregate_id(&self) -> AggregateId {
        self.request_id
    }
}

/// Command to cancel a request.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub request_id: AggregateId,
    pub reason: String,
    pub now: DateTime<Utc>,
}

impl CancelRequest {
    pub fn new(request_id: AggregateId, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            request_id,
            reason: reason.into(),
            now,
        }
    }
}

impl Command for CancelRequest {
    type Aggregate = BloodRequest;

    fn aggregate_id(&self) -> AggregateId {
        self.request_id
    }
}
