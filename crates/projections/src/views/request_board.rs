//! Request board: one row per blood request for dashboards.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CommitmentId, HospitalId};
use domain::{BloodGroup, Component, DomainEvent, RequestEvent, RequestId, RequestStatus, Urgency};
use event_store::EventEnvelope;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{Projection, ProjectionPosition};
use crate::read_model::ReadModel;

/// Dashboard row for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestBoardRow {
    pub request_id: RequestId,
    pub hospital_id: HospitalId,
    pub blood_group: BloodGroup,
    pub component: Component,
    pub urgency: Urgency,
    pub status: RequestStatus,
    pub units_requested: u32,
    pub fulfilled_units: u32,
    pub open_commitments: usize,
    pub deadline: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct OpenCommitment {
    promised: u32,
    delivered: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    row: RequestBoardRow,
    open: HashMap<CommitmentId, OpenCommitment>,
}

impl Entry {
    fn close(&mut self, commitment_id: CommitmentId) {
        self.open.remove(&commitment_id);
        self.row.open_commitments = self.open.len();
    }

    fn settle_if_complete(&mut self, commitment_id: CommitmentId) {
        let complete = self
            .open
            .get(&commitment_id)
            .is_some_and(|c| c.delivered >= c.promised);
        if complete {
            self.close(commitment_id);
        }
    }
}

/// Every request ever submitted, terminal ones included.
#[derive(Clone)]
pub struct RequestBoardView {
    entries: Arc<RwLock<HashMap<RequestId, Entry>>>,
    position: Arc<RwLock<ProjectionPosition>>,
}

impl RequestBoardView {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            position: Arc::new(RwLock::new(ProjectionPosition::zero())),
        }
    }

    pub async fn get(&self, request_id: RequestId) -> Option<RequestBoardRow> {
        self.entries
            .read()
            .await
            .get(&request_id)
            .map(|e| e.row.clone())
    }

    /// All rows, most urgent first, then by nearest deadline.
    pub async fn all(&self) -> Vec<RequestBoardRow> {
        let mut rows: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.row.clone())
            .collect();
        rows.sort_by_key(|r| (Reverse(r.urgency), r.deadline, r.submitted_at));
        rows
    }

    /// Rows still being worked on.
    pub async fn open(&self) -> Vec<RequestBoardRow> {
        let mut rows = self.all().await;
        rows.retain(|r| !r.status.is_terminal());
        rows
    }

    pub async fn by_status(&self, status: RequestStatus) -> Vec<RequestBoardRow> {
        let mut rows = self.all().await;
        rows.retain(|r| r.status == status);
        rows
    }
}

impl Default for RequestBoardView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for RequestBoardView {
    fn name(&self) -> &'static str {
        "RequestBoardView"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        if event.aggregate_type == "BloodRequest" {
            let request_event: RequestEvent = event.decode()?;
            let request_id = event.aggregate_id;
            let mut entries = self.entries.write().await;

            match request_event {
                RequestEvent::RequestSubmitted(data) => {
                    entries.insert(
                        request_id,
                        Entry {
                            row: RequestBoardRow {
                                request_id,
                                hospital_id: data.hospital_id,
                                blood_group: data.blood_group,
                                component: data.component,
                                urgency: data.urgency,
                                status: RequestStatus::Pending,
                                units_requested: data.units,
                                fulfilled_units: 0,
                                open_commitments: 0,
                                deadline: data.deadline,
                                submitted_at: data.submitted_at,
                                updated_at: data.submitted_at,
                            },
                            open: HashMap::new(),
                        },
                    );
                }
                other => {
                    if let Some(entry) = entries.get_mut(&request_id) {
                        apply(entry, other);
                    }
                }
            }
        }

        let mut pos = self.position.write().await;
        *pos = pos.advance(event.sequence);
        Ok(())
    }

    async fn position(&self) -> ProjectionPosition {
        *self.position.read().await
    }

    async fn reset(&self) -> Result<()> {
        self.entries.write().await.clear();
        *self.position.write().await = ProjectionPosition::zero();
        Ok(())
    }
}

fn apply(entry: &mut Entry, event: RequestEvent) {
    entry.row.updated_at = event.occurred_at();
    match event {
        RequestEvent::RequestSubmitted(_) => {}
        RequestEvent::CommitmentOpened(data) => {
            entry.open.insert(
                data.commitment_id,
                OpenCommitment {
                    promised: data.units,
                    delivered: 0,
                },
            );
            entry.row.open_commitments = entry.open.len();
            entry.row.status = RequestStatus::Processing;
        }
        RequestEvent::DonorAccepted(_) | RequestEvent::DonorReleased(_) => {}
        RequestEvent::CommitmentReduced(data) => {
            if let Some(c) = entry.open.get_mut(&data.commitment_id) {
                c.promised = data.to_units;
            }
            entry.settle_if_complete(data.commitment_id);
        }
        RequestEvent::DeliveryRecorded(data) => {
            if let Some(c) = entry.open.get_mut(&data.commitment_id) {
                c.delivered += data.units;
            }
            entry.row.fulfilled_units += data.units;
            entry.settle_if_complete(data.commitment_id);
        }
        RequestEvent::CommitmentCancelled(data) => entry.close(data.commitment_id),
        RequestEvent::CommitmentFailed(data) => entry.close(data.commitment_id),
        RequestEvent::RequestFulfilled(data) => {
            entry.row.status = RequestStatus::Fulfilled;
            entry.row.fulfilled_units = data.fulfilled_units;
        }
        RequestEvent::RequestExpired(data) => {
            entry.row.status = RequestStatus::Expired;
            entry.row.fulfilled_units = data.fulfilled_units;
        }
        RequestEvent::RequestCancelled(data) => {
            entry.row.status = RequestStatus::Cancelled;
            entry.row.fulfilled_units = data.fulfilled_units;
        }
    }
}

impl ReadModel for RequestBoardView {
    fn name(&self) -> &'static str {
        "RequestBoardView"
    }

    fn count(&self) -> usize {
        self.entries.try_read().map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::{CancelReason, CommitmentKind, GeoPoint};
    use event_store::Version;

    struct Stream {
        id: RequestId,
        version: i64,
        sequence: u64,
    }

    impl Stream {
        fn new() -> Self {
            Self {
                id: RequestId::new(),
                version: 0,
                sequence: 0,
            }
        }

        fn envelope(&mut self, event: &RequestEvent) -> EventEnvelope {
            self.version += 1;
            self.sequence += 1;
            let mut envelope = EventEnvelope::builder()
                .aggregate_id(self.id)
                .aggregate_type("BloodRequest")
                .event_type(event.event_type())
                .version(Version::new(self.version))
                .payload(event)
                .unwrap()
                .build()
                .unwrap();
            envelope.sequence = self.sequence;
            envelope
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn submitted(id: RequestId, urgency: Urgency, hours: i64) -> RequestEvent {
        RequestEvent::RequestSubmitted(domain::request::RequestSubmittedData {
            request_id: id,
            hospital_id: HospitalId::new("H-1"),
            blood_group: BloodGroup::default(),
            component: Component::default(),
            units: 4,
            urgency,
            deadline: now() + Duration::hours(hours),
            location: GeoPoint::new(51.5, -0.1),
            submitted_at: now(),
        })
    }

    fn donor_pledge(units: u32) -> CommitmentKind {
        CommitmentKind::DonorPledge {
            donors: vec![common::DonorId::new("D-1"); units as usize],
            respond_by: now() + Duration::hours(4),
        }
    }

    #[tokio::test]
    async fn tracks_commitments_and_fulfilled_units() {
        let view = RequestBoardView::new();
        let mut stream = Stream::new();
        let first = CommitmentId::new();
        let second = CommitmentId::new();

        for event in [
            submitted(stream.id, Urgency::High, 6),
            RequestEvent::commitment_opened(first, donor_pledge(2), 2, now()),
            RequestEvent::commitment_opened(second, donor_pledge(2), 2, now()),
            RequestEvent::delivery_recorded(first, 2, "donation-1", now()),
            RequestEvent::commitment_cancelled(second, CancelReason::DeadlineExceeded, now()),
        ] {
            view.handle(&stream.envelope(&event)).await.unwrap();
        }

        let row = view.get(stream.id).await.unwrap();
        assert_eq!(row.status, RequestStatus::Processing);
        assert_eq!(row.fulfilled_units, 2);
        assert_eq!(row.open_commitments, 0);
        assert_eq!(view.position().await.sequence, 5);
    }

    #[tokio::test]
    async fn reduction_to_delivered_closes_commitment() {
        let view = RequestBoardView::new();
        let mut stream = Stream::new();
        let commitment = CommitmentId::new();

        for event in [
            submitted(stream.id, Urgency::Medium, 6),
            RequestEvent::commitment_opened(commitment, donor_pledge(3), 3, now()),
            RequestEvent::delivery_recorded(commitment, 1, "donation-1", now()),
        ] {
            view.handle(&stream.envelope(&event)).await.unwrap();
        }
        assert_eq!(view.get(stream.id).await.unwrap().open_commitments, 1);

        let reduced = RequestEvent::commitment_reduced(commitment, 3, 1, now());
        view.handle(&stream.envelope(&reduced)).await.unwrap();
        assert_eq!(view.get(stream.id).await.unwrap().open_commitments, 0);
    }

    #[tokio::test]
    async fn orders_most_urgent_first() {
        let view = RequestBoardView::new();
        let mut low = Stream::new();
        let mut critical = Stream::new();
        let mut high_soon = Stream::new();
        let mut high_later = Stream::new();

        let envelopes = [
            low.envelope(&submitted(low.id, Urgency::Low, 1)),
            high_later.envelope(&submitted(high_later.id, Urgency::High, 12)),
            critical.envelope(&submitted(critical.id, Urgency::Critical, 24)),
            high_soon.envelope(&submitted(high_soon.id, Urgency::High, 2)),
        ];
        for envelope in &envelopes {
            view.handle(envelope).await.unwrap();
        }

        let order: Vec<_> = view.all().await.into_iter().map(|r| r.request_id).collect();
        assert_eq!(order, vec![critical.id, high_soon.id, high_later.id, low.id]);
        assert_eq!(view.count(), 4);
    }

    #[tokio::test]
    async fn terminal_rows_leave_open_listing() {
        let view = RequestBoardView::new();
        let mut stream = Stream::new();
        let submit = submitted(stream.id, Urgency::Low, 3);
        let expired = RequestEvent::RequestExpired(domain::request::RequestClosedData {
            fulfilled_units: 0,
            at: now() + Duration::hours(3),
        });
        view.handle(&stream.envelope(&submit)).await.unwrap();
        view.handle(&stream.envelope(&expired)).await.unwrap();

        assert!(view.open().await.is_empty());
        assert_eq!(view.by_status(RequestStatus::Expired).await.len(), 1);
    }

    #[tokio::test]
    async fn other_aggregates_only_advance_position() {
        let view = RequestBoardView::new();
        let mut envelope = EventEnvelope::builder()
            .aggregate_id(RequestId::new())
            .aggregate_type("TransportJob")
            .event_type("JobScheduled")
            .version(Version::new(1))
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap();
        envelope.sequence = 7;

        view.handle(&envelope).await.unwrap();
        assert_eq!(view.count(), 0);
        assert_eq!(view.position().await.sequence, 7);
    }
}
