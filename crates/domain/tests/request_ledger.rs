//! Integration tests for the request ledger over the in-memory journal.

use chrono::{Duration, Utc};
use common::{BloodBankId, DonorId, HospitalId, JobId, UnitId};
use domain::request::{CancelRequest, OpenCommitment, RecordDelivery, SubmitRequest};
use domain::{
    Aggregate, BloodGroup, CancelReason, CommitmentKind, CommitmentState, Component, DomainError,
    FailureReason, GeoPoint, RequestError, RequestEvent, RequestId, RequestLedger, RequestSpec,
    RequestStatus, Urgency,
};
use event_store::{EventQuery, EventStore, InMemoryEventStore, Version};

fn ledger() -> RequestLedger<InMemoryEventStore> {
    RequestLedger::new(InMemoryEventStore::new())
}

fn spec(units: u32) -> RequestSpec {
    RequestSpec {
        hospital_id: HospitalId::new("H-CENTRAL"),
        blood_group: BloodGroup::ONegative,
        component: Component::RedCells,
        units,
        urgency: Urgency::High,
        deadline: Utc::now() + Duration::hours(6),
        location: GeoPoint::new(40.4168, -3.7038),
    }
}

fn bank_kind(units: usize) -> CommitmentKind {
    CommitmentKind::BankReservation {
        bank_id: BloodBankId::new("BB-1"),
        unit_ids: (0..units).map(|_| UnitId::new()).collect(),
        job_id: JobId::new(),
        earliest_expiry: Utc::now() + Duration::days(10),
    }
}

fn donor_kind(donors: &[&str]) -> CommitmentKind {
    CommitmentKind::DonorPledge {
        donors: donors.iter().map(|d| DonorId::new(*d)).collect(),
        respond_by: Utc::now() + Duration::hours(1),
    }
}

async fn submitted(ledger: &RequestLedger<InMemoryEventStore>, units: u32) -> RequestId {
    let cmd = SubmitRequest::new(spec(units), Utc::now());
    let request_id = cmd.request_id;
    ledger.submit(cmd).await.unwrap();
    request_id
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn bank_then_donor_fulfils_request() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 3).await;
        let now = Utc::now();

        let bank = OpenCommitment::new(request_id, bank_kind(2), 2, now);
        let bank_id = bank.commitment_id;
        ledger.open_commitment(bank).await.unwrap();

        let donor = OpenCommitment::new(request_id, donor_kind(&["D-1", "D-2"]), 1, now);
        let donor_id = donor.commitment_id;
        ledger.open_commitment(donor).await.unwrap();

        let result = ledger
            .record_delivery(RecordDelivery::new(request_id, bank_id, 2, "job-1", now))
            .await
            .unwrap();
        assert_eq!(result.aggregate.status(), RequestStatus::Processing);
        assert_eq!(result.aggregate.fulfilled_units(), 2);

        let result = ledger
            .record_delivery(RecordDelivery::new(request_id, donor_id, 1, "donation-1", now))
            .await
            .unwrap();
        assert_eq!(result.aggregate.status(), RequestStatus::Fulfilled);
        assert_eq!(result.aggregate.fulfilled_units(), 3);
        assert_eq!(result.new_version, Version::new(6));
    }

    #[tokio::test]
    async fn fulfilment_cancels_remaining_commitments() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 2).await;
        let now = Utc::now();

        let bank = OpenCommitment::new(request_id, bank_kind(1), 1, now);
        let bank_id = bank.commitment_id;
        ledger.open_commitment(bank).await.unwrap();
        let donor = OpenCommitment::new(request_id, donor_kind(&["D-1"]), 1, now);
        let donor_id = donor.commitment_id;
        ledger.open_commitment(donor).await.unwrap();

        // Fresh bank stock displaces the donor pledge.
        ledger
            .cancel_commitment(request_id, donor_id, CancelReason::SupersededByBankStock, now)
            .await
            .unwrap();
        let second = OpenCommitment::new(request_id, bank_kind(1), 1, now);
        let second_id = second.commitment_id;
        ledger.open_commitment(second).await.unwrap();

        ledger
            .record_delivery(RecordDelivery::new(request_id, bank_id, 1, "job-a", now))
            .await
            .unwrap();
        let result = ledger
            .record_delivery(RecordDelivery::new(request_id, second_id, 1, "job-b", now))
            .await
            .unwrap();

        let request = result.aggregate;
        assert_eq!(request.status(), RequestStatus::Fulfilled);
        assert_eq!(
            request.commitment(donor_id).unwrap().state,
            CommitmentState::Cancelled
        );
        assert_eq!(request.open_commitments().count(), 0);
    }

    #[tokio::test]
    async fn cancel_closes_open_commitments() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 2).await;
        let now = Utc::now();

        let bank = OpenCommitment::new(request_id, bank_kind(2), 2, now);
        let commitment_id = bank.commitment_id;
        ledger.open_commitment(bank).await.unwrap();

        let result = ledger
            .cancel(CancelRequest::new(request_id, "patient transferred", now))
            .await
            .unwrap();

        let request = result.aggregate;
        assert_eq!(request.status(), RequestStatus::Cancelled);
        let commitment = request.commitment(commitment_id).unwrap();
        assert_eq!(commitment.state, CommitmentState::Cancelled);
        assert!(matches!(
            commitment.cancel_reason,
            Some(CancelReason::RequestCancelled(_))
        ));
    }

    #[tokio::test]
    async fn failed_commitment_frees_capacity() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 2).await;
        let now = Utc::now();

        let bank = OpenCommitment::new(request_id, bank_kind(2), 2, now);
        let commitment_id = bank.commitment_id;
        ledger.open_commitment(bank).await.unwrap();
        ledger
            .fail_commitment(request_id, commitment_id, FailureReason::ColdChainBreach, now)
            .await
            .unwrap();

        let result = ledger
            .open_commitment(OpenCommitment::new(request_id, bank_kind(2), 2, now))
            .await
            .unwrap();
        assert_eq!(result.aggregate.committed_units(), 2);
        assert_eq!(result.aggregate.shortfall(), 0);
    }
}

mod guards {
    use super::*;

    #[tokio::test]
    async fn over_commitment_is_rejected() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 2).await;
        let now = Utc::now();

        ledger
            .open_commitment(OpenCommitment::new(request_id, bank_kind(2), 2, now))
            .await
            .unwrap();
        let result = ledger
            .open_commitment(OpenCommitment::new(request_id, donor_kind(&["D-1"]), 1, now))
            .await;

        assert!(matches!(
            result,
            Err(DomainError::Request(RequestError::OverCommitment {
                requested: 2,
                committed: 2,
                additional: 1
            }))
        ));
    }

    #[tokio::test]
    async fn deadline_in_past_is_rejected() {
        let ledger = ledger();
        let mut request = spec(1);
        request.deadline = Utc::now() - Duration::minutes(1);

        let result = ledger.submit(SubmitRequest::new(request, Utc::now())).await;
        assert!(matches!(
            result,
            Err(DomainError::Request(RequestError::DeadlineInPast { .. }))
        ));
    }

    #[tokio::test]
    async fn duplicate_delivery_reference_is_idempotent() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 3).await;
        let now = Utc::now();

        let bank = OpenCommitment::new(request_id, bank_kind(3), 3, now);
        let commitment_id = bank.commitment_id;
        ledger.open_commitment(bank).await.unwrap();

        ledger
            .record_delivery(RecordDelivery::new(request_id, commitment_id, 1, "ref-1", now))
            .await
            .unwrap();
        let replay = ledger
            .record_delivery(RecordDelivery::new(request_id, commitment_id, 1, "ref-1", now))
            .await
            .unwrap();

        assert!(replay.is_noop());
        assert_eq!(replay.aggregate.fulfilled_units(), 1);
    }

    #[tokio::test]
    async fn late_delivery_on_cancelled_commitment_is_ignored() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 1).await;
        let now = Utc::now();

        let donor = OpenCommitment::new(request_id, donor_kind(&["D-1"]), 1, now);
        let commitment_id = donor.commitment_id;
        ledger.open_commitment(donor).await.unwrap();
        ledger
            .cancel_commitment(request_id, commitment_id, CancelReason::DeadlineExceeded, now)
            .await
            .unwrap();

        let late = ledger
            .record_delivery(RecordDelivery::new(request_id, commitment_id, 1, "late", now))
            .await
            .unwrap();
        assert!(late.is_noop());
        assert_eq!(late.aggregate.fulfilled_units(), 0);
    }

    #[tokio::test]
    async fn donor_acceptance_is_bounded_by_pledge() {
        let ledger = ledger();
        let request_id = submitted(&ledger, 1).await;
        let now = Utc::now();

        let donor = OpenCommitment::new(request_id, donor_kind(&["D-1", "D-2"]), 1, now);
        let commitment_id = donor.commitment_id;
        ledger.open_commitment(donor).await.unwrap();

        ledger
            .accept_donor(request_id, commitment_id, DonorId::new("D-1"), now)
            .await
            .unwrap();
        let second = ledger
            .accept_donor(request_id, commitment_id, DonorId::new("D-2"), now)
            .await;

        assert!(matches!(
            second,
            Err(DomainError::Request(RequestError::PledgeFull { .. }))
        ));
    }
}

mod queries {
    use super::*;

    #[tokio::test]
    async fn sweep_expires_overdue_requests_only() {
        let ledger = ledger();
        let overdue = submitted(&ledger, 1).await;
        let _current = submitted(&ledger, 1).await;

        // Nothing is overdue yet.
        assert!(ledger.sweep_expired(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + Duration::hours(7);
        let expired = ledger.sweep_expired(later).await.unwrap();
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&overdue));

        let request = ledger.get(overdue).await.unwrap().unwrap();
        assert_eq!(request.status(), RequestStatus::Expired);
        assert!(request.closed_at().is_some());
    }

    #[tokio::test]
    async fn all_lists_requests_in_submission_order() {
        let ledger = ledger();
        let first = submitted(&ledger, 1).await;
        let second = submitted(&ledger, 2).await;

        let ids: Vec<_> = ledger
            .all()
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.id())
            .collect();
        assert_eq!(ids, vec![first, second]);
        assert!(ledger.get(RequestId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn journal_records_every_transition() {
        let store = InMemoryEventStore::new();
        let ledger = RequestLedger::new(store.clone());
        let cmd = SubmitRequest::new(spec(1), Utc::now());
        let request_id = cmd.request_id;
        ledger.submit(cmd).await.unwrap();
        ledger
            .cancel(CancelRequest::new(request_id, "duplicate", Utc::now()))
            .await
            .unwrap();

        let events = store
            .query_events(EventQuery::for_aggregate(request_id))
            .await
            .unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["RequestSubmitted", "RequestCancelled"]);

        let decoded: RequestEvent = events[1].decode().unwrap();
        assert!(matches!(decoded, RequestEvent::RequestCancelled(_)));
    }
}
