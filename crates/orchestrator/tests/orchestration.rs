//! End-to-end orchestration scenarios over in-memory collaborators and a
//! manual clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{BloodBankId, DonorId, HospitalId, InstitutionId, JobId, UnitId};
use domain::{
    BloodGroup, Channel, CommitmentState, Component, GeoPoint, Pathogen, RequestId, RequestSpec,
    RequestStatus, TestOutcome, TestResult, TransportStatus, UnitStatus, Urgency,
};
use event_store::InMemoryEventStore;
use orchestrator::{
    EventOutcome, Facility, FacilityDirectory, FacilityKind, FulfillmentEvent,
    FulfillmentOrchestrator, InMemoryFacilityDirectory, InMemoryNotifier, ManualClock,
    NotificationKind, OrchestratorConfig, OrchestratorError, RankedFacility, Recipient,
    RequestStatusView,
};
use tokio::sync::mpsc;

type Orchestrator =
    FulfillmentOrchestrator<InMemoryEventStore, InMemoryFacilityDirectory, InMemoryNotifier>;

const HOSPITAL: (f64, f64) = (40.4168, -3.7038);

struct Harness {
    orchestrator: Arc<Orchestrator>,
    directory: InMemoryFacilityDirectory,
    notifier: InMemoryNotifier,
    clock: ManualClock,
}

impl Harness {
    fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let directory = InMemoryFacilityDirectory::new();
        let notifier = InMemoryNotifier::new();
        let orchestrator = FulfillmentOrchestrator::new(
            InMemoryEventStore::new(),
            directory.clone(),
            notifier.clone(),
            OrchestratorConfig::default(),
        )
        .with_clock(Arc::new(clock.clone()));
        Self {
            orchestrator: Arc::new(orchestrator),
            directory,
            notifier,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.orchestrator.now()
    }

    fn register(&self, id: &str, kind: FacilityKind, lat: f64, lon: f64) {
        self.directory.register(Facility {
            id: id.to_string(),
            kind,
            name: id.to_string(),
            location: GeoPoint::new(lat, lon),
            blood_group: (kind == FacilityKind::Donor).then_some(BloodGroup::ONegative),
        });
    }

    fn bank(&self, id: &str, lat: f64, lon: f64) {
        self.register(id, FacilityKind::BloodBank, lat, lon);
    }

    fn donors(&self, ids: &[&str]) {
        for id in ids {
            self.register(id, FacilityKind::Donor, 40.42, -3.71);
        }
    }

    fn stock(&self, bank: &str, units: u32, shelf: Duration) -> Vec<UnitId> {
        self.orchestrator
            .inventory()
            .stock(
                &BloodBankId::new(bank),
                BloodGroup::ONegative,
                Component::RedCells,
                units,
                self.now() + shelf,
                self.now(),
            )
            .unwrap()
    }

    async fn submit(&self, units: u32, urgency: Urgency, deadline_in: Duration) -> RequestId {
        self.orchestrator
            .submit(RequestSpec {
                hospital_id: HospitalId::new("H-CENTRAL"),
                blood_group: BloodGroup::ONegative,
                component: Component::RedCells,
                units,
                urgency,
                deadline: self.now() + deadline_in,
                location: GeoPoint::new(HOSPITAL.0, HOSPITAL.1),
            })
            .await
            .unwrap()
    }

    async fn jobs(&self, request_id: RequestId) -> Vec<JobId> {
        self.orchestrator
            .status(request_id)
            .await
            .unwrap()
            .transport_jobs
            .iter()
            .filter_map(|j| j.job_id)
            .collect()
    }

    async fn progress(&self, job_id: JobId, status: TransportStatus) -> EventOutcome {
        self.orchestrator
            .handle(FulfillmentEvent::TransportProgress {
                job_id,
                status,
                reason: None,
            })
            .await
            .unwrap()
    }

    async fn drive(&self, job_id: JobId, until: TransportStatus) {
        for status in [
            TransportStatus::Dispatched,
            TransportStatus::EnRoute,
            TransportStatus::Arrived,
            TransportStatus::Delivered,
        ] {
            self.progress(job_id, status).await;
            if status == until {
                break;
            }
        }
    }

    async fn tick(&self, by: Duration) -> orchestrator::TickReport {
        let now = self.clock.advance(by);
        self.orchestrator.tick(now).await
    }

    async fn accept(&self, request_id: RequestId, donor: &str) {
        let pledge = self.orchestrator.status(request_id).await.unwrap().commitments[0].commitment_id;
        self.orchestrator
            .handle(FulfillmentEvent::DonorAccepted {
                request_id,
                commitment_id: pledge,
                donor_id: DonorId::new(donor),
            })
            .await
            .unwrap();
    }
}

/// Fulfilled units plus everything still promised by open commitments.
fn committed(view: &RequestStatusView) -> u32 {
    view.fulfilled_units
        + view
            .commitments
            .iter()
            .filter(|c| c.state == CommitmentState::Open)
            .map(|c| c.units_promised - c.units_delivered)
            .sum::<u32>()
}

mod ladder {
    use super::*;

    #[tokio::test]
    async fn bank_stock_supersedes_unaccepted_donor_slots() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.bank("BB-FAR", 40.45, -3.68);
        h.donors(&["D1", "D2", "D3"]);
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);
        h.stock("BB-NEAR", 2, Duration::days(20));

        let request_id = h.submit(4, Urgency::Critical, Duration::hours(6)).await;

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Processing);
        assert_eq!(view.commitments.len(), 2);
        assert_eq!(view.commitments[0].channel, Channel::Bank);
        assert_eq!(view.commitments[1].channel, Channel::Donor);
        assert_eq!(view.commitments[1].units_promised, 2);
        assert_eq!(view.shortfall, 0);
        assert_eq!(h.notifier.count_of(NotificationKind::DonorMobilized), 3);
        assert_eq!(h.notifier.count_of(NotificationKind::InstitutionEscalated), 0);

        let outcome = h
            .orchestrator
            .handle(FulfillmentEvent::StockAdded {
                bank_id: BloodBankId::new("BB-FAR"),
                blood_group: BloodGroup::ONegative,
                component: Component::RedCells,
                units: 2,
                expires_at: h.now() + Duration::days(20),
            })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            EventOutcome::StockAdmitted { ref unit_ids } if unit_ids.len() == 2
        ));

        let view = h.orchestrator.status(request_id).await.unwrap();
        let donor = &view.commitments[1];
        assert_eq!(donor.state, CommitmentState::Cancelled);
        assert_eq!(donor.closed_because, Some("superseded_by_bank_stock"));
        assert_eq!(view.commitments.len(), 3);
        assert_eq!(view.commitments[2].source, "BB-FAR");
        assert_eq!(
            h.notifier.count_of(NotificationKind::DonationNoLongerNeeded),
            3
        );

        for job_id in h.jobs(request_id).await {
            h.drive(job_id, TransportStatus::Delivered).await;
        }

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Fulfilled);
        assert_eq!(view.fulfilled_units, 4);
        assert_eq!(
            h.notifier
                .sent_to(&Recipient::Hospital(HospitalId::new("H-CENTRAL")))
                .iter()
                .filter(|n| n.kind == NotificationKind::RequestFulfilled)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn unserved_request_expires_at_deadline() {
        let h = Harness::new();
        let request_id = h.submit(1, Urgency::Medium, Duration::hours(2)).await;

        let report = h.tick(Duration::hours(1)).await;
        assert_eq!(report.timers_fired, 1);
        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Pending);

        let report = h.tick(Duration::hours(1)).await;
        assert_eq!(report.timers_fired, 1);

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Expired);
        assert_eq!(view.fulfilled_units, 0);
        assert_eq!(h.notifier.count_of(NotificationKind::RequestExpired), 1);
        assert!(h.orchestrator.next_timer().is_none());
    }

    #[tokio::test]
    async fn critical_request_escalates_to_institutions_at_once() {
        let h = Harness::new();
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);

        let request_id = h.submit(3, Urgency::Critical, Duration::hours(4)).await;

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments.len(), 1);
        assert_eq!(view.commitments[0].channel, Channel::Institution);
        assert_eq!(view.commitments[0].units_promised, 3);
        assert_eq!(
            h.notifier
                .sent_to(&Recipient::Institution(InstitutionId::new("UNI-1")))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn unanswered_donor_slots_are_reclaimed_at_escalation() {
        let h = Harness::new();
        h.donors(&["D1", "D2"]);
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);

        let request_id = h.submit(2, Urgency::Medium, Duration::hours(6)).await;
        let pledge = h.orchestrator.status(request_id).await.unwrap().commitments[0].commitment_id;

        h.orchestrator
            .handle(FulfillmentEvent::DonorAccepted {
                request_id,
                commitment_id: pledge,
                donor_id: DonorId::new("D1"),
            })
            .await
            .unwrap();

        let report = h.tick(Duration::hours(3) + Duration::minutes(1)).await;
        assert_eq!(report.timers_fired, 1);

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments[0].units_promised, 1);
        assert_eq!(view.commitments[0].state, CommitmentState::Open);
        assert_eq!(view.commitments[1].channel, Channel::Institution);
        assert_eq!(view.commitments[1].units_promised, 1);
        assert_eq!(
            h.notifier
                .sent_to(&Recipient::Donor(DonorId::new("D2")))
                .last()
                .map(|n| n.kind),
            Some(NotificationKind::MobilizationClosed)
        );
    }
}

mod withdrawals {
    use super::*;

    #[tokio::test]
    async fn withdrawal_after_escalation_time_escalates_at_once() {
        let h = Harness::new();
        h.donors(&["D1", "D2"]);
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);
        let request_id = h.submit(2, Urgency::Medium, Duration::hours(8)).await;
        h.accept(request_id, "D1").await;
        h.accept(request_id, "D2").await;

        let report = h.tick(Duration::hours(4) + Duration::minutes(1)).await;
        assert_eq!(report.timers_fired, 1);
        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments.len(), 1);
        assert_eq!(view.commitments[0].units_promised, 2);

        h.clock.advance(Duration::minutes(59));
        let pledge = view.commitments[0].commitment_id;
        let outcome = h
            .orchestrator
            .handle(FulfillmentEvent::DonorWithdrew {
                request_id,
                commitment_id: pledge,
                donor_id: DonorId::new("D1"),
            })
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied);

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments[0].units_promised, 1);
        assert_eq!(view.commitments[0].state, CommitmentState::Open);
        assert_eq!(view.commitments[1].channel, Channel::Institution);
        assert_eq!(view.commitments[1].units_promised, 1);
        assert_eq!(view.shortfall, 0);
        assert_eq!(
            h.notifier
                .sent_to(&Recipient::Institution(InstitutionId::new("UNI-1")))
                .len(),
            1
        );

        h.tick(Duration::hours(2)).await;
        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(
            view.commitments
                .iter()
                .filter(|c| c.channel == Channel::Institution)
                .count(),
            1
        );
        assert!(committed(&view) <= view.units_requested);
    }

    #[tokio::test]
    async fn withdrawal_before_escalation_time_keeps_the_slot_open() {
        let h = Harness::new();
        h.donors(&["D1", "D2"]);
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);
        let request_id = h.submit(2, Urgency::Medium, Duration::hours(8)).await;
        h.accept(request_id, "D1").await;
        h.accept(request_id, "D2").await;

        h.clock.advance(Duration::hours(1));
        let pledge = h.orchestrator.status(request_id).await.unwrap().commitments[0].commitment_id;
        h.orchestrator
            .handle(FulfillmentEvent::DonorWithdrew {
                request_id,
                commitment_id: pledge,
                donor_id: DonorId::new("D1"),
            })
            .await
            .unwrap();

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments.len(), 1);
        assert_eq!(view.commitments[0].units_promised, 2);
        assert_eq!(h.notifier.count_of(NotificationKind::InstitutionEscalated), 0);
    }
}

mod transport {
    use super::*;

    #[tokio::test]
    async fn repeated_delivery_report_counts_once() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.stock("BB-NEAR", 2, Duration::days(20));
        let request_id = h.submit(2, Urgency::High, Duration::hours(6)).await;

        let job_id = h.jobs(request_id).await[0];
        h.drive(job_id, TransportStatus::Delivered).await;
        let replay = h.progress(job_id, TransportStatus::Delivered).await;

        assert!(matches!(replay, EventOutcome::Ignored { .. }));
        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.fulfilled_units, 2);
        assert_eq!(view.status, RequestStatus::Fulfilled);
    }

    #[tokio::test]
    async fn expired_reservation_is_replaced_from_another_bank() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.bank("BB-FAR", 40.45, -3.68);
        h.stock("BB-NEAR", 2, Duration::hours(1));
        h.stock("BB-FAR", 2, Duration::days(20));
        let request_id = h.submit(2, Urgency::High, Duration::hours(6)).await;

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments[0].source, "BB-NEAR");

        let report = h.tick(Duration::minutes(61)).await;
        assert_eq!(report.expired_units, 2);

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments.len(), 2);
        assert_eq!(view.commitments[0].state, CommitmentState::Failed);
        assert_eq!(view.commitments[0].closed_because, Some("reservation_expired"));
        assert_eq!(view.commitments[1].source, "BB-FAR");
        assert_eq!(view.commitments[1].state, CommitmentState::Open);
        assert_eq!(view.transport_jobs[0].status, TransportStatus::Cancelled);
        assert_eq!(view.shortfall, 0);
    }

    #[tokio::test]
    async fn units_expiring_on_the_road_are_not_issued() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.bank("BB-FAR", 40.45, -3.68);
        let near_units = h.stock("BB-NEAR", 2, Duration::hours(1));
        h.stock("BB-FAR", 2, Duration::days(20));
        let request_id = h.submit(2, Urgency::High, Duration::hours(6)).await;

        let job_id = h.jobs(request_id).await[0];
        h.drive(job_id, TransportStatus::Arrived).await;
        h.clock.advance(Duration::minutes(61));
        h.progress(job_id, TransportStatus::Delivered).await;

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.fulfilled_units, 0);
        assert_eq!(view.commitments[0].state, CommitmentState::Failed);
        assert_eq!(view.commitments[0].closed_because, Some("reservation_expired"));
        assert_eq!(view.commitments[1].source, "BB-FAR");
        assert_eq!(view.commitments[1].state, CommitmentState::Open);
        assert_eq!(view.shortfall, 0);
        for unit_id in near_units {
            let unit = h.orchestrator.inventory().unit(unit_id).unwrap();
            assert_ne!(unit.status, UnitStatus::Issued);
        }
    }

    #[tokio::test]
    async fn cold_chain_breach_discards_units_and_rematches() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.bank("BB-FAR", 40.45, -3.68);
        let near_units = h.stock("BB-NEAR", 2, Duration::days(20));
        h.stock("BB-FAR", 2, Duration::days(20));
        let request_id = h.submit(2, Urgency::High, Duration::hours(6)).await;

        let job_id = h.jobs(request_id).await[0];
        h.drive(job_id, TransportStatus::EnRoute).await;

        let first = h.now();
        let outcome = h
            .orchestrator
            .handle(FulfillmentEvent::TemperatureReading {
                job_id,
                celsius: 14.5,
                recorded_at: first,
            })
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied);

        h.clock.advance(Duration::minutes(31));
        h.orchestrator
            .handle(FulfillmentEvent::TemperatureReading {
                job_id,
                celsius: 15.0,
                recorded_at: first + Duration::minutes(31),
            })
            .await
            .unwrap();

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.transport_jobs[0].status, TransportStatus::Failed);
        assert_eq!(view.commitments[0].closed_because, Some("cold_chain_breach"));
        assert_eq!(view.commitments[1].source, "BB-FAR");
        for unit_id in near_units {
            let unit = h.orchestrator.inventory().unit(unit_id).unwrap();
            assert_eq!(unit.status, UnitStatus::Discarded);
        }
    }

    #[tokio::test]
    async fn cancelling_twice_changes_nothing() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.stock("BB-NEAR", 2, Duration::days(20));
        let request_id = h.submit(2, Urgency::High, Duration::hours(6)).await;

        let first = h
            .orchestrator
            .cancel(request_id, "surgery postponed")
            .await
            .unwrap();
        assert_eq!(first.status, RequestStatus::Cancelled);
        assert_eq!(first.transport_jobs[0].status, TransportStatus::Cancelled);
        assert_eq!(
            h.orchestrator.inventory().available_count(
                &BloodBankId::new("BB-NEAR"),
                BloodGroup::ONegative,
                Component::RedCells,
                h.now(),
            ),
            2
        );

        let second = h
            .orchestrator
            .cancel(request_id, "again")
            .await
            .unwrap();
        assert_eq!(second.status, RequestStatus::Cancelled);
        assert_eq!(h.notifier.count_of(NotificationKind::RequestCancelled), 1);
    }
}

mod donors_and_institutions {
    use super::*;

    fn negative_panel() -> Vec<(Pathogen, TestResult)> {
        Pathogen::PANEL
            .iter()
            .map(|p| (*p, TestResult::Negative))
            .collect()
    }

    #[tokio::test]
    async fn late_donation_goes_to_general_stock() {
        let h = Harness::new();
        h.donors(&["D1", "D2"]);
        let request_id = h.submit(1, Urgency::Medium, Duration::hours(6)).await;
        let pledge = h.orchestrator.status(request_id).await.unwrap().commitments[0].commitment_id;

        h.orchestrator
            .handle(FulfillmentEvent::DonorAccepted {
                request_id,
                commitment_id: pledge,
                donor_id: DonorId::new("D1"),
            })
            .await
            .unwrap();
        let EventOutcome::DonationRegistered { donation_id } = h
            .orchestrator
            .handle(FulfillmentEvent::DonationCollected {
                request_id,
                commitment_id: pledge,
                donor_id: DonorId::new("D1"),
                bank_id: BloodBankId::new("BB-NEAR"),
            })
            .await
            .unwrap()
        else {
            panic!("donation not registered");
        };
        let screened = h
            .orchestrator
            .handle(FulfillmentEvent::TestResult {
                donation_id,
                results: negative_panel(),
            })
            .await
            .unwrap();
        assert_eq!(
            screened,
            EventOutcome::Screened {
                screening: TestOutcome::Passed
            }
        );
        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Fulfilled);

        let EventOutcome::DonationRegistered { donation_id } = h
            .orchestrator
            .handle(FulfillmentEvent::DonationCollected {
                request_id,
                commitment_id: pledge,
                donor_id: DonorId::new("D2"),
                bank_id: BloodBankId::new("BB-NEAR"),
            })
            .await
            .unwrap()
        else {
            panic!("donation not registered");
        };
        assert_eq!(
            h.notifier
                .sent_to(&Recipient::Donor(DonorId::new("D2")))
                .last()
                .map(|n| n.kind),
            Some(NotificationKind::RequestAlreadySatisfied)
        );

        h.orchestrator
            .handle(FulfillmentEvent::TestResult {
                donation_id,
                results: negative_panel(),
            })
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.inventory().available_count(
                &BloodBankId::new("BB-NEAR"),
                BloodGroup::ONegative,
                Component::RedCells,
                h.now(),
            ),
            1
        );
        assert_eq!(
            h.orchestrator.status(request_id).await.unwrap().fulfilled_units,
            1
        );
    }

    #[tokio::test]
    async fn surplus_institution_delivery_is_capped() {
        let h = Harness::new();
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);
        let request_id = h.submit(3, Urgency::Critical, Duration::hours(4)).await;
        let pledge = h.orchestrator.status(request_id).await.unwrap().commitments[0].commitment_id;

        let delivered = FulfillmentEvent::InstitutionDelivered {
            request_id,
            commitment_id: pledge,
            institution_id: InstitutionId::new("UNI-1"),
            units: 5,
            reference: "drive-7".to_string(),
        };
        let outcome = h.orchestrator.handle(delivered.clone()).await.unwrap();
        assert_eq!(outcome, EventOutcome::Applied);
        let replay = h.orchestrator.handle(delivered).await.unwrap();
        assert!(matches!(replay, EventOutcome::Ignored { .. }));

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.fulfilled_units, 3);
        assert!(view.fulfilled_units <= view.units_requested);
        assert_eq!(view.status, RequestStatus::Fulfilled);
    }

    #[tokio::test]
    async fn declining_institution_fails_its_pledge() {
        let h = Harness::new();
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);
        let request_id = h.submit(2, Urgency::Critical, Duration::hours(4)).await;
        let pledge = h.orchestrator.status(request_id).await.unwrap().commitments[0].commitment_id;

        h.orchestrator
            .handle(FulfillmentEvent::InstitutionDeclined {
                request_id,
                commitment_id: pledge,
                institution_id: InstitutionId::new("UNI-1"),
            })
            .await
            .unwrap();

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.commitments.len(), 1);
        assert_eq!(view.commitments[0].state, CommitmentState::Failed);
        assert_eq!(view.commitments[0].closed_because, Some("institution_declined"));
        assert_eq!(view.shortfall, 2);
    }

    #[tokio::test]
    async fn unknown_institution_is_rejected() {
        let h = Harness::new();
        h.register("UNI-1", FacilityKind::Institution, 40.43, -3.72);
        let request_id = h.submit(2, Urgency::Critical, Duration::hours(4)).await;
        let pledge = h.orchestrator.status(request_id).await.unwrap().commitments[0].commitment_id;

        let result = h
            .orchestrator
            .handle(FulfillmentEvent::InstitutionDelivered {
                request_id,
                commitment_id: pledge,
                institution_id: InstitutionId::new("UNI-9"),
                units: 1,
                reference: "x".to_string(),
            })
            .await;
        assert!(matches!(
            result,
            Err(orchestrator::OrchestratorError::InvalidEvent(_))
        ));
    }
}

mod event_loop {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn status_reports_for_each_job_apply_in_order() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.stock("BB-NEAR", 40, Duration::days(20));
        let mut requests = Vec::new();
        for _ in 0..40 {
            requests.push(h.submit(1, Urgency::High, Duration::hours(6)).await);
        }
        let mut jobs = Vec::new();
        for request_id in &requests {
            jobs.extend(h.jobs(*request_id).await);
        }
        assert_eq!(jobs.len(), 40);

        let (tx, rx) = mpsc::channel(32);
        let worker = Arc::clone(&h.orchestrator).spawn_event_loop(rx);
        for job_id in &jobs {
            for status in [
                TransportStatus::Dispatched,
                TransportStatus::EnRoute,
                TransportStatus::Arrived,
                TransportStatus::Delivered,
            ] {
                tx.send(FulfillmentEvent::TransportProgress {
                    job_id: *job_id,
                    status,
                    reason: None,
                })
                .await
                .unwrap();
            }
        }
        drop(tx);
        worker.await.unwrap();

        for request_id in requests {
            let view = h.orchestrator.status(request_id).await.unwrap();
            assert_eq!(view.status, RequestStatus::Fulfilled);
            assert_eq!(view.transport_jobs[0].status, TransportStatus::Delivered);
        }
        assert_eq!(h.notifier.count_of(NotificationKind::RequestFulfilled), 40);
    }
}

mod races {
    use super::*;

    fn delivered(job_id: JobId) -> FulfillmentEvent {
        FulfillmentEvent::TransportProgress {
            job_id,
            status: TransportStatus::Delivered,
            reason: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delivery_racing_a_cancel_settles_one_way() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        let units = h.stock("BB-NEAR", 2, Duration::days(20));
        let request_id = h.submit(2, Urgency::High, Duration::hours(6)).await;
        let job_id = h.jobs(request_id).await[0];
        h.drive(job_id, TransportStatus::Arrived).await;

        let (delivery, cancel) = tokio::join!(
            h.orchestrator.handle(delivered(job_id)),
            h.orchestrator.cancel(request_id, "surgery postponed"),
        );
        delivery.unwrap();
        cancel.unwrap();

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert!(committed(&view) <= view.units_requested);
        let fulfilled = h.notifier.count_of(NotificationKind::RequestFulfilled);
        let cancelled = h.notifier.count_of(NotificationKind::RequestCancelled);
        assert_eq!(fulfilled + cancelled, 1);
        match view.status {
            RequestStatus::Fulfilled => {
                assert_eq!(view.fulfilled_units, 2);
                assert_eq!(fulfilled, 1);
            }
            RequestStatus::Cancelled => {
                assert_eq!(view.fulfilled_units, 0);
                for unit_id in units {
                    let unit = h.orchestrator.inventory().unit(unit_id).unwrap();
                    assert_eq!(unit.status, UnitStatus::Available);
                }
            }
            other => panic!("unexpected status {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_deliveries_count_each_unit_once() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.bank("BB-FAR", 40.45, -3.68);
        h.stock("BB-NEAR", 1, Duration::days(20));
        h.stock("BB-FAR", 1, Duration::days(20));
        let request_id = h.submit(2, Urgency::High, Duration::hours(6)).await;
        let jobs = h.jobs(request_id).await;
        assert_eq!(jobs.len(), 2);
        for job_id in &jobs {
            h.drive(*job_id, TransportStatus::Arrived).await;
        }

        let (first, second, replay) = tokio::join!(
            h.orchestrator.handle(delivered(jobs[0])),
            h.orchestrator.handle(delivered(jobs[1])),
            h.orchestrator.handle(delivered(jobs[0])),
        );
        for outcome in [first, second, replay] {
            outcome.unwrap();
        }

        let view = h.orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Fulfilled);
        assert_eq!(view.fulfilled_units, 2);
        assert!(committed(&view) <= view.units_requested);
        assert_eq!(h.notifier.count_of(NotificationKind::RequestFulfilled), 1);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn closed_requests_are_no_longer_tracked() {
        let h = Harness::new();
        h.bank("BB-NEAR", 40.42, -3.70);
        h.stock("BB-NEAR", 1, Duration::days(20));
        let fulfilled = h.submit(1, Urgency::High, Duration::hours(6)).await;
        let cancelled = h.submit(1, Urgency::High, Duration::hours(6)).await;
        let expiring = h.submit(1, Urgency::Medium, Duration::hours(2)).await;
        assert_eq!(h.orchestrator.open_requests(), 3);

        let job_id = h.jobs(fulfilled).await[0];
        h.drive(job_id, TransportStatus::Delivered).await;
        h.orchestrator.cancel(cancelled, "no longer needed").await.unwrap();
        h.orchestrator.cancel(cancelled, "again").await.unwrap();
        assert_eq!(h.orchestrator.open_requests(), 1);

        h.tick(Duration::hours(2)).await;
        let view = h.orchestrator.status(expiring).await.unwrap();
        assert_eq!(view.status, RequestStatus::Expired);
        assert_eq!(h.orchestrator.open_requests(), 0);

        h.orchestrator
            .handle(FulfillmentEvent::StockAdded {
                bank_id: BloodBankId::new("BB-NEAR"),
                blood_group: BloodGroup::ONegative,
                component: Component::RedCells,
                units: 2,
                expires_at: h.now() + Duration::days(20),
            })
            .await
            .unwrap();
        assert_eq!(h.orchestrator.open_requests(), 0);
        assert_eq!(
            h.orchestrator.inventory().available_count(
                &BloodBankId::new("BB-NEAR"),
                BloodGroup::ONegative,
                Component::RedCells,
                h.now(),
            ),
            2
        );
    }

    /// Directory that is always unreachable.
    struct OfflineDirectory;

    #[async_trait]
    impl FacilityDirectory for OfflineDirectory {
        async fn nearby(
            &self,
            _location: GeoPoint,
            _radius_km: f64,
            _kind: FacilityKind,
        ) -> Result<Vec<RankedFacility>, OrchestratorError> {
            Err(OrchestratorError::Directory("registry unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn submit_survives_an_unreachable_directory() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        let notifier = InMemoryNotifier::new();
        let orchestrator = FulfillmentOrchestrator::new(
            InMemoryEventStore::new(),
            OfflineDirectory,
            notifier.clone(),
            OrchestratorConfig::default(),
        )
        .with_clock(Arc::new(ManualClock::new(start)));

        let request_id = orchestrator
            .submit(RequestSpec {
                hospital_id: HospitalId::new("H-CENTRAL"),
                blood_group: BloodGroup::ONegative,
                component: Component::RedCells,
                units: 2,
                urgency: Urgency::High,
                deadline: start + Duration::hours(6),
                location: GeoPoint::new(HOSPITAL.0, HOSPITAL.1),
            })
            .await
            .unwrap();

        let view = orchestrator.status(request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Pending);
        assert_eq!(view.shortfall, 2);
        assert_eq!(orchestrator.open_requests(), 1);
        assert!(orchestrator.next_timer().is_some());
        assert!(notifier.sent().is_empty());
    }
}
