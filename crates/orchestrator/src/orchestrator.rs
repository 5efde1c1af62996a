//! The fulfillment orchestrator: drives each request through the escalation
//! ladder and reconciles channel reports against the request ledger.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use common::{BloodBankId, CommitmentId, DonationId, DonorId, InstitutionId, JobId, UnitId};
use domain::request::{CancelRequest, OpenCommitment, RecordDelivery, SubmitRequest};
use domain::transport::ScheduleTransport;
use domain::{
    BloodGroup, BloodRequest, BloodUnit, CancelReason, Channel, Collection, CommandResult,
    Commitment, CommitmentKind, CommitmentState, Component, DomainError, Donation, DonationTarget,
    FailureReason, InventoryError, InventoryLedger, RequestError, RequestEvent, RequestId,
    RequestLedger, RequestSpec, TestOutcome, TestingGate, TransportCoordinator, TransportIssue,
    TransportJob, TransportStatus,
};
use event_store::{EventStore, EventSubscription};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::context::{Outbox, RequestContext};
use crate::error::{OrchestratorError, Result};
use crate::events::{EventOutcome, FulfillmentEvent};
use crate::services::{
    FacilityDirectory, FacilityKind, Notification, NotificationKind, Notifier, RankedFacility,
    Recipient,
};
use crate::status::RequestStatusView;
use crate::timers::{TimerKind, TimerQueue};

/// Facilities that can serve one request, looked up before its lock is taken.
#[derive(Debug, Default)]
struct Reach {
    banks: Vec<RankedFacility>,
    donors: Vec<DonorId>,
    institutions: Vec<InstitutionId>,
}

impl Reach {
    fn includes_bank(&self, bank_id: &BloodBankId) -> bool {
        self.banks
            .iter()
            .any(|b| b.facility.id == bank_id.as_str())
    }
}

/// A cold-chain report about one transport job.
enum Observation {
    Reading {
        celsius: f64,
        recorded_at: DateTime<Utc>,
    },
    Issue(TransportIssue),
}

/// Ordering key for injected events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Lane {
    Request(RequestId),
    Shared,
}

/// Summary of one `tick`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub expired_units: usize,
    pub timers_fired: usize,
}

/// Drives blood requests to a terminal state across bank, donor and
/// institution channels.
///
/// Every mutation of one request runs under that request's lock, so two
/// reports can never both see the same shortfall. Different requests proceed
/// independently; inventory serializes per bank on its own. Directory
/// lookups happen before a lock is taken and notifications are sent after
/// it is released.
pub struct FulfillmentOrchestrator<S, D, N>
where
    S: EventStore + Clone,
    D: FacilityDirectory,
    N: Notifier,
{
    store: S,
    requests: RequestLedger<S>,
    transport: TransportCoordinator<S>,
    inventory: InventoryLedger,
    testing: TestingGate,
    directory: D,
    notifier: N,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    contexts: RwLock<HashMap<RequestId, Arc<Mutex<RequestContext>>>>,
    timers: StdMutex<TimerQueue>,
}

impl<S, D, N> FulfillmentOrchestrator<S, D, N>
where
    S: EventStore + Clone,
    D: FacilityDirectory,
    N: Notifier,
{
    pub fn new(store: S, directory: D, notifier: N, config: OrchestratorConfig) -> Self {
        Self {
            requests: RequestLedger::new(store.clone()),
            transport: TransportCoordinator::with_policy(store.clone(), config.cold_chain),
            store,
            inventory: InventoryLedger::new(),
            testing: TestingGate::new(),
            directory,
            notifier,
            clock: Arc::new(SystemClock),
            config,
            contexts: RwLock::new(HashMap::new()),
            timers: StdMutex::new(TimerQueue::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Shares an existing inventory ledger (e.g. one pre-stocked at start-up).
    pub fn with_inventory(mut self, inventory: InventoryLedger) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_testing(mut self, testing: TestingGate) -> Self {
        self.testing = testing;
        self
    }

    pub fn inventory(&self) -> &InventoryLedger {
        &self.inventory
    }

    pub fn testing(&self) -> &TestingGate {
        &self.testing
    }

    pub fn requests(&self) -> &RequestLedger<S> {
        &self.requests
    }

    pub fn transport(&self) -> &TransportCoordinator<S> {
        &self.transport
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Live feed of every journaled transition (requests, commitments,
    /// transport).
    pub fn subscribe(&self) -> EventSubscription {
        self.store.subscribe()
    }

    /// Earliest pending timer, for schedulers that sleep until it.
    pub fn next_timer(&self) -> Option<DateTime<Utc>> {
        self.timers().next_due()
    }

    /// Requests that have not reached a terminal status.
    pub fn open_requests(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ---------------------------------------------------------------------
    // Exposed operations
    // ---------------------------------------------------------------------

    /// Records a request and runs the escalation ladder for it.
    #[tracing::instrument(
        skip(self, spec),
        fields(hospital_id = %spec.hospital_id, units = spec.units)
    )]
    pub async fn submit(&self, spec: RequestSpec) -> Result<RequestId> {
        let now = self.clock.now();
        let cmd = SubmitRequest::new(spec, now);
        let request_id = cmd.request_id;
        let request = self.requests.submit(cmd).await?.aggregate;

        {
            let mut timers = self.timers();
            timers.schedule(request.deadline(), TimerKind::RequestDeadline { request_id });
            let escalation_at = self.config.escalation_at(
                request.urgency(),
                request.submitted_at(),
                request.deadline(),
            );
            if escalation_at > now {
                timers.schedule(escalation_at, TimerKind::EscalationDue { request_id });
            }
        }

        let ctx = self.track(request_id);
        let mut outbox = Outbox::default();
        let result = async {
            let reach = self.reach(&request).await?;
            let mut ctx = ctx.lock().await;
            self.run_ladder(&mut ctx, request_id, &reach, now, &mut outbox)
                .await
        }
        .await;
        self.dispatch(&mut outbox).await;
        // The request is already recorded; its timers and stock intake
        // retry the ladder.
        if let Err(error) = result {
            tracing::error!(%request_id, %error, "initial matching failed");
        }
        Ok(request_id)
    }

    /// Cancels a request and withdraws its open commitments. Cancelling a
    /// request that already reached a terminal status changes nothing.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, request_id: RequestId, reason: &str) -> Result<RequestStatusView> {
        let now = self.clock.now();
        let ctx = self.context(request_id);
        let mut outbox = Outbox::default();
        let result = {
            let _guard = ctx.lock().await;
            self.cancel_locked(request_id, reason, now, &mut outbox).await
        };
        self.dispatch(&mut outbox).await;
        result?;
        self.status(request_id).await
    }

    pub async fn status(&self, request_id: RequestId) -> Result<RequestStatusView> {
        let request = self.load(request_id).await?;
        let mut jobs = Vec::new();
        for job_id in request.commitments().iter().filter_map(|c| c.kind.job_id()) {
            if let Some(job) = self.transport.get(job_id).await? {
                jobs.push(job);
            }
        }
        Ok(RequestStatusView::build(
            request_id,
            &request,
            &jobs,
            self.clock.now(),
            self.config.closing_window,
        ))
    }

    /// Takes a batch of cleared units into a bank and offers them to open
    /// requests.
    #[tracing::instrument(skip(self))]
    pub async fn admit_stock(
        &self,
        bank_id: BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        units: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<UnitId>> {
        let now = self.clock.now();
        let unit_ids = self
            .inventory
            .stock(&bank_id, blood_group, component, units, expires_at, now)?;
        tracing::info!(units, "stock admitted");
        self.offer_stock(&bank_id, blood_group, component, now).await?;
        Ok(unit_ids)
    }

    /// Applies one reported event.
    #[tracing::instrument(skip(self, event), fields(event = event.kind()))]
    pub async fn handle(&self, event: FulfillmentEvent) -> Result<EventOutcome> {
        let now = self.clock.now();
        match event {
            FulfillmentEvent::TransportProgress {
                job_id,
                status,
                reason,
            } => self.on_transport_progress(job_id, status, reason, now).await,
            FulfillmentEvent::TemperatureReading {
                job_id,
                celsius,
                recorded_at,
            } => {
                let observation = Observation::Reading {
                    celsius,
                    recorded_at,
                };
                self.on_cold_chain(job_id, observation, now).await
            }
            FulfillmentEvent::TransportIssue { job_id, issue } => {
                self.on_cold_chain(job_id, Observation::Issue(issue), now)
                    .await
            }
            FulfillmentEvent::DonorAccepted {
                request_id,
                commitment_id,
                donor_id,
            } => {
                self.on_donor_accepted(request_id, commitment_id, donor_id, now)
                    .await
            }
            FulfillmentEvent::DonorWithdrew {
                request_id,
                commitment_id,
                donor_id,
            } => {
                self.on_donor_withdrew(request_id, commitment_id, donor_id, now)
                    .await
            }
            FulfillmentEvent::DonationCollected {
                request_id,
                commitment_id,
                donor_id,
                bank_id,
            } => {
                self.on_donation_collected(request_id, commitment_id, donor_id, bank_id, now)
                    .await
            }
            FulfillmentEvent::TestResult {
                donation_id,
                results,
            } => {
                let screening = self.testing.record_panel(donation_id, &results)?;
                self.on_screened(donation_id, screening, now).await?;
                Ok(EventOutcome::Screened { screening })
            }
            FulfillmentEvent::InstitutionDelivered {
                request_id,
                commitment_id,
                institution_id,
                units,
                reference,
            } => {
                self.on_institution_delivered(
                    request_id,
                    commitment_id,
                    institution_id,
                    units,
                    reference,
                    now,
                )
                .await
            }
            FulfillmentEvent::InstitutionDeclined {
                request_id,
                commitment_id,
                institution_id,
            } => {
                self.on_institution_declined(request_id, commitment_id, institution_id, now)
                    .await
            }
            FulfillmentEvent::StockAdded {
                bank_id,
                blood_group,
                component,
                units,
                expires_at,
            } => {
                let unit_ids = self
                    .admit_stock(bank_id, blood_group, component, units, expires_at)
                    .await?;
                Ok(EventOutcome::StockAdmitted { unit_ids })
            }
            FulfillmentEvent::Tick { now } => {
                self.tick(now).await;
                Ok(EventOutcome::Applied)
            }
        }
    }

    /// Sweeps expired units, fires due timers and enforces deadlines.
    /// Failures are logged per request so one bad request cannot stall the
    /// others.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let expired = self.inventory.expire_sweep(now);
        let mut held: BTreeMap<RequestId, Vec<UnitId>> = BTreeMap::new();
        for unit in &expired {
            if let Some(request_id) = unit.request_id {
                held.entry(request_id).or_default().push(unit.unit_id);
            }
        }
        for (request_id, unit_ids) in held {
            if let Err(error) = self.on_reservation_expired(request_id, &unit_ids, now).await {
                tracing::error!(%request_id, %error, "reservation expiry handling failed");
            }
        }

        let due = self.timers().pop_due(now);
        for (_, timer) in &due {
            if let Err(error) = self.on_timer(*timer, now).await {
                tracing::error!(request_id = %timer.request_id(), %error, "timer handling failed");
            }
        }

        TickReport {
            expired_units: expired.len(),
            timers_fired: due.len(),
        }
    }

    /// Processes injected events until the sender side closes.
    ///
    /// Events about the same request are applied in arrival order; events
    /// about different requests run concurrently. Stock intake and ticks
    /// share one lane of their own.
    pub fn spawn_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<FulfillmentEvent>,
    ) -> JoinHandle<()>
    where
        S: 'static,
        D: 'static,
        N: 'static,
    {
        tokio::spawn(async move {
            let mut lanes: HashMap<Lane, JoinHandle<()>> = HashMap::new();
            while let Some(event) = events.recv().await {
                lanes.retain(|_, task| !task.is_finished());
                let lane = self.lane_of(&event).await;
                let previous = lanes.remove(&lane);
                let orchestrator = Arc::clone(&self);
                let task = tokio::spawn(async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    let kind = event.kind();
                    if let Err(error) = orchestrator.handle(event).await {
                        tracing::warn!(event = kind, %error, "event rejected");
                    }
                });
                lanes.insert(lane, task);
            }
            for (_, task) in lanes {
                let _ = task.await;
            }
            tracing::info!("event loop stopped");
        })
    }

    /// The request an injected event is about. Events whose subject cannot
    /// be resolved go to the shared lane and fail there.
    async fn lane_of(&self, event: &FulfillmentEvent) -> Lane {
        let request_id = match event {
            FulfillmentEvent::DonorAccepted { request_id, .. }
            | FulfillmentEvent::DonorWithdrew { request_id, .. }
            | FulfillmentEvent::DonationCollected { request_id, .. }
            | FulfillmentEvent::InstitutionDelivered { request_id, .. }
            | FulfillmentEvent::InstitutionDeclined { request_id, .. } => Some(*request_id),
            FulfillmentEvent::TransportProgress { job_id, .. }
            | FulfillmentEvent::TemperatureReading { job_id, .. }
            | FulfillmentEvent::TransportIssue { job_id, .. } => self
                .transport
                .get(*job_id)
                .await
                .ok()
                .flatten()
                .and_then(|job| job.request_id()),
            FulfillmentEvent::TestResult { donation_id, .. } => self
                .testing
                .donation(*donation_id)
                .and_then(|donation| donation.target)
                .map(|target| target.request_id),
            FulfillmentEvent::StockAdded { .. } | FulfillmentEvent::Tick { .. } => None,
        };
        request_id.map_or(Lane::Shared, Lane::Request)
    }

    // ---------------------------------------------------------------------
    // Escalation ladder
    // ---------------------------------------------------------------------

    /// Bank match, then donor mobilization (once), then institutional
    /// escalation when due. Each step only covers the remaining shortfall.
    async fn run_ladder(
        &self,
        ctx: &mut RequestContext,
        request_id: RequestId,
        reach: &Reach,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<BloodRequest> {
        let mut request = self.load(request_id).await?;
        if request.is_terminal() || now >= request.deadline() {
            return Ok(request);
        }

        if request.shortfall() > 0 {
            request = self
                .match_banks(ctx, request_id, request, &reach.banks, now, outbox)
                .await?;
        }
        if request.shortfall() > 0 && !has_channel(&request, Channel::Donor) {
            request = self
                .mobilize_donors(request_id, request, &reach.donors, now, outbox)
                .await?;
        }
        if request.shortfall() > 0 && self.escalation_due(ctx, &request, now) {
            request = self
                .escalate(request_id, request, &reach.institutions, now, outbox)
                .await?;
        }

        if request.shortfall() > 0 {
            tracing::debug!(shortfall = request.shortfall(), "shortfall remains");
        }
        Ok(request)
    }

    async fn match_banks(
        &self,
        ctx: &RequestContext,
        request_id: RequestId,
        mut request: BloodRequest,
        banks: &[RankedFacility],
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<BloodRequest> {
        let (group, component) = (request.blood_group(), request.component());

        // Nearest first, then earliest-expiring stock; banks that already
        // failed this request go last.
        let mut candidates: Vec<_> = banks
            .iter()
            .filter_map(|ranked| {
                let bank_id = BloodBankId::new(ranked.facility.id.as_str());
                let expiry = self
                    .inventory
                    .earliest_expiry(&bank_id, group, component, now)?;
                Some((
                    ctx.failed_banks.contains(&bank_id),
                    ranked.distance_km,
                    expiry,
                    bank_id,
                ))
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        for (_, _, _, bank_id) in candidates {
            let shortfall = request.shortfall();
            if shortfall == 0 {
                break;
            }
            let available = self
                .inventory
                .available_count(&bank_id, group, component, now);
            let quantity = shortfall.min(available);
            if quantity == 0 {
                continue;
            }
            match self
                .inventory
                .reserve(&bank_id, group, component, quantity, request_id, now)
            {
                Ok(unit_ids) => {
                    request = self
                        .open_bank_commitment(request_id, &request, bank_id, unit_ids, now, outbox)
                        .await?;
                }
                Err(InventoryError::InsufficientStock { available, .. }) => {
                    tracing::warn!(
                        %bank_id,
                        available,
                        "stock taken concurrently, trying next bank"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(request)
    }

    async fn open_bank_commitment(
        &self,
        request_id: RequestId,
        request: &BloodRequest,
        bank_id: BloodBankId,
        unit_ids: Vec<UnitId>,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<BloodRequest> {
        let destination = request
            .hospital_id()
            .cloned()
            .ok_or(OrchestratorError::RequestNotFound(request_id))?;
        let earliest_expiry = unit_ids
            .iter()
            .filter_map(|id| self.inventory.unit(*id))
            .map(|unit| unit.expires_at)
            .min()
            .unwrap_or_else(|| request.deadline());
        let job_id = JobId::new();
        let units = unit_ids.len() as u32;

        let cmd = OpenCommitment::new(
            request_id,
            CommitmentKind::BankReservation {
                bank_id: bank_id.clone(),
                unit_ids: unit_ids.clone(),
                job_id,
                earliest_expiry,
            },
            units,
            now,
        );
        let commitment_id = cmd.commitment_id;
        let opened = match self.requests.open_commitment(cmd).await {
            Ok(result) => result.aggregate,
            Err(error) => {
                self.inventory.release_held(&unit_ids, request_id)?;
                return Err(error.into());
            }
        };

        let schedule = ScheduleTransport {
            request_id,
            commitment_id,
            source: bank_id.clone(),
            destination,
            unit_ids: unit_ids.clone(),
        };
        if let Err(error) = self.transport.schedule(job_id, schedule, now).await {
            self.inventory.release_held(&unit_ids, request_id)?;
            self.requests
                .fail_commitment(
                    request_id,
                    commitment_id,
                    FailureReason::TransportFailed(error.to_string()),
                    now,
                )
                .await?;
            return Err(error.into());
        }

        metrics::counter!("commitments_opened_total", "channel" => Channel::Bank.as_str())
            .increment(1);
        tracing::info!(%bank_id, %commitment_id, units, "bank units reserved");
        outbox.push(
            Notification::new(
                Recipient::Bank(bank_id),
                NotificationKind::TransportScheduled,
                request_id,
            )
            .with_payload(json!({ "job_id": job_id, "units": unit_ids })),
        );
        Ok(opened)
    }

    async fn mobilize_donors(
        &self,
        request_id: RequestId,
        request: BloodRequest,
        donors: &[DonorId],
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<BloodRequest> {
        if donors.is_empty() {
            tracing::info!("no reachable donors to mobilize");
            return Ok(request);
        }

        let units = request.shortfall().min(donors.len() as u32);
        let respond_by = self
            .config
            .donor_respond_by(request.urgency(), now, request.deadline());
        let cmd = OpenCommitment::new(
            request_id,
            CommitmentKind::DonorPledge {
                donors: donors.to_vec(),
                respond_by,
            },
            units,
            now,
        );
        let commitment_id = cmd.commitment_id;
        let opened = self.requests.open_commitment(cmd).await?.aggregate;
        self.timers().schedule(
            respond_by,
            TimerKind::DonorResponseDue {
                request_id,
                commitment_id,
            },
        );

        metrics::counter!("commitments_opened_total", "channel" => Channel::Donor.as_str())
            .increment(1);
        tracing::info!(%commitment_id, units, donors = donors.len(), "donors mobilized");
        let payload = json!({
            "commitment_id": commitment_id,
            "blood_group": opened.blood_group(),
            "component": opened.component(),
            "location": opened.location(),
            "respond_by": respond_by,
        });
        for donor in donors {
            outbox.push(
                Notification::new(
                    Recipient::Donor(donor.clone()),
                    NotificationKind::DonorMobilized,
                    request_id,
                )
                .with_payload(payload.clone()),
            );
        }
        Ok(opened)
    }

    async fn escalate(
        &self,
        request_id: RequestId,
        request: BloodRequest,
        institutions: &[InstitutionId],
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<BloodRequest> {
        let contacted: HashSet<&InstitutionId> = request
            .commitments()
            .iter()
            .filter_map(|c| match &c.kind {
                CommitmentKind::InstitutionPledge { institutions, .. } => Some(institutions.iter()),
                _ => None,
            })
            .flatten()
            .collect();
        let untried: Vec<InstitutionId> = institutions
            .iter()
            .filter(|i| !contacted.contains(i))
            .cloned()
            .collect();
        if untried.is_empty() {
            tracing::info!("no institutions left to escalate to");
            return Ok(request);
        }

        let units = request.shortfall();
        let due_by = self.config.institution_due_by(now, request.deadline());
        let cmd = OpenCommitment::new(
            request_id,
            CommitmentKind::InstitutionPledge {
                institutions: untried.clone(),
                due_by,
            },
            units,
            now,
        );
        let commitment_id = cmd.commitment_id;
        let opened = self.requests.open_commitment(cmd).await?.aggregate;
        self.timers().schedule(
            due_by,
            TimerKind::InstitutionResponseDue {
                request_id,
                commitment_id,
            },
        );

        metrics::counter!("commitments_opened_total", "channel" => Channel::Institution.as_str())
            .increment(1);
        tracing::info!(
            %commitment_id,
            units,
            institutions = untried.len(),
            "escalated to institutions"
        );
        for institution in untried {
            outbox.push(
                Notification::new(
                    Recipient::Institution(institution),
                    NotificationKind::InstitutionEscalated,
                    request_id,
                )
                .with_payload(json!({
                    "commitment_id": commitment_id,
                    "units": units,
                    "blood_group": opened.blood_group(),
                    "due_by": due_by,
                })),
            );
        }
        Ok(opened)
    }

    fn escalation_due(
        &self,
        ctx: &RequestContext,
        request: &BloodRequest,
        now: DateTime<Utc>,
    ) -> bool {
        ctx.escalate_early
            || now
                >= self.config.escalation_at(
                    request.urgency(),
                    request.submitted_at(),
                    request.deadline(),
                )
    }

    /// Unaccepted donor slots go back at the response deadline or at the
    /// escalation time, whichever comes first.
    fn donor_slots_reclaimable(
        &self,
        request: &BloodRequest,
        commitment: &Commitment,
        now: DateTime<Utc>,
    ) -> bool {
        if donor_window_closed(commitment, now) {
            return true;
        }
        commitment.is_open()
            && commitment.channel() == Channel::Donor
            && now
                >= self.config.escalation_at(
                    request.urgency(),
                    request.submitted_at(),
                    request.deadline(),
                )
    }

    /// A donor round that failed or shrank brings institutions in early when
    /// waiting for the regular escalation time would leave too little room.
    fn note_donor_shortfall(
        &self,
        ctx: &mut RequestContext,
        request: &BloodRequest,
        now: DateTime<Utc>,
    ) {
        if request.urgency().is_critical()
            || request.deadline() - now <= self.config.institution_window
        {
            ctx.escalate_early = true;
        }
    }

    // ---------------------------------------------------------------------
    // Closing commitments
    // ---------------------------------------------------------------------

    /// Cancels an open commitment and undoes its side effects. Returns
    /// `false`, changing nothing, when its units are already on the road.
    async fn withdraw(
        &self,
        request_id: RequestId,
        commitment: &Commitment,
        reason: CancelReason,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<bool> {
        match &commitment.kind {
            CommitmentKind::BankReservation {
                unit_ids, job_id, ..
            } => {
                if let Some(job) = self.transport.get(*job_id).await? {
                    if job.status().is_in_flight() {
                        return Ok(false);
                    }
                    if job.status().can_cancel() {
                        self.transport.cancel(*job_id, reason.as_str(), now).await?;
                    }
                }
                self.inventory.release_held(unit_ids, request_id)?;
            }
            CommitmentKind::DonorPledge { donors, .. } => {
                for donor in donors {
                    outbox.push(Notification::new(
                        Recipient::Donor(donor.clone()),
                        NotificationKind::DonationNoLongerNeeded,
                        request_id,
                    ));
                }
            }
            CommitmentKind::InstitutionPledge { institutions, .. } => {
                for institution in institutions {
                    outbox.push(Notification::new(
                        Recipient::Institution(institution.clone()),
                        NotificationKind::EscalationWithdrawn,
                        request_id,
                    ));
                }
            }
        }

        self.requests
            .cancel_commitment(request_id, commitment.id, reason.clone(), now)
            .await?;
        record_closed(commitment.channel(), "cancelled");
        tracing::info!(
            commitment_id = %commitment.id,
            reason = reason.as_str(),
            "commitment withdrawn"
        );
        Ok(true)
    }

    async fn record_failure(
        &self,
        request_id: RequestId,
        commitment: &Commitment,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        tracing::warn!(
            commitment_id = %commitment.id,
            reason = reason.as_str(),
            "commitment failed"
        );
        self.requests
            .fail_commitment(request_id, commitment.id, reason, now)
            .await?;
        record_closed(commitment.channel(), "failed");
        Ok(())
    }

    /// Gives back the unaccepted slots of an open donor pledge. The pledge
    /// keeps one slot per accepted donor; with none it fails.
    async fn reclaim_donor_slots(
        &self,
        ctx: &mut RequestContext,
        request_id: RequestId,
        commitment: &Commitment,
        failure: FailureReason,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let CommitmentKind::DonorPledge { donors, .. } = &commitment.kind else {
            return Ok(());
        };
        let keep = commitment.accepted_donors.len() as u32;
        if !commitment.is_open() || keep >= commitment.units_promised {
            return Ok(());
        }

        for donor in donors
            .iter()
            .filter(|d| !commitment.accepted_donors.contains(d))
        {
            outbox.push(Notification::new(
                Recipient::Donor(donor.clone()),
                NotificationKind::MobilizationClosed,
                request_id,
            ));
        }

        if keep == 0 {
            self.record_failure(request_id, commitment, failure, now)
                .await?;
        } else {
            self.requests
                .reduce_commitment(request_id, commitment.id, keep, now)
                .await?;
            tracing::info!(commitment_id = %commitment.id, keep, "donor pledge shrunk");
        }

        let request = self.load(request_id).await?;
        self.note_donor_shortfall(ctx, &request, now);
        Ok(())
    }

    /// Frees up to `slots` unaccepted donor slots in favour of bank stock.
    async fn displace_donor_slots(
        &self,
        request_id: RequestId,
        commitment: &Commitment,
        slots: u32,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let remaining = commitment.units_promised - slots;
        if remaining == 0 {
            self.withdraw(
                request_id,
                commitment,
                CancelReason::SupersededByBankStock,
                now,
                outbox,
            )
            .await?;
            return Ok(());
        }

        self.requests
            .reduce_commitment(request_id, commitment.id, remaining, now)
            .await?;
        if slots == commitment.unaccepted_slots() {
            if let CommitmentKind::DonorPledge { donors, .. } = &commitment.kind {
                for donor in donors
                    .iter()
                    .filter(|d| !commitment.accepted_donors.contains(d))
                {
                    outbox.push(Notification::new(
                        Recipient::Donor(donor.clone()),
                        NotificationKind::DonationNoLongerNeeded,
                        request_id,
                    ));
                }
            }
        }
        tracing::info!(
            commitment_id = %commitment.id,
            slots,
            "donor slots displaced by bank stock"
        );
        Ok(())
    }

    /// Bookkeeping after a delivery was recorded.
    fn after_delivery(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        result: &CommandResult<BloodRequest>,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let request = &result.aggregate;
        if let Some(commitment) = request.commitment(commitment_id) {
            if commitment.state == CommitmentState::Delivered {
                record_closed(commitment.channel(), "delivered");
            }
        }

        let fulfilled = result
            .events
            .iter()
            .any(|e| matches!(e, RequestEvent::RequestFulfilled(_)));
        if !fulfilled {
            return;
        }

        self.retire(request_id);
        let elapsed = (now - request.submitted_at()).num_milliseconds() as f64 / 1000.0;
        metrics::histogram!("fulfillment_duration_seconds").record(elapsed);
        tracing::info!(%request_id, units = request.fulfilled_units(), "request fulfilled");
        if let Some(hospital) = request.hospital_id() {
            outbox.push(
                Notification::new(
                    Recipient::Hospital(hospital.clone()),
                    NotificationKind::RequestFulfilled,
                    request_id,
                )
                .with_payload(json!({ "fulfilled_units": request.fulfilled_units() })),
            );
        }
    }

    /// Past the deadline: withdraw what can be withdrawn and expire the
    /// request once nothing is left in flight.
    async fn enforce_deadline(
        &self,
        request_id: RequestId,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let request = self.load(request_id).await?;
        if request.is_terminal() || now < request.deadline() {
            return Ok(());
        }

        let open: Vec<Commitment> = request.open_commitments().cloned().collect();
        let mut deferred = 0;
        for commitment in &open {
            let withdrawn = self
                .withdraw(
                    request_id,
                    commitment,
                    CancelReason::DeadlineExceeded,
                    now,
                    outbox,
                )
                .await?;
            if !withdrawn {
                deferred += 1;
            }
        }
        if deferred > 0 {
            tracing::info!(%request_id, deferred, "expiry deferred until transport settles");
            return Ok(());
        }

        let expired = self.requests.expire(request_id, now).await?.aggregate;
        self.retire(request_id);
        tracing::info!(%request_id, fulfilled = expired.fulfilled_units(), "request expired");
        if let Some(hospital) = expired.hospital_id() {
            outbox.push(
                Notification::new(
                    Recipient::Hospital(hospital.clone()),
                    NotificationKind::RequestExpired,
                    request_id,
                )
                .with_payload(json!({
                    "fulfilled_units": expired.fulfilled_units(),
                    "units_requested": expired.units_requested(),
                })),
            );
        }
        Ok(())
    }

    async fn cancel_locked(
        &self,
        request_id: RequestId,
        reason: &str,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let request = self.load(request_id).await?;
        if request.is_terminal() {
            tracing::debug!(status = %request.status(), "request already closed");
            return Ok(());
        }

        let open: Vec<Commitment> = request.open_commitments().cloned().collect();
        for commitment in &open {
            self.withdraw(
                request_id,
                commitment,
                CancelReason::RequestCancelled(reason.to_string()),
                now,
                outbox,
            )
            .await?;
        }
        self.requests
            .cancel(CancelRequest::new(request_id, reason, now))
            .await?;
        self.retire(request_id);

        if let Some(hospital) = request.hospital_id() {
            outbox.push(
                Notification::new(
                    Recipient::Hospital(hospital.clone()),
                    NotificationKind::RequestCancelled,
                    request_id,
                )
                .with_payload(json!({ "reason": reason })),
            );
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Transport
    // ---------------------------------------------------------------------

    async fn on_transport_progress(
        &self,
        job_id: JobId,
        status: TransportStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let request_id = self.job_request(job_id).await?;
        let (ctx, reach) = self.prepare(request_id).await?;
        let mut outbox = Outbox::default();
        let result: Result<EventOutcome> = async {
            let mut ctx = ctx.lock().await;
            let updated = self
                .transport
                .update_status(job_id, status, reason.clone(), now)
                .await?;
            if updated.is_noop() {
                return Ok(EventOutcome::ignored("status already recorded"));
            }
            let job = updated.aggregate;
            let outcome = match status {
                TransportStatus::Delivered => {
                    self.complete_bank_delivery(
                        &mut ctx,
                        request_id,
                        &job,
                        &reach,
                        now,
                        &mut outbox,
                    )
                    .await?
                }
                TransportStatus::Failed | TransportStatus::Cancelled => {
                    self.transport_aborted(
                        &mut ctx,
                        request_id,
                        &job,
                        reason,
                        &reach,
                        now,
                        &mut outbox,
                    )
                    .await?
                }
                _ => EventOutcome::Applied,
            };
            Ok(outcome)
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    /// Temperature readings and incident reports share one path: record,
    /// then treat a resulting job failure like any transport failure.
    async fn on_cold_chain(
        &self,
        job_id: JobId,
        observation: Observation,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let request_id = self.job_request(job_id).await?;
        let (ctx, reach) = self.prepare(request_id).await?;
        let mut outbox = Outbox::default();
        let result: Result<EventOutcome> = async {
            let mut ctx = ctx.lock().await;
            let assessment = match observation {
                Observation::Reading {
                    celsius,
                    recorded_at,
                } => {
                    self.transport
                        .record_temperature(job_id, celsius, recorded_at)
                        .await?
                }
                Observation::Issue(issue) => self.transport.report_issue(job_id, issue).await?,
            };
            if !assessment.failed {
                return Ok(EventOutcome::Applied);
            }
            let reason = assessment
                .raised
                .iter()
                .find(|issue| self.config.cold_chain.should_fail(issue))
                .map(|issue| issue.description.clone());
            self.transport_aborted(
                &mut ctx,
                request_id,
                &assessment.job,
                reason,
                &reach,
                now,
                &mut outbox,
            )
            .await
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    async fn complete_bank_delivery(
        &self,
        ctx: &mut RequestContext,
        request_id: RequestId,
        job: &TransportJob,
        reach: &Reach,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<EventOutcome> {
        let commitment = self.job_commitment(request_id, job).await?;
        if !commitment.is_open() {
            // Superseded while on the road; the units go back to their bank.
            self.inventory.release_held(job.unit_ids(), request_id)?;
            tracing::warn!(
                commitment_id = %commitment.id,
                "delivery for closed commitment, units returned"
            );
            return Ok(EventOutcome::ignored("commitment no longer open"));
        }

        if let Err(error) = self.inventory.issue(job.unit_ids(), request_id, now) {
            let reason = match error {
                InventoryError::ReservationMismatch { .. } => FailureReason::ReservationMismatch,
                _ => FailureReason::ReservationExpired,
            };
            tracing::error!(
                commitment_id = %commitment.id,
                %error,
                "delivered units could not be issued"
            );
            self.inventory.release_held(job.unit_ids(), request_id)?;
            if let CommitmentKind::BankReservation { bank_id, .. } = &commitment.kind {
                ctx.failed_banks.insert(bank_id.clone());
            }
            self.record_failure(request_id, &commitment, reason, now)
                .await?;
            self.run_ladder(ctx, request_id, reach, now, outbox).await?;
            self.enforce_deadline(request_id, now, outbox).await?;
            return Ok(EventOutcome::Applied);
        }

        let units = job.unit_ids().len() as u32;
        let reference = job
            .job_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        let delivered = self
            .requests
            .record_delivery(RecordDelivery::new(
                request_id,
                commitment.id,
                units,
                reference,
                now,
            ))
            .await
            .map_err(|error| log_defect(request_id, error))?;
        self.after_delivery(request_id, commitment.id, &delivered, now, outbox);
        self.enforce_deadline(request_id, now, outbox).await?;
        Ok(EventOutcome::Applied)
    }

    #[allow(clippy::too_many_arguments)]
    async fn transport_aborted(
        &self,
        ctx: &mut RequestContext,
        request_id: RequestId,
        job: &TransportJob,
        reason: Option<String>,
        reach: &Reach,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<EventOutcome> {
        let commitment = self.job_commitment(request_id, job).await?;
        let breach = job.has_cold_chain_breach();
        if breach {
            self.inventory.discard(job.unit_ids())?;
            tracing::warn!(job_id = ?job.job_id(), "cold chain breached, units discarded");
        } else {
            self.inventory.release_held(job.unit_ids(), request_id)?;
        }

        if !commitment.is_open() {
            return Ok(EventOutcome::ignored("commitment already closed"));
        }

        if let CommitmentKind::BankReservation { bank_id, .. } = &commitment.kind {
            ctx.failed_banks.insert(bank_id.clone());
        }
        let failure = if breach {
            FailureReason::ColdChainBreach
        } else {
            FailureReason::TransportFailed(
                reason.unwrap_or_else(|| job.status().as_str().to_string()),
            )
        };
        self.record_failure(request_id, &commitment, failure, now)
            .await?;
        self.run_ladder(ctx, request_id, reach, now, outbox).await?;
        self.enforce_deadline(request_id, now, outbox).await?;
        Ok(EventOutcome::Applied)
    }

    async fn on_reservation_expired(
        &self,
        request_id: RequestId,
        expired: &[UnitId],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (ctx, reach) = self.prepare(request_id).await?;
        let mut outbox = Outbox::default();
        let result: Result<()> = async {
            let mut ctx = ctx.lock().await;
            let request = self.load(request_id).await?;
            let affected: Vec<Commitment> = request
                .open_commitments()
                .filter(|c| match &c.kind {
                    CommitmentKind::BankReservation { unit_ids, .. } => {
                        unit_ids.iter().any(|u| expired.contains(u))
                    }
                    _ => false,
                })
                .cloned()
                .collect();

            for commitment in &affected {
                if let CommitmentKind::BankReservation {
                    unit_ids, job_id, ..
                } = &commitment.kind
                {
                    if let Some(job) = self.transport.get(*job_id).await? {
                        if job.status().can_cancel() {
                            self.transport
                                .cancel(*job_id, "reservation expired", now)
                                .await?;
                        }
                    }
                    self.inventory.release_held(unit_ids, request_id)?;
                }
                self.record_failure(request_id, commitment, FailureReason::ReservationExpired, now)
                    .await?;
            }

            if !affected.is_empty() {
                self.run_ladder(&mut ctx, request_id, &reach, now, &mut outbox)
                    .await?;
                self.enforce_deadline(request_id, now, &mut outbox).await?;
            }
            Ok(())
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    // ---------------------------------------------------------------------
    // Donors and donations
    // ---------------------------------------------------------------------

    async fn on_donor_accepted(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let ctx = self.context(request_id);
        let mut outbox = Outbox::default();
        let result: Result<EventOutcome> = async {
            let _ctx = ctx.lock().await;
            match self
                .requests
                .accept_donor(request_id, commitment_id, donor_id.clone(), now)
                .await
            {
                Ok(result) if result.is_noop() => {
                    let open = result
                        .aggregate
                        .commitment(commitment_id)
                        .is_some_and(Commitment::is_open);
                    if open {
                        return Ok(EventOutcome::ignored("donor already accepted"));
                    }
                    outbox.push(Notification::new(
                        Recipient::Donor(donor_id),
                        NotificationKind::DonationNoLongerNeeded,
                        request_id,
                    ));
                    Ok(EventOutcome::ignored("donor pledge closed"))
                }
                Ok(_) => {
                    tracing::info!(%donor_id, "donor accepted");
                    Ok(EventOutcome::Applied)
                }
                Err(DomainError::Request(RequestError::PledgeFull { .. })) => {
                    outbox.push(Notification::new(
                        Recipient::Donor(donor_id),
                        NotificationKind::MobilizationClosed,
                        request_id,
                    ));
                    Ok(EventOutcome::ignored("donor pledge already full"))
                }
                Err(error) => Err(error.into()),
            }
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    async fn on_donor_withdrew(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let (ctx, reach) = self.prepare(request_id).await?;
        let mut outbox = Outbox::default();
        let result: Result<EventOutcome> = async {
            let mut ctx = ctx.lock().await;
            let released = self
                .requests
                .release_donor(request_id, commitment_id, donor_id.clone(), now)
                .await?;
            if released.is_noop() {
                return Ok(EventOutcome::ignored("donor held no slot"));
            }
            tracing::warn!(%donor_id, "donor withdrew");

            let commitment = find_commitment(&released.aggregate, request_id, commitment_id)?;
            if self.donor_slots_reclaimable(&released.aggregate, &commitment, now) {
                self.reclaim_donor_slots(
                    &mut ctx,
                    request_id,
                    &commitment,
                    FailureReason::DonorWithdrew,
                    now,
                    &mut outbox,
                )
                .await?;
                self.run_ladder(&mut ctx, request_id, &reach, now, &mut outbox)
                    .await?;
            }
            Ok(EventOutcome::Applied)
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    async fn on_donation_collected(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        bank_id: BloodBankId,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let ctx = self.context(request_id);
        let mut outbox = Outbox::default();
        let result: Result<EventOutcome> = async {
            let _ctx = ctx.lock().await;
            let request = self.load(request_id).await?;
            let commitment = find_commitment(&request, request_id, commitment_id)?;
            if commitment.channel() != Channel::Donor {
                return Err(OrchestratorError::InvalidEvent(format!(
                    "commitment {commitment_id} is not a donor pledge"
                )));
            }

            let mut counted = false;
            if commitment.is_open() && !request.is_terminal() {
                counted = commitment.accepted_donors.contains(&donor_id);
                if !counted {
                    match self
                        .requests
                        .accept_donor(request_id, commitment_id, donor_id.clone(), now)
                        .await
                    {
                        Ok(_) => counted = true,
                        Err(DomainError::Request(RequestError::PledgeFull { .. })) => {}
                        Err(error) => return Err(error.into()),
                    }
                }
            }

            let donation_id = self.testing.collect(Collection {
                donor_id: donor_id.clone(),
                bank_id,
                blood_group: request.blood_group(),
                component: request.component(),
                collected_at: now,
                target: counted.then_some(DonationTarget {
                    request_id,
                    commitment_id,
                }),
            });
            if !counted {
                outbox.push(
                    Notification::new(
                        Recipient::Donor(donor_id),
                        NotificationKind::RequestAlreadySatisfied,
                        request_id,
                    )
                    .with_payload(json!({ "donation_id": donation_id })),
                );
            }
            Ok(EventOutcome::DonationRegistered { donation_id })
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    /// Routes a screened donation: cleared units go to their pledge or to
    /// general stock, rejected ones shrink their pledge.
    async fn on_screened(
        &self,
        donation_id: DonationId,
        outcome: TestOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let donation = self
            .testing
            .donation(donation_id)
            .ok_or(OrchestratorError::DonationNotFound(donation_id))?;

        match (outcome, donation.target) {
            (TestOutcome::Pending, _) => Ok(()),
            (TestOutcome::Passed, Some(target)) => {
                self.deliver_donation(target, donation, now).await
            }
            (TestOutcome::Passed, None) => {
                self.stock_donation(donation.unit, now).await
            }
            (TestOutcome::Failed { .. }, Some(target)) => {
                self.reject_donation(target, &donation, now).await
            }
            (TestOutcome::Failed { .. }, None) => Ok(()),
        }
    }

    async fn deliver_donation(
        &self,
        target: DonationTarget,
        donation: Donation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let request_id = target.request_id;
        let ctx = self.context(request_id);
        let mut outbox = Outbox::default();
        let result: Result<Option<BloodUnit>> = async {
            let _ctx = ctx.lock().await;
            let request = self.load(request_id).await?;
            let open = !request.is_terminal()
                && request
                    .commitment(target.commitment_id)
                    .is_some_and(Commitment::is_open);
            if !open {
                outbox.push(Notification::new(
                    Recipient::Donor(donation.donor_id.clone()),
                    NotificationKind::RequestAlreadySatisfied,
                    request_id,
                ));
                return Ok(Some(donation.unit));
            }

            let unit_id = self
                .inventory
                .admit_reserved(donation.unit, request_id, now)?;
            self.inventory.issue(&[unit_id], request_id, now)?;
            let delivered = self
                .requests
                .record_delivery(RecordDelivery::new(
                    request_id,
                    target.commitment_id,
                    1,
                    donation.id.to_string(),
                    now,
                ))
                .await
                .map_err(|error| log_defect(request_id, error))?;
            tracing::info!(donation_id = %donation.id, "donated unit delivered");
            self.after_delivery(request_id, target.commitment_id, &delivered, now, &mut outbox);
            self.enforce_deadline(request_id, now, &mut outbox).await?;
            Ok(None)
        }
        .await;
        self.dispatch(&mut outbox).await;

        // A pledge superseded while the unit was in testing: the unit joins
        // general stock instead.
        if let Some(unit) = result? {
            self.stock_donation(unit, now).await?;
        }
        Ok(())
    }

    async fn stock_donation(&self, unit: BloodUnit, now: DateTime<Utc>) -> Result<()> {
        let (bank_id, group, component) = (unit.bank_id.clone(), unit.blood_group, unit.component);
        self.inventory.admit(unit, now)?;
        self.offer_stock(&bank_id, group, component, now).await
    }

    async fn reject_donation(
        &self,
        target: DonationTarget,
        donation: &Donation,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let request_id = target.request_id;
        let (ctx, reach) = self.prepare(request_id).await?;
        let mut outbox = Outbox::default();
        let result: Result<()> = async {
            let mut ctx = ctx.lock().await;
            let released = self
                .requests
                .release_donor(request_id, target.commitment_id, donation.donor_id.clone(), now)
                .await?;
            let commitment =
                find_commitment(&released.aggregate, request_id, target.commitment_id)?;
            // While donors may still respond, the freed slot stays open for them.
            if !self.donor_slots_reclaimable(&released.aggregate, &commitment, now) {
                return Ok(());
            }
            self.reclaim_donor_slots(
                &mut ctx,
                request_id,
                &commitment,
                FailureReason::DonationRejected,
                now,
                &mut outbox,
            )
            .await?;
            self.run_ladder(&mut ctx, request_id, &reach, now, &mut outbox)
                .await?;
            Ok(())
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    // ---------------------------------------------------------------------
    // Institutions
    // ---------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn on_institution_delivered(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        institution_id: InstitutionId,
        units: u32,
        reference: String,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let ctx = self.context(request_id);
        let mut outbox = Outbox::default();
        let result: Result<EventOutcome> = async {
            let _ctx = ctx.lock().await;
            let request = self.load(request_id).await?;
            let commitment =
                institution_pledge(&request, request_id, commitment_id, &institution_id)?;
            if !commitment.is_open() {
                return Ok(EventOutcome::ignored("institution pledge closed"));
            }

            let accepted = units.min(commitment.outstanding());
            if accepted < units {
                tracing::warn!(
                    %institution_id,
                    units,
                    accepted,
                    "institution delivered surplus units"
                );
            }
            if accepted == 0 {
                return Ok(EventOutcome::ignored("nothing outstanding"));
            }

            let delivered = self
                .requests
                .record_delivery(RecordDelivery::new(
                    request_id,
                    commitment_id,
                    accepted,
                    format!("{institution_id}:{reference}"),
                    now,
                ))
                .await
                .map_err(|error| log_defect(request_id, error))?;
            if delivered.is_noop() {
                return Ok(EventOutcome::ignored("delivery already recorded"));
            }
            self.after_delivery(request_id, commitment_id, &delivered, now, &mut outbox);
            self.enforce_deadline(request_id, now, &mut outbox).await?;
            Ok(EventOutcome::Applied)
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    async fn on_institution_declined(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        institution_id: InstitutionId,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let (ctx, reach) = self.prepare(request_id).await?;
        let mut outbox = Outbox::default();
        let result: Result<EventOutcome> = async {
            let mut ctx = ctx.lock().await;
            let request = self.load(request_id).await?;
            let commitment =
                institution_pledge(&request, request_id, commitment_id, &institution_id)?;
            if !commitment.is_open() {
                return Ok(EventOutcome::ignored("institution pledge closed"));
            }

            let declined = ctx.declined.entry(commitment_id).or_default();
            declined.insert(institution_id.clone());
            let all_declined = match &commitment.kind {
                CommitmentKind::InstitutionPledge { institutions, .. } => {
                    institutions.iter().all(|i| declined.contains(i))
                }
                _ => false,
            };
            tracing::warn!(%institution_id, all_declined, "institution declined");
            if !all_declined {
                return Ok(EventOutcome::Applied);
            }

            self.settle_institution_pledge(
                request_id,
                &commitment,
                FailureReason::InstitutionDeclined,
                now,
            )
            .await?;
            self.run_ladder(&mut ctx, request_id, &reach, now, &mut outbox)
                .await?;
            Ok(EventOutcome::Applied)
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    /// Closes an under-delivered institution pledge at what it delivered.
    async fn settle_institution_pledge(
        &self,
        request_id: RequestId,
        commitment: &Commitment,
        failure: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if commitment.units_delivered == 0 {
            self.record_failure(request_id, commitment, failure, now)
                .await
        } else {
            self.requests
                .reduce_commitment(request_id, commitment.id, commitment.units_delivered, now)
                .await?;
            record_closed(Channel::Institution, "delivered");
            Ok(())
        }
    }

    // ---------------------------------------------------------------------
    // Stock and timers
    // ---------------------------------------------------------------------

    /// Offers stock at `bank_id` to open requests that can reach it, most
    /// urgent first. Unaccepted donor slots make way for it.
    async fn offer_stock(
        &self,
        bank_id: &BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut waiting = Vec::new();
        for request_id in self.context_ids() {
            let Some(request) = self.requests.get(request_id).await? else {
                continue;
            };
            if request.is_terminal()
                || request.deadline() <= now
                || request.blood_group() != blood_group
                || request.component() != component
            {
                continue;
            }
            waiting.push((request_id, request));
        }
        waiting.sort_by_key(|(_, r)| (Reverse(r.urgency()), r.deadline()));

        for (request_id, request) in waiting {
            if self
                .inventory
                .available_count(bank_id, blood_group, component, now)
                == 0
            {
                break;
            }
            let reach = self.reach(&request).await?;
            if !reach.includes_bank(bank_id) {
                continue;
            }

            let ctx = self.context(request_id);
            let mut outbox = Outbox::default();
            let result = {
                let mut ctx = ctx.lock().await;
                self.take_stock(&mut ctx, request_id, bank_id, &reach, now, &mut outbox)
                    .await
            };
            self.dispatch(&mut outbox).await;
            if let Err(error) = result {
                tracing::error!(%request_id, %error, "offering stock failed");
            }
        }
        Ok(())
    }

    async fn take_stock(
        &self,
        ctx: &mut RequestContext,
        request_id: RequestId,
        bank_id: &BloodBankId,
        reach: &Reach,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let request = self.load(request_id).await?;
        if request.is_terminal() {
            return Ok(());
        }

        let available = self.inventory.available_count(
            bank_id,
            request.blood_group(),
            request.component(),
            now,
        );
        let mut spare = available.saturating_sub(request.shortfall());
        let pledges: Vec<Commitment> = request
            .open_commitments()
            .filter(|c| c.unaccepted_slots() > 0)
            .cloned()
            .collect();
        for pledge in &pledges {
            if spare == 0 {
                break;
            }
            let slots = pledge.unaccepted_slots().min(spare);
            self.displace_donor_slots(request_id, pledge, slots, now, outbox)
                .await?;
            spare -= slots;
        }

        self.run_ladder(ctx, request_id, reach, now, outbox).await?;
        Ok(())
    }

    async fn on_timer(&self, timer: TimerKind, now: DateTime<Utc>) -> Result<()> {
        let request_id = timer.request_id();
        let (ctx, reach) = self.prepare(request_id).await?;
        let mut outbox = Outbox::default();
        let result: Result<()> = async {
            let mut ctx = ctx.lock().await;
            let request = self.load(request_id).await?;
            if request.is_terminal() {
                return Ok(());
            }

            match timer {
                TimerKind::DonorResponseDue { commitment_id, .. } => {
                    let commitment = find_commitment(&request, request_id, commitment_id)?;
                    self.reclaim_donor_slots(
                        &mut ctx,
                        request_id,
                        &commitment,
                        FailureReason::DonorsUnresponsive,
                        now,
                        &mut outbox,
                    )
                    .await?;
                }
                TimerKind::InstitutionResponseDue { commitment_id, .. } => {
                    let commitment = find_commitment(&request, request_id, commitment_id)?;
                    if commitment.is_open() {
                        self.settle_institution_pledge(
                            request_id,
                            &commitment,
                            FailureReason::InstitutionUnderDelivered,
                            now,
                        )
                        .await?;
                        if let CommitmentKind::InstitutionPledge { institutions, .. } =
                            &commitment.kind
                        {
                            for institution in institutions {
                                outbox.push(Notification::new(
                                    Recipient::Institution(institution.clone()),
                                    NotificationKind::EscalationWithdrawn,
                                    request_id,
                                ));
                            }
                        }
                    }
                }
                TimerKind::EscalationDue { .. } => {
                    let pledges: Vec<Commitment> = request
                        .open_commitments()
                        .filter(|c| c.unaccepted_slots() > 0)
                        .cloned()
                        .collect();
                    for pledge in &pledges {
                        self.reclaim_donor_slots(
                            &mut ctx,
                            request_id,
                            pledge,
                            FailureReason::DonorsUnresponsive,
                            now,
                            &mut outbox,
                        )
                        .await?;
                    }
                }
                TimerKind::RequestDeadline { .. } => {
                    return self.enforce_deadline(request_id, now, &mut outbox).await;
                }
            }

            self.run_ladder(&mut ctx, request_id, &reach, now, &mut outbox)
                .await?;
            Ok(())
        }
        .await;
        self.dispatch(&mut outbox).await;
        result
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    async fn load(&self, request_id: RequestId) -> Result<BloodRequest> {
        self.requests
            .get(request_id)
            .await?
            .ok_or(OrchestratorError::RequestNotFound(request_id))
    }

    async fn job_request(&self, job_id: JobId) -> Result<RequestId> {
        self.transport
            .get(job_id)
            .await?
            .and_then(|job| job.request_id())
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    async fn job_commitment(
        &self,
        request_id: RequestId,
        job: &TransportJob,
    ) -> Result<Commitment> {
        let commitment_id = job.commitment_id().ok_or(OrchestratorError::InvalidEvent(
            "transport job without commitment".to_string(),
        ))?;
        let request = self.load(request_id).await?;
        find_commitment(&request, request_id, commitment_id)
    }

    /// Looks up who can serve a request.
    async fn reach(&self, request: &BloodRequest) -> Result<Reach> {
        let location = request.location();
        let radius = self.config.search_radius_km;

        let banks = self
            .directory
            .nearby(location, radius, FacilityKind::BloodBank)
            .await?;
        let donors = self
            .directory
            .nearby(location, radius, FacilityKind::Donor)
            .await?
            .into_iter()
            .filter(|d| d.facility.blood_group == Some(request.blood_group()))
            .map(|d| DonorId::new(d.facility.id))
            .collect();
        let institutions = self
            .directory
            .nearby(location, radius, FacilityKind::Institution)
            .await?
            .into_iter()
            .map(|i| InstitutionId::new(i.facility.id))
            .collect();

        Ok(Reach {
            banks,
            donors,
            institutions,
        })
    }

    async fn prepare(&self, request_id: RequestId) -> Result<(Arc<Mutex<RequestContext>>, Reach)> {
        let request = self.load(request_id).await?;
        let reach = self.reach(&request).await?;
        Ok((self.context(request_id), reach))
    }

    /// Registers a freshly submitted request as open.
    fn track(&self, request_id: RequestId) -> Arc<Mutex<RequestContext>> {
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(contexts.entry(request_id).or_default())
    }

    /// Context of an open request. Retired and unknown requests get a
    /// detached one, so late events never re-register them.
    fn context(&self, request_id: RequestId) -> Arc<Mutex<RequestContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request_id)
            .map(Arc::clone)
            .unwrap_or_default()
    }

    /// Drops the timers and the context of a request that reached a
    /// terminal status.
    fn retire(&self, request_id: RequestId) {
        self.timers().cancel_request(request_id);
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
    }

    fn context_ids(&self) -> Vec<RequestId> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    fn timers(&self) -> MutexGuard<'_, TimerQueue> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, outbox: &mut Outbox) {
        for notification in outbox.drain() {
            let kind = notification.kind.as_str();
            if let Err(error) = self.notifier.notify(notification).await {
                tracing::warn!(kind, %error, "notification dispatch failed");
            }
        }
    }
}

fn has_channel(request: &BloodRequest, channel: Channel) -> bool {
    request.commitments().iter().any(|c| c.channel() == channel)
}

fn donor_window_closed(commitment: &Commitment, now: DateTime<Utc>) -> bool {
    match &commitment.kind {
        CommitmentKind::DonorPledge { respond_by, .. } => {
            commitment.is_open() && now >= *respond_by
        }
        _ => false,
    }
}

fn find_commitment(
    request: &BloodRequest,
    request_id: RequestId,
    commitment_id: CommitmentId,
) -> Result<Commitment> {
    request
        .commitment(commitment_id)
        .cloned()
        .ok_or(OrchestratorError::CommitmentNotFound {
            request_id,
            commitment_id,
        })
}

fn institution_pledge(
    request: &BloodRequest,
    request_id: RequestId,
    commitment_id: CommitmentId,
    institution_id: &InstitutionId,
) -> Result<Commitment> {
    let commitment = find_commitment(request, request_id, commitment_id)?;
    match &commitment.kind {
        CommitmentKind::InstitutionPledge { institutions, .. }
            if institutions.contains(institution_id) =>
        {
            Ok(commitment)
        }
        _ => Err(OrchestratorError::InvalidEvent(format!(
            "{institution_id} holds no part of commitment {commitment_id}"
        ))),
    }
}

fn record_closed(channel: Channel, outcome: &'static str) {
    metrics::counter!(
        "commitments_closed_total",
        "channel" => channel.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// A delivery against a closed request means reconciliation went wrong.
fn log_defect(request_id: RequestId, error: DomainError) -> OrchestratorError {
    if let DomainError::Request(RequestError::CommitmentOnClosedRequest { .. }) = &error {
        tracing::error!(%request_id, %error, "delivery on closed request");
    }
    error.into()
}
