//! Transport job aggregate.

use chrono::{DateTime, Utc};
use common::{AggregateId, BloodBankId, CommitmentId, HospitalId, JobId, UnitId};
use event_store::Version;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::request::RequestId;

use super::{
    ColdChainPolicy, IssueKind, ScheduleTransport, Severity, TemperatureReading, TransportError,
    TransportEvent, TransportIssue, TransportStatus,
    events::{IssueReportedData, JobScheduledData, StatusChangedData, TemperatureRecordedData},
};

/// Physical movement of reserved units from a bank to a hospital.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportJob {
    id: Option<AggregateId>,

    #[serde(default)]
    version: Version,

    job_id: Option<JobId>,
    request_id: Option<RequestId>,
    commitment_id: Option<CommitmentId>,
    source: Option<BloodBankId>,
    destination: Option<HospitalId>,
    unit_ids: Vec<UnitId>,
    status: TransportStatus,
    temperature_log: Vec<TemperatureReading>,
    issues: Vec<TransportIssue>,
    excursion_since: Option<DateTime<Utc>>,
    excursion_escalated: bool,
    scheduled_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl Aggregate for TransportJob {
    type Event = TransportEvent;
    type Error = TransportError;

    fn aggregate_type() -> &'static str {
        "TransportJob"
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
            TransportEvent::JobScheduled(data) => {
                self.id = Some(data.job_id.into());
                self.job_id = Some(data.job_id);
                self.request_id = Some(data.request_id);
                self.commitment_id = Some(data.commitment_id);
                self.source = Some(data.source);
                self.destination = Some(data.destination);
                self.unit_ids = data.unit_ids;
                self.status = TransportStatus::Scheduled;
                self.scheduled_at = Some(data.scheduled_at);
                self.updated_at = Some(data.scheduled_at);
            }
            TransportEvent::StatusChanged(data) => {
                self.status = data.to;
                self.updated_at = Some(data.at);
            }
            TransportEvent::TemperatureRecorded(data) => {
                if data.in_range {
                    self.excursion_since = None;
                    self.excursion_escalated = false;
                } else if self.excursion_since.is_none() {
                    self.excursion_since = Some(data.reading.recorded_at);
                }
                self.temperature_log.push(data.reading);
            }
            TransportEvent::IssueReported(data) => {
                if data.issue.is_cold_chain() && data.issue.severity == Severity::Critical {
                    self.excursion_escalated = true;
                }
                self.issues.push(data.issue);
            }
        }
    }
}

// Query methods
impl TransportJob {
    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    pub fn commitment_id(&self) -> Option<CommitmentId> {
        self.commitment_id
    }

    pub fn source(&self) -> Option<&BloodBankId> {
        self.source.as_ref()
    }

    pub fn destination(&self) -> Option<&HospitalId> {
        self.destination.as_ref()
    }

    pub fn unit_ids(&self) -> &[UnitId] {
        &self.unit_ids
    }

    pub fn status(&self) -> TransportStatus {
        self.status
    }

    pub fn temperature_log(&self) -> &[TemperatureReading] {
        &self.temperature_log
    }

    pub fn issues(&self) -> &[TransportIssue] {
        &self.issues
    }

    pub fn excursion_since(&self) -> Option<DateTime<Utc>> {
        self.excursion_since
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// True once a critical temperature excursion has been recorded.
    pub fn has_cold_chain_breach(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.is_cold_chain() && i.severity == Severity::Critical)
    }

    fn current_job_id(&self) -> Result<JobId, TransportError> {
        self.job_id.ok_or(TransportError::NotScheduled)
    }

    fn ensure_open(&self) -> Result<JobId, TransportError> {
        let job_id = self.current_job_id()?;
        if self.status.is_terminal() {
            return Err(TransportError::JobClosed {
                job_id,
                status: self.status,
            });
        }
        Ok(job_id)
    }
}

// Command methods (return events)
impl TransportJob {
    pub fn schedule(
        &self,
        job_id: JobId,
        cmd: ScheduleTransport,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        if self.job_id.is_some() {
            return Err(TransportError::AlreadyScheduled { job_id });
        }
        if cmd.unit_ids.is_empty() {
            return Err(TransportError::NoUnits);
        }

        Ok(vec![TransportEvent::JobScheduled(JobScheduledData {
            job_id,
            request_id: cmd.request_id,
            commitment_id: cmd.commitment_id,
            source: cmd.source,
            destination: cmd.destination,
            unit_ids: cmd.unit_ids,
            scheduled_at: now,
        })])
    }

    /// Moves the job along its lifecycle. Repeating the current status is a
    /// no-op so duplicate carrier reports are harmless.
    pub fn advance(
        &self,
        to: TransportStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        let job_id = self.current_job_id()?;
        if self.status == to {
            return Ok(vec![]);
        }
        if !self.status.can_transition_to(to) {
            return Err(TransportError::InvalidTransition {
                job_id,
                from: self.status,
                to,
            });
        }

        Ok(vec![TransportEvent::StatusChanged(StatusChangedData {
            from: self.status,
            to,
            reason,
            at: now,
        })])
    }

    /// Appends a reading. Leaving the safe range opens an excursion with a
    /// minor issue; an excursion outlasting the policy raises a critical one.
    pub fn record_temperature(
        &self,
        reading: TemperatureReading,
        policy: &ColdChainPolicy,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        self.ensure_open()?;

        let in_range = policy.in_range(reading.celsius);
        let mut events = vec![TransportEvent::TemperatureRecorded(TemperatureRecordedData {
            reading,
            in_range,
        })];

        if !in_range {
            match self.excursion_since {
                None => events.push(issue_event(TransportIssue::new(
                    IssueKind::TemperatureExcursion,
                    Severity::Minor,
                    format!(
                        "{:.1}°C outside {:.1}..{:.1}°C",
                        reading.celsius, policy.min_celsius, policy.max_celsius
                    ),
                    reading.recorded_at,
                ))),
                Some(since)
                    if !self.excursion_escalated
                        && reading.recorded_at - since >= policy.max_excursion =>
                {
                    events.push(issue_event(TransportIssue::new(
                        IssueKind::TemperatureExcursion,
                        Severity::Critical,
                        format!(
                            "excursion lasting {} minutes",
                            (reading.recorded_at - since).num_minutes()
                        ),
                        reading.recorded_at,
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(events)
    }

    pub fn report_issue(
        &self,
        issue: TransportIssue,
    ) -> Result<Vec<TransportEvent>, TransportError> {
        self.ensure_open()?;
        Ok(vec![issue_event(issue)])
    }
}

fn issue_event(issue: TransportIssue) -> TransportEvent {
    TransportEvent::IssueReported(IssueReportedData { issue })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn scheduled(now: DateTime<Utc>) -> TransportJob {
        let mut job = TransportJob::default();
        let events = job
            .schedule(
                JobId::new(),
                ScheduleTransport {
                    request_id: RequestId::new(),
                    commitment_id: CommitmentId::new(),
                    source: BloodBankId::new("BB-1"),
                    destination: HospitalId::new("H-1"),
                    unit_ids: vec![UnitId::new(), UnitId::new()],
                },
                now,
            )
            .unwrap();
        job.apply_events(events);
        job
    }

    fn advance(job: &mut TransportJob, to: TransportStatus, now: DateTime<Utc>) {
        let events = job.advance(to, None, now).unwrap();
        job.apply_events(events);
    }

    fn reading(job: &mut TransportJob, celsius: f64, at: DateTime<Utc>) -> Vec<TransportEvent> {
        let events = job
            .record_temperature(
                TemperatureReading {
                    celsius,
                    recorded_at: at,
                },
                &ColdChainPolicy::default(),
            )
            .unwrap();
        job.apply_events(events.clone());
        events
    }

    fn issues_in(events: &[TransportEvent]) -> Vec<Severity> {
        events
            .iter()
            .filter_map(|e| match e {
                TransportEvent::IssueReported(d) => Some(d.issue.severity),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn schedule_requires_units() {
        let job = TransportJob::default();
        let result = job.schedule(
            JobId::new(),
            ScheduleTransport {
                request_id: RequestId::new(),
                commitment_id: CommitmentId::new(),
                source: BloodBankId::new("BB-1"),
                destination: HospitalId::new("H-1"),
                unit_ids: vec![],
            },
            Utc::now(),
        );
        assert!(matches!(result, Err(TransportError::NoUnits)));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let now = Utc::now();
        let mut job = scheduled(now);
        advance(&mut job, TransportStatus::Dispatched, now);
        advance(&mut job, TransportStatus::EnRoute, now);

        assert!(matches!(
            job.advance(TransportStatus::Cancelled, None, now),
            Err(TransportError::InvalidTransition { .. })
        ));
        assert!(job.advance(TransportStatus::EnRoute, None, now).unwrap().is_empty());
    }

    #[test]
    fn excursion_is_an_issue_not_a_failure() {
        let now = Utc::now();
        let mut job = scheduled(now);
        advance(&mut job, TransportStatus::Dispatched, now);

        let events = reading(&mut job, 14.0, now);

        assert_eq!(issues_in(&events), vec![Severity::Minor]);
        assert_eq!(job.status(), TransportStatus::Dispatched);
        assert_eq!(job.excursion_since(), Some(now));
        assert!(!job.has_cold_chain_breach());
    }

    #[test]
    fn prolonged_excursion_escalates_once() {
        let now = Utc::now();
        let mut job = scheduled(now);
        advance(&mut job, TransportStatus::Dispatched, now);

        reading(&mut job, 14.0, now);
        assert!(issues_in(&reading(&mut job, 13.0, now + Duration::minutes(10))).is_empty());
        let escalated = reading(&mut job, 12.0, now + Duration::minutes(31));
        assert_eq!(issues_in(&escalated), vec![Severity::Critical]);
        assert!(job.has_cold_chain_breach());

        let later = reading(&mut job, 12.0, now + Duration::minutes(45));
        assert!(issues_in(&later).is_empty());
    }

    #[test]
    fn returning_to_range_closes_excursion() {
        let now = Utc::now();
        let mut job = scheduled(now);

        reading(&mut job, 0.0, now);
        reading(&mut job, 4.0, now + Duration::minutes(5));
        assert_eq!(job.excursion_since(), None);

        let events = reading(&mut job, 0.0, now + Duration::minutes(40));
        assert_eq!(issues_in(&events), vec![Severity::Minor]);
        assert_eq!(job.temperature_log().len(), 3);
    }

    #[test]
    fn closed_jobs_reject_readings() {
        let now = Utc::now();
        let mut job = scheduled(now);
        advance(&mut job, TransportStatus::Cancelled, now);

        let result = job.record_temperature(
            TemperatureReading {
                celsius: 4.0,
                recorded_at: now,
            },
            &ColdChainPolicy::default(),
        );
        assert!(matches!(result, Err(TransportError::JobClosed { .. })));
    }
}
