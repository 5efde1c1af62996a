//! Transport coordinator: schedules jobs and watches their cold chain.

use chrono::{DateTime, Utc};
use common::JobId;
use event_store::EventStore;

use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{
    ColdChainPolicy, ScheduleTransport, TemperatureReading, TransportEvent, TransportIssue,
    TransportJob, TransportStatus,
};

/// Result of feeding a temperature reading or incident into a job.
#[derive(Debug, Clone)]
pub struct ColdChainAssessment {
    pub job: TransportJob,
    /// Issues raised by this observation.
    pub raised: Vec<TransportIssue>,
    /// Whether the job was moved to `Failed` because of them.
    pub failed: bool,
}

pub struct TransportCoordinator<S: EventStore> {
    handler: CommandHandler<S, TransportJob>,
    policy: ColdChainPolicy,
}

impl<S: EventStore> TransportCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self::with_policy(store, ColdChainPolicy::default())
    }

    pub fn with_policy(store: S, policy: ColdChainPolicy) -> Self {
        Self {
            handler: CommandHandler::new(store),
            policy,
        }
    }

    pub fn policy(&self) -> &ColdChainPolicy {
        &self.policy
    }

    #[tracing::instrument(
        skip(self, cmd),
        fields(commitment_id = %cmd.commitment_id, source = %cmd.source)
    )]
    pub async fn schedule(
        &self,
        job_id: JobId,
        cmd: ScheduleTransport,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<TransportJob>, DomainError> {
        let result = self
            .handler
            .execute(job_id.into(), |job| job.schedule(job_id, cmd, now))
            .await?;
        metrics::counter!("transport_jobs_scheduled_total").increment(1);
        tracing::info!(units = result.aggregate.unit_ids().len(), "transport scheduled");
        Ok(result)
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        job_id: JobId,
        to: TransportStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<TransportJob>, DomainError> {
        let result = self
            .handler
            .execute(job_id.into(), |job| job.advance(to, reason, now))
            .await?;
        if !result.is_noop() {
            tracing::debug!(status = %to, "transport status changed");
        }
        Ok(result)
    }

    /// Cancels a job that has not yet left the bank.
    pub async fn cancel(
        &self,
        job_id: JobId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<TransportJob>, DomainError> {
        self.update_status(job_id, TransportStatus::Cancelled, Some(reason.into()), now)
            .await
    }

    /// Logs a reading. An out-of-range reading only raises an issue; the job
    /// fails when an issue reaches the policy's failure severity.
    #[tracing::instrument(skip(self))]
    pub async fn record_temperature(
        &self,
        job_id: JobId,
        celsius: f64,
        recorded_at: DateTime<Utc>,
    ) -> Result<ColdChainAssessment, DomainError> {
        let reading = TemperatureReading {
            celsius,
            recorded_at,
        };
        let policy = self.policy;
        let result = self
            .handler
            .execute(job_id.into(), |job| job.record_temperature(reading, &policy))
            .await?;
        let raised = raised_issues(&result.events);
        if !raised.is_empty() {
            metrics::counter!("cold_chain_excursions_total").increment(raised.len() as u64);
            tracing::warn!(celsius, "temperature excursion");
        }
        self.assess(job_id, result.aggregate, raised, recorded_at).await
    }

    #[tracing::instrument(skip(self, issue), fields(severity = %issue.severity.as_str()))]
    pub async fn report_issue(
        &self,
        job_id: JobId,
        issue: TransportIssue,
    ) -> Result<ColdChainAssessment, DomainError> {
        let at = issue.reported_at;
        let result = self
            .handler
            .execute(job_id.into(), |job| job.report_issue(issue))
            .await?;
        let raised = raised_issues(&result.events);
        self.assess(job_id, result.aggregate, raised, at).await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<TransportJob>, DomainError> {
        self.handler.load_existing(job_id.into()).await
    }

    async fn assess(
        &self,
        job_id: JobId,
        job: TransportJob,
        raised: Vec<TransportIssue>,
        at: DateTime<Utc>,
    ) -> Result<ColdChainAssessment, DomainError> {
        let Some(fatal) = raised.iter().find(|i| self.policy.should_fail(i)) else {
            return Ok(ColdChainAssessment {
                job,
                raised,
                failed: false,
            });
        };

        // A job still at the bank cannot fail in transit; it is cancelled instead.
        let to = if job.status() == TransportStatus::Scheduled {
            TransportStatus::Cancelled
        } else {
            TransportStatus::Failed
        };
        if !job.status().can_transition_to(to) {
            return Ok(ColdChainAssessment {
                job,
                raised,
                failed: false,
            });
        }

        let reason = fatal.description.clone();
        let result = self.update_status(job_id, to, Some(reason), at).await?;
        tracing::warn!(status = %to, "transport aborted on cold chain issue");
        Ok(ColdChainAssessment {
            job: result.aggregate,
            raised,
            failed: true,
        })
    }
}

fn raised_issues(events: &[TransportEvent]) -> Vec<TransportIssue> {
    events
        .iter()
        .filter_map(|event| match event {
            TransportEvent::IssueReported(data) => Some(data.issue.clone()),
            _ => None,
        })
        .collect()
}
