//! Request ledger: the service API over the blood request aggregate.

use chrono::{DateTime, Utc};
use common::{CommitmentId, DonorId};
use event_store::{EventStore, EventStoreExt};

use crate::aggregate::Aggregate;
use crate::command::{CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{
    BloodRequest, CancelReason, CancelRequest, FailureReason, OpenCommitment, RecordDelivery,
    RequestEvent, RequestId, SubmitRequest,
};

/// Authoritative record of every request's fulfilled count and status.
pub struct RequestLedger<S: EventStore> {
    handler: CommandHandler<S, BloodRequest>,
}

impl<S: EventStore> RequestLedger<S> {
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    pub fn handler(&self) -> &CommandHandler<S, BloodRequest> {
        &self.handler
    }

    #[tracing::instrument(skip(self, cmd), fields(request_id = %cmd.request_id))]
    pub async fn submit(
        &self,
        cmd: SubmitRequest,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        let SubmitRequest {
            request_id,
            spec,
            now,
        } = cmd;

        let result = self
            .handler
            .execute(request_id, |request| request.submit(request_id, spec, now))
            .await?;
        metrics::counter!("fulfillment_requests_total").increment(1);
        tracing::info!(
            units = result.aggregate.units_requested(),
            urgency = %result.aggregate.urgency(),
            "request submitted"
        );
        Ok(result)
    }

    #[tracing::instrument(
        skip(self, cmd),
        fields(request_id = %cmd.request_id, commitment_id = %cmd.commitment_id)
    )]
    pub async fn open_commitment(
        &self,
        cmd: OpenCommitment,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        let OpenCommitment {
            request_id,
            commitment_id,
            kind,
            units,
            now,
        } = cmd;

        self.handler
            .execute(request_id, |request| {
                request.open_commitment(commitment_id, kind, units, now)
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn accept_donor(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        self.handler
            .execute(request_id, |request| {
                request.accept_donor(commitment_id, donor_id, now)
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn release_donor(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        donor_id: DonorId,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        self.handler
            .execute(request_id, |request| {
                request.release_donor(commitment_id, donor_id, now)
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn reduce_commitment(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        to_units: u32,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        self.handler
            .execute(request_id, |request| {
                request.reduce_commitment(commitment_id, to_units, now)
            })
            .await
    }

    /// Applies a delivery. Replays of the same reference change nothing.
    #[tracing::instrument(
        skip(self, cmd),
        fields(request_id = %cmd.request_id, commitment_id = %cmd.commitment_id)
    )]
    pub async fn record_delivery(
        &self,
        cmd: RecordDelivery,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        let RecordDelivery {
            request_id,
            commitment_id,
            units,
            reference,
            now,
        } = cmd;

        let result = self
            .handler
            .execute(request_id, |request| {
                request.record_delivery(commitment_id, units, &reference, now)
            })
            .await?;

        if result
            .events
            .iter()
            .any(|e| matches!(e, RequestEvent::RequestFulfilled(_)))
        {
            metrics::counter!("requests_fulfilled_total").increment(1);
            tracing::info!(
                fulfilled = result.aggregate.fulfilled_units(),
                "request fulfilled"
            );
        }
        Ok(result)
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_commitment(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        self.handler
            .execute(request_id, |request| {
                request.cancel_commitment(commitment_id, reason, now)
            })
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn fail_commitment(
        &self,
        request_id: RequestId,
        commitment_id: CommitmentId,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        self.handler
            .execute(request_id, |request| {
                request.fail_commitment(commitment_id, reason, now)
            })
            .await
    }

    #[tracing::instrument(skip(self, cmd), fields(request_id = %cmd.request_id))]
    pub async fn cancel(
        &self,
        cmd: CancelRequest,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        let CancelRequest {
            request_id,
            reason,
            now,
        } = cmd;

        let result = self
            .handler
            .execute(request_id, |request| request.cancel(reason, now))
            .await?;
        tracing::info!("request cancelled");
        Ok(result)
    }

    #[tracing::instrument(skip(self))]
    pub async fn expire(
        &self,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<CommandResult<BloodRequest>, DomainError> {
        let result = self
            .handler
            .execute(request_id, |request| request.expire(now))
            .await?;
        metrics::counter!("requests_expired_total").increment(1);
        tracing::info!(
            fulfilled = result.aggregate.fulfilled_units(),
            "request expired"
        );
        Ok(result)
    }

    /// Loads a request, `None` if it was never submitted.
    pub async fn get(&self, request_id: RequestId) -> Result<Option<BloodRequest>, DomainError> {
        self.handler.load_existing(request_id).await
    }

    /// Loads every request ever submitted, oldest first.
    pub async fn all(&self) -> Result<Vec<BloodRequest>, DomainError> {
        let ids = self
            .handler
            .store()
            .aggregate_ids(BloodRequest::aggregate_type())
            .await?;
        let mut requests = Vec::with_capacity(ids.len());
        for id in ids {
            requests.push(self.handler.load(id).await?);
        }
        Ok(requests)
    }

    /// Expires every open request whose deadline has passed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>, DomainError> {
        let mut expired = Vec::new();
        for request in self.all().await? {
            let Some(id) = request.id() else { continue };
            if request.status().can_expire() && request.deadline() <= now {
                self.expire(id, now).await?;
                expired.push(id);
            }
        }
        Ok(expired)
    }
}
