//! Notification dispatch. The orchestrator decides what to send and when;
//! delivery belongs to the adapter.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{BloodBankId, DonorId, HospitalId, InstitutionId};
use domain::RequestId;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Hospital(HospitalId),
    Bank(BloodBankId),
    Donor(DonorId),
    Institution(InstitutionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A donor is asked to come and donate.
    DonorMobilized,
    /// The donor call closed without needing this donor.
    MobilizationClosed,
    /// A donor's pledge is no longer needed.
    DonationNoLongerNeeded,
    /// A donor turned up for a request that is already covered.
    RequestAlreadySatisfied,
    InstitutionEscalated,
    EscalationWithdrawn,
    TransportScheduled,
    RequestFulfilled,
    RequestExpired,
    RequestCancelled,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::DonorMobilized => "donor_mobilized",
            NotificationKind::MobilizationClosed => "mobilization_closed",
            NotificationKind::DonationNoLongerNeeded => "donation_no_longer_needed",
            NotificationKind::RequestAlreadySatisfied => "request_already_satisfied",
            NotificationKind::InstitutionEscalated => "institution_escalated",
            NotificationKind::EscalationWithdrawn => "escalation_withdrawn",
            NotificationKind::TransportScheduled => "transport_scheduled",
            NotificationKind::RequestFulfilled => "request_fulfilled",
            NotificationKind::RequestExpired => "request_expired",
            NotificationKind::RequestCancelled => "request_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub request_id: RequestId,
    pub payload: serde_json::Value,
}

impl Notification {
    pub fn new(recipient: Recipient, kind: NotificationKind, request_id: RequestId) -> Self {
        Self {
            recipient,
            kind,
            request_id,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), OrchestratorError>;
}

/// Records every notification, for tests and the demo server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_to(&self, recipient: &Recipient) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| &n.recipient == recipient)
            .collect()
    }

    pub fn count_of(&self, kind: NotificationKind) -> usize {
        self.sent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), OrchestratorError> {
        self.sent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
        Ok(())
    }
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), OrchestratorError> {
        tracing::info!(
            recipient = ?notification.recipient,
            kind = notification.kind.as_str(),
            request_id = %notification.request_id,
            "notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_notifications_by_recipient() {
        let notifier = InMemoryNotifier::new();
        let request_id = RequestId::new();
        let donor = Recipient::Donor(DonorId::new("D-1"));

        notifier
            .notify(Notification::new(
                donor.clone(),
                NotificationKind::DonorMobilized,
                request_id,
            ))
            .await
            .unwrap();
        notifier
            .notify(Notification::new(
                Recipient::Hospital(HospitalId::new("H-1")),
                NotificationKind::RequestFulfilled,
                request_id,
            ))
            .await
            .unwrap();

        assert_eq!(notifier.sent().len(), 2);
        assert_eq!(notifier.sent_to(&donor).len(), 1);
        assert_eq!(notifier.count_of(NotificationKind::RequestFulfilled), 1);
    }
}
