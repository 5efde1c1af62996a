//! Per-request orchestration state kept beside the request ledger.

use std::collections::{BTreeSet, HashMap};

use common::{BloodBankId, CommitmentId, InstitutionId};

use crate::services::Notification;

/// State owned by one request's orchestration. Always accessed under that
/// request's lock.
#[derive(Debug, Default)]
pub(crate) struct RequestContext {
    /// Banks whose commitment to this request failed. Retried last.
    pub failed_banks: BTreeSet<BloodBankId>,
    /// A failed or shrunk donor round pulled institutional escalation forward.
    pub escalate_early: bool,
    /// Institutions that declined, per pledge.
    pub declined: HashMap<CommitmentId, BTreeSet<InstitutionId>>,
}

/// Notifications decided under a request lock, sent once it is released.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pending: Vec<Notification>,
}

impl Outbox {
    pub fn push(&mut self, notification: Notification) {
        self.pending.push(notification);
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Notification> {
        self.pending.drain(..)
    }
}
