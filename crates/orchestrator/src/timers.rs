//! Deadline timers, fed into the same path as external events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::CommitmentId;
use domain::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// A donor pledge's response window closes.
    DonorResponseDue {
        request_id: RequestId,
        commitment_id: CommitmentId,
    },
    /// An institution pledge's sub-deadline passes.
    InstitutionResponseDue {
        request_id: RequestId,
        commitment_id: CommitmentId,
    },
    /// Institutional escalation becomes due.
    EscalationDue { request_id: RequestId },
    /// The request's own deadline.
    RequestDeadline { request_id: RequestId },
}

impl TimerKind {
    pub fn request_id(&self) -> RequestId {
        match self {
            TimerKind::DonorResponseDue { request_id, .. }
            | TimerKind::InstitutionResponseDue { request_id, .. }
            | TimerKind::EscalationDue { request_id }
            | TimerKind::RequestDeadline { request_id } => *request_id,
        }
    }
}

/// Timers ordered by due time. Scheduling the same timer twice keeps the
/// earlier due time.
#[derive(Debug, Default)]
pub struct TimerQueue {
    due: BTreeSet<(DateTime<Utc>, TimerKind)>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: DateTime<Utc>, kind: TimerKind) {
        if let Some(existing) = self.due_time(&kind) {
            if existing <= at {
                return;
            }
            self.due.remove(&(existing, kind));
        }
        self.due.insert((at, kind));
    }

    /// Removes and returns every timer due at or before `now`, oldest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, TimerKind)> {
        let mut fired = Vec::new();
        while self.due.first().is_some_and(|(at, _)| *at <= now) {
            if let Some(entry) = self.due.pop_first() {
                fired.push(entry);
            }
        }
        fired
    }

    /// Drops every timer belonging to a request.
    pub fn cancel_request(&mut self, request_id: RequestId) {
        self.due.retain(|(_, kind)| kind.request_id() != request_id);
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.due.first().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    fn due_time(&self, kind: &TimerKind) -> Option<DateTime<Utc>> {
        self.due
            .iter()
            .find(|(_, k)| k == kind)
            .map(|(at, _)| *at)
    }
}
