//! Testing gate: holds collected donations out of inventory until their
//! infectious-disease panel clears.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use common::{BloodBankId, CommitmentId, DonationId, DonorId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blood::{BloodGroup, Component};
use crate::inventory::{BloodUnit, UnitStatus};
use crate::request::RequestId;

/// Pathogens screened on every donation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pathogen {
    Hiv,
    HepatitisB,
    HepatitisC,
    Syphilis,
    Malaria,
}

impl Pathogen {
    pub const PANEL: [Pathogen; 5] = [
        Pathogen::Hiv,
        Pathogen::HepatitisB,
        Pathogen::HepatitisC,
        Pathogen::Syphilis,
        Pathogen::Malaria,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Negative,
    Positive,
}

/// Aggregate outcome of a donation's panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TestOutcome {
    Pending,
    Passed,
    Failed { pathogen: Pathogen },
}

impl TestOutcome {
    pub fn is_decided(&self) -> bool {
        !matches!(self, TestOutcome::Pending)
    }
}

#[derive(Debug, Error)]
pub enum TestingError {
    #[error("Donation not found: {donation_id}")]
    DonationNotFound { donation_id: DonationId },

    #[error("Donation {donation_id} was already decided")]
    AlreadyDecided { donation_id: DonationId },
}

/// Where a collected donation is headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationTarget {
    pub request_id: RequestId,
    pub commitment_id: CommitmentId,
}

/// Details captured at collection.
#[derive(Debug, Clone)]
pub struct Collection {
    pub donor_id: DonorId,
    pub bank_id: BloodBankId,
    pub blood_group: BloodGroup,
    pub component: Component,
    pub collected_at: DateTime<Utc>,
    pub target: Option<DonationTarget>,
}

/// A collected donation and its test state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Donation {
    pub id: DonationId,
    pub donor_id: DonorId,
    pub unit: BloodUnit,
    pub collected_at: DateTime<Utc>,
    pub target: Option<DonationTarget>,
    pub results: HashMap<Pathogen, TestResult>,
    pub outcome: TestOutcome,
}

impl Donation {
    fn evaluate(&self) -> TestOutcome {
        if let Some((pathogen, _)) = self
            .results
            .iter()
            .find(|(_, result)| **result == TestResult::Positive)
        {
            return TestOutcome::Failed {
                pathogen: *pathogen,
            };
        }
        if Pathogen::PANEL.iter().all(|p| self.results.contains_key(p)) {
            TestOutcome::Passed
        } else {
            TestOutcome::Pending
        }
    }
}

/// Registry of donations awaiting or past testing.
#[derive(Debug, Clone, Default)]
pub struct TestingGate {
    donations: Arc<RwLock<HashMap<DonationId, Donation>>>,
}

impl TestingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly collected donation as awaiting tests.
    #[tracing::instrument(skip(self, collection), fields(donor_id = %collection.donor_id))]
    pub fn collect(&self, collection: Collection) -> DonationId {
        let expires_at = collection.collected_at + collection.component.shelf_life();
        let donation = Donation {
            id: DonationId::new(),
            donor_id: collection.donor_id,
            unit: BloodUnit::collected(
                collection.bank_id,
                collection.blood_group,
                collection.component,
                expires_at,
            ),
            collected_at: collection.collected_at,
            target: collection.target,
            results: HashMap::new(),
            outcome: TestOutcome::Pending,
        };
        let id = donation.id;
        self.donations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, donation);
        tracing::info!(donation_id = %id, "donation collected");
        id
    }

    /// Records one sub-result. A positive result fails the donation at once;
    /// the donation passes when all five are recorded negative.
    #[tracing::instrument(skip(self))]
    pub fn record_result(
        &self,
        donation_id: DonationId,
        pathogen: Pathogen,
        result: TestResult,
    ) -> Result<TestOutcome, TestingError> {
        self.record_panel(donation_id, &[(pathogen, result)])
    }

    /// Records several sub-results, stopping at the first positive one.
    #[tracing::instrument(skip(self))]
    pub fn record_panel(
        &self,
        donation_id: DonationId,
        results: &[(Pathogen, TestResult)],
    ) -> Result<TestOutcome, TestingError> {
        let mut donations = self
            .donations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let donation = donations
            .get_mut(&donation_id)
            .ok_or(TestingError::DonationNotFound { donation_id })?;
        if donation.outcome.is_decided() {
            return Err(TestingError::AlreadyDecided { donation_id });
        }

        for (pathogen, result) in results {
            donation.results.insert(*pathogen, *result);
            if *result == TestResult::Positive {
                break;
            }
        }

        donation.outcome = donation.evaluate();
        match donation.outcome {
            TestOutcome::Passed => {
                donation.unit.status = UnitStatus::Available;
                tracing::info!("donation cleared");
            }
            TestOutcome::Failed { pathogen } => {
                donation.unit.status = UnitStatus::Discarded;
                tracing::warn!(?pathogen, "donation failed screening");
            }
            TestOutcome::Pending => {}
        }
        Ok(donation.outcome)
    }

    pub fn donation(&self, donation_id: DonationId) -> Option<Donation> {
        self.donations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&donation_id)
            .cloned()
    }

    fn count(&self, predicate: impl Fn(&TestOutcome) -> bool) -> usize {
        self.donations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| predicate(&d.outcome))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.count(|o| *o == TestOutcome::Pending)
    }

    pub fn passed_count(&self) -> usize {
        self.count(|o| *o == TestOutcome::Passed)
    }

    pub fn discarded_count(&self) -> usize {
        self.count(|o| matches!(o, TestOutcome::Failed { .. }))
    }
}
