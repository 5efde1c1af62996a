//! Facility lookup: which banks, donors and institutions can reach a request.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use domain::{BloodGroup, GeoPoint};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityKind {
    BloodBank,
    Donor,
    Institution,
}

/// A registered bank, donor or institution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    /// Registry code, interpreted according to `kind`.
    pub id: String,
    pub kind: FacilityKind,
    pub name: String,
    pub location: GeoPoint,
    /// Donor's blood group. Unused for banks and institutions.
    #[serde(default)]
    pub blood_group: Option<BloodGroup>,
}

/// A facility with its distance from the point searched from.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedFacility {
    pub facility: Facility,
    pub distance_km: f64,
}

#[async_trait]
pub trait FacilityDirectory: Send + Sync {
    /// Facilities of `kind` within `radius_km` of `location`, nearest first.
    async fn nearby(
        &self,
        location: GeoPoint,
        radius_km: f64,
        kind: FacilityKind,
    ) -> Result<Vec<RankedFacility>, OrchestratorError>;
}

/// Directory held in memory, ranking by great-circle distance.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFacilityDirectory {
    facilities: Arc<RwLock<Vec<Facility>>>,
}

impl InMemoryFacilityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a facility, replacing any earlier entry with the same id and kind.
    pub fn register(&self, facility: Facility) {
        let mut facilities = self.facilities.write().unwrap_or_else(PoisonError::into_inner);
        facilities.retain(|f| !(f.id == facility.id && f.kind == facility.kind));
        facilities.push(facility);
    }

    pub fn len(&self) -> usize {
        self.facilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FacilityDirectory for InMemoryFacilityDirectory {
    async fn nearby(
        &self,
        location: GeoPoint,
        radius_km: f64,
        kind: FacilityKind,
    ) -> Result<Vec<RankedFacility>, OrchestratorError> {
        let facilities = self.facilities.read().unwrap_or_else(PoisonError::into_inner);
        let mut ranked: Vec<RankedFacility> = facilities
            .iter()
            .filter(|f| f.kind == kind)
            .map(|f| RankedFacility {
                distance_km: location.distance_km(&f.location),
                facility: f.clone(),
            })
            .filter(|r| r.distance_km <= radius_km)
            .collect();
        ranked.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.facility.id.cmp(&b.facility.id))
        });
        Ok(ranked)
    }
}
