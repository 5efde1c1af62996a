//! Inventory ledger with per-bank serialization.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use common::{BloodBankId, UnitId};
use serde::Serialize;

use crate::blood::{BloodGroup, Component};
use crate::request::RequestId;

use super::{BloodUnit, InventoryError, Reservation, UnitStatus};

#[derive(Debug, Default)]
struct BankStock {
    units: HashMap<UnitId, BloodUnit>,
}

impl BankStock {
    fn matching_usable(
        &self,
        blood_group: BloodGroup,
        component: Component,
        now: DateTime<Utc>,
    ) -> Vec<&BloodUnit> {
        let mut units: Vec<_> = self
            .units
            .values()
            .filter(|u| u.matches(blood_group, component) && u.is_usable_at(now))
            .collect();
        units.sort_by_key(|u| (u.expires_at, u.id));
        units
    }
}

/// A unit moved to `expired` by a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiredUnit {
    pub unit_id: UnitId,
    pub bank_id: BloodBankId,
    /// The request that held the unit, if it was reserved.
    pub request_id: Option<RequestId>,
}

/// Count of units of one group/component at one bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    pub bank_id: BloodBankId,
    pub blood_group: BloodGroup,
    pub component: Component,
    pub available: u32,
    pub reserved: u32,
}

/// Record of every unit held by every bank.
///
/// Each bank's stock sits behind its own mutex so reservations against the
/// same bank are serialized while different banks proceed independently.
/// Operations spanning several banks take the locks in bank-id order.
/// No lock is held across an await point.
#[derive(Debug, Clone, Default)]
pub struct InventoryLedger {
    banks: Arc<RwLock<HashMap<BloodBankId, Arc<Mutex<BankStock>>>>>,
    index: Arc<RwLock<HashMap<UnitId, BloodBankId>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bank with empty stock. Registering twice is harmless.
    pub fn register_bank(&self, bank_id: BloodBankId) {
        write(&self.banks).entry(bank_id).or_default();
    }

    pub fn banks(&self) -> Vec<BloodBankId> {
        let mut banks: Vec<_> = read(&self.banks).keys().cloned().collect();
        banks.sort();
        banks
    }

    fn bank(&self, bank_id: &BloodBankId) -> Result<Arc<Mutex<BankStock>>, InventoryError> {
        read(&self.banks)
            .get(bank_id)
            .cloned()
            .ok_or_else(|| InventoryError::UnknownBank {
                bank_id: bank_id.clone(),
            })
    }

    fn insert(&self, unit: BloodUnit) -> UnitId {
        let stock = write(&self.banks).entry(unit.bank_id.clone()).or_default().clone();
        let unit_id = unit.id;
        write(&self.index).insert(unit_id, unit.bank_id.clone());
        lock(&stock).units.insert(unit_id, unit);
        unit_id
    }

    /// Takes a cleared unit into stock as available.
    #[tracing::instrument(skip(self, unit), fields(unit_id = %unit.id, bank_id = %unit.bank_id))]
    pub fn admit(&self, mut unit: BloodUnit, now: DateTime<Utc>) -> Result<UnitId, InventoryError> {
        if unit.is_expired_at(now) {
            return Err(InventoryError::UnitExpired { unit_id: unit.id });
        }
        unit.status = UnitStatus::Available;
        unit.reservation = None;
        Ok(self.insert(unit))
    }

    /// Takes a cleared unit into stock already reserved for a request.
    #[tracing::instrument(skip(self, unit), fields(unit_id = %unit.id, bank_id = %unit.bank_id))]
    pub fn admit_reserved(
        &self,
        mut unit: BloodUnit,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<UnitId, InventoryError> {
        if unit.is_expired_at(now) {
            return Err(InventoryError::UnitExpired { unit_id: unit.id });
        }
        unit.status = UnitStatus::Reserved;
        unit.reservation = Some(Reservation {
            request_id,
            reserved_at: now,
        });
        Ok(self.insert(unit))
    }

    /// Records a batch of cleared units delivered to a bank's shelves.
    pub fn stock(
        &self,
        bank_id: &BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        quantity: u32,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<UnitId>, InventoryError> {
        (0..quantity)
            .map(|_| {
                let unit =
                    BloodUnit::collected(bank_id.clone(), blood_group, component, expires_at);
                self.admit(unit, now)
            })
            .collect()
    }

    /// Reserves exactly `quantity` matching units at one bank for a request,
    /// earliest expiry first. All or nothing.
    #[tracing::instrument(skip(self))]
    pub fn reserve(
        &self,
        bank_id: &BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        quantity: u32,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Vec<UnitId>, InventoryError> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity { quantity });
        }
        let stock = self.bank(bank_id)?;
        let mut stock = lock(&stock);

        let selected: Vec<UnitId> = {
            let candidates = stock.matching_usable(blood_group, component, now);
            if candidates.len() < quantity as usize {
                metrics::counter!("inventory_reservations_total", "outcome" => "insufficient")
                    .increment(1);
                return Err(InventoryError::InsufficientStock {
                    bank_id: bank_id.clone(),
                    requested: quantity,
                    available: candidates.len() as u32,
                });
            }
            candidates
                .into_iter()
                .take(quantity as usize)
                .map(|u| u.id)
                .collect()
        };

        for unit_id in &selected {
            if let Some(unit) = stock.units.get_mut(unit_id) {
                unit.status = UnitStatus::Reserved;
                unit.reservation = Some(Reservation {
                    request_id,
                    reserved_at: now,
                });
            }
        }

        metrics::counter!("inventory_reservations_total", "outcome" => "reserved").increment(1);
        tracing::debug!(units = selected.len(), "units reserved");
        Ok(selected)
    }

    /// Runs `f` with every listed unit borrowed mutably, holding the locks
    /// of all banks involved.
    fn with_units<R>(
        &self,
        unit_ids: &[UnitId],
        f: impl FnOnce(Vec<&mut BloodUnit>) -> Result<R, InventoryError>,
    ) -> Result<R, InventoryError> {
        let wanted: HashSet<UnitId> = unit_ids.iter().copied().collect();
        let mut bank_ids = BTreeSet::new();
        {
            let index = read(&self.index);
            for unit_id in &wanted {
                let bank_id = index
                    .get(unit_id)
                    .ok_or(InventoryError::UnitNotFound { unit_id: *unit_id })?;
                bank_ids.insert(bank_id.clone());
            }
        }

        let stocks = bank_ids
            .iter()
            .map(|bank_id| self.bank(bank_id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards: Vec<_> = stocks.iter().map(|s| lock(s)).collect();

        let wanted = &wanted;
        let units: Vec<&mut BloodUnit> = guards
            .iter_mut()
            .flat_map(|stock| {
                stock
                    .units
                    .values_mut()
                    .filter(move |u| wanted.contains(&u.id))
            })
            .collect();
        f(units)
    }

    /// Returns reserved units to available. Units in any other status are
    /// left untouched. Returns the units actually released.
    #[tracing::instrument(skip(self))]
    pub fn release(&self, unit_ids: &[UnitId]) -> Result<Vec<UnitId>, InventoryError> {
        self.release_where(unit_ids, |_| true)
    }

    /// Like [`release`](Self::release), but only touches units whose
    /// reservation belongs to `request_id`.
    #[tracing::instrument(skip(self))]
    pub fn release_held(
        &self,
        unit_ids: &[UnitId],
        request_id: RequestId,
    ) -> Result<Vec<UnitId>, InventoryError> {
        self.release_where(unit_ids, |unit| unit.reserved_for() == Some(request_id))
    }

    fn release_where(
        &self,
        unit_ids: &[UnitId],
        held: impl Fn(&BloodUnit) -> bool,
    ) -> Result<Vec<UnitId>, InventoryError> {
        self.with_units(unit_ids, |units| {
            let mut released = Vec::new();
            for unit in units {
                if unit.status == UnitStatus::Reserved && held(unit) {
                    unit.status = UnitStatus::Available;
                    unit.reservation = None;
                    released.push(unit.id);
                }
            }
            Ok(released)
        })
    }

    /// Issues reserved units to the request holding them. Either every unit
    /// is issued or none is. Re-issuing to the same request is a no-op.
    /// Units past their expiry are refused.
    #[tracing::instrument(skip(self))]
    pub fn issue(
        &self,
        unit_ids: &[UnitId],
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), InventoryError> {
        self.with_units(unit_ids, |mut units| {
            for unit in &units {
                if unit.reserved_for() != Some(request_id) {
                    return Err(InventoryError::ReservationMismatch {
                        unit_id: unit.id,
                        expected: request_id,
                        actual: unit.reserved_for(),
                    });
                }
                if unit.status == UnitStatus::Issued {
                    continue;
                }
                if !unit.status.can_issue() {
                    return Err(InventoryError::InvalidTransition {
                        unit_id: unit.id,
                        status: unit.status,
                        action: "issue",
                    });
                }
                if unit.is_expired_at(now) {
                    return Err(InventoryError::UnitExpired { unit_id: unit.id });
                }
            }
            for unit in units.iter_mut() {
                unit.status = UnitStatus::Issued;
            }
            Ok(())
        })
    }

    /// Removes compromised units from circulation.
    #[tracing::instrument(skip(self))]
    pub fn discard(&self, unit_ids: &[UnitId]) -> Result<Vec<UnitId>, InventoryError> {
        self.with_units(unit_ids, |units| {
            let mut discarded = Vec::new();
            for unit in units {
                if unit.status.can_expire() {
                    unit.status = UnitStatus::Discarded;
                    unit.reservation = None;
                    discarded.push(unit.id);
                }
            }
            Ok(discarded)
        })
    }

    /// Moves every unit past its expiry to `expired`, dropping reservations.
    #[tracing::instrument(skip(self))]
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> Vec<ExpiredUnit> {
        let stocks: Vec<_> = read(&self.banks)
            .iter()
            .map(|(id, stock)| (id.clone(), stock.clone()))
            .collect();

        let mut expired = Vec::new();
        for (bank_id, stock) in stocks {
            let mut stock = lock(&stock);
            for unit in stock.units.values_mut() {
                if unit.status.can_expire() && unit.is_expired_at(now) {
                    let held_by = unit.reserved_for();
                    unit.status = UnitStatus::Expired;
                    unit.reservation = None;
                    expired.push(ExpiredUnit {
                        unit_id: unit.id,
                        bank_id: bank_id.clone(),
                        request_id: held_by,
                    });
                }
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "units expired");
        }
        expired
    }

    pub fn available_count(
        &self,
        bank_id: &BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        now: DateTime<Utc>,
    ) -> u32 {
        self.bank(bank_id)
            .map(|stock| lock(&stock).matching_usable(blood_group, component, now).len() as u32)
            .unwrap_or(0)
    }

    /// Expiry of the unit a reservation would pick first.
    pub fn earliest_expiry(
        &self,
        bank_id: &BloodBankId,
        blood_group: BloodGroup,
        component: Component,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let stock = self.bank(bank_id).ok()?;
        let stock = lock(&stock);
        stock
            .matching_usable(blood_group, component, now)
            .first()
            .map(|u| u.expires_at)
    }

    pub fn unit(&self, unit_id: UnitId) -> Option<BloodUnit> {
        let bank_id = read(&self.index).get(&unit_id)?.clone();
        let stock = self.bank(&bank_id).ok()?;
        let stock = lock(&stock);
        stock.units.get(&unit_id).cloned()
    }

    /// Available and reserved counts per bank, group and component.
    pub fn stock_levels(&self, now: DateTime<Utc>) -> Vec<StockLevel> {
        let stocks: Vec<_> = read(&self.banks)
            .iter()
            .map(|(id, stock)| (id.clone(), stock.clone()))
            .collect();

        let mut levels: HashMap<(BloodBankId, BloodGroup, Component), StockLevel> = HashMap::new();
        for (bank_id, stock) in stocks {
            let stock = lock(&stock);
            for unit in stock.units.values() {
                let usable = unit.is_usable_at(now);
                let reserved = unit.status == UnitStatus::Reserved;
                if !usable && !reserved {
                    continue;
                }
                let level = levels
                    .entry((bank_id.clone(), unit.blood_group, unit.component))
                    .or_insert_with(|| StockLevel {
                        bank_id: bank_id.clone(),
                        blood_group: unit.blood_group,
                        component: unit.component,
                        available: 0,
                        reserved: 0,
                    });
                if usable {
                    level.available += 1;
                } else {
                    level.reserved += 1;
                }
            }
        }

        let mut levels: Vec<_> = levels.into_values().collect();
        levels.sort_by(|a, b| {
            (&a.bank_id, a.blood_group, a.component).cmp(&(&b.bank_id, b.blood_group, b.component))
        });
        levels
    }
}
