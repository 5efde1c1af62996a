//! Per-bank ledger of discrete blood units.

mod ledger;
mod unit;

pub use ledger::{ExpiredUnit, InventoryLedger, StockLevel};
pub use unit::{BloodUnit, Reservation, UnitStatus};

use common::{BloodBankId, UnitId};
use thiserror::Error;

use crate::request::RequestId;

/// Errors raised by the inventory ledger.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Fewer matching units than asked for. Nothing was reserved.
    #[error("Insufficient stock at {bank_id}: requested {requested}, available {available}")]
    InsufficientStock {
        bank_id: BloodBankId,
        requested: u32,
        available: u32,
    },

    /// A unit is not held for the request trying to use it.
    #[error("Unit {unit_id} is not reserved for request {expected}")]
    ReservationMismatch {
        unit_id: UnitId,
        expected: RequestId,
        actual: Option<RequestId>,
    },

    #[error("Unit not found: {unit_id}")]
    UnitNotFound { unit_id: UnitId },

    #[error("Unknown blood bank: {bank_id}")]
    UnknownBank { bank_id: BloodBankId },

    #[error("Cannot {action} unit {unit_id} in {status} status")]
    InvalidTransition {
        unit_id: UnitId,
        status: UnitStatus,
        action: &'static str,
    },

    #[error("Unit {unit_id} is already past its expiry")]
    UnitExpired { unit_id: UnitId },

    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },
}
