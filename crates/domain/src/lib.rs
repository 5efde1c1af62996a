//! Domain model of the blood supply fulfillment system.
//!
//! Requests and transport jobs are event-sourced aggregates driven through
//! [`CommandHandler`]. Inventory and testing are in-memory ledgers with
//! their own locking, since their hot paths (reservation, expiry sweeps)
//! work across many units at once.

pub mod aggregate;
pub mod blood;
pub mod command;
pub mod error;
pub mod geo;
pub mod inventory;
pub mod request;
pub mod testing;
pub mod transport;

pub use aggregate::{Aggregate, DomainEvent};
pub use blood::{BloodGroup, Component, ParseBloodError, Urgency};
pub use command::{Command, CommandHandler, CommandResult};
pub use error::DomainError;
pub use geo::GeoPoint;
pub use inventory::{BloodUnit, InventoryError, InventoryLedger, StockLevel, UnitStatus};
pub use request::{
    BloodRequest, CancelReason, Channel, Commitment, CommitmentKind, CommitmentState,
    FailureReason, RequestError, RequestEvent, RequestId, RequestLedger, RequestSpec,
    RequestStatus,
};
pub use testing::{
    Collection, Donation, DonationTarget, Pathogen, TestOutcome, TestResult, TestingError,
    TestingGate,
};
pub use transport::{
    ColdChainAssessment, ColdChainPolicy, Severity, TransportCoordinator, TransportError,
    TransportEvent, TransportIssue, TransportJob, TransportStatus,
};
