//! Identifiers shared by every layer of the fulfillment system.

pub mod types;

pub use types::{
    AggregateId, BloodBankId, CommitmentId, DonationId, DonorId, HospitalId, InstitutionId,
    JobId, UnitId,
};
