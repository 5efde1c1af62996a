//! Ports to external collaborators and their in-memory adapters.

pub mod directory;
pub mod notifier;

pub use directory::{
    Facility, FacilityDirectory, FacilityKind, InMemoryFacilityDirectory, RankedFacility,
};
pub use notifier::{
    InMemoryNotifier, Notification, NotificationKind, Notifier, Recipient, TracingNotifier,
};
