//! Fulfillment orchestration for blood requests.
//!
//! The [`FulfillmentOrchestrator`] matches requests against bank stock,
//! mobilizes donors and escalates to institutions, then reconciles whatever
//! the channels report back against the request ledger.

pub mod clock;
pub mod config;
mod context;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod services;
pub mod status;
pub mod timers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use events::{EventOutcome, FulfillmentEvent};
pub use orchestrator::{FulfillmentOrchestrator, TickReport};
pub use services::{
    Facility, FacilityDirectory, FacilityKind, InMemoryFacilityDirectory, InMemoryNotifier,
    Notification, NotificationKind, Notifier, RankedFacility, Recipient, TracingNotifier,
};
pub use status::{CommitmentView, RequestStatusView, TransportJobView};
pub use timers::{TimerKind, TimerQueue};
