//! Query side of the fulfillment system.
//!
//! - [`Projection`] folds journal envelopes into a read model
//! - [`ReadModel`] exposes query access to the folded data
//! - [`ProjectionProcessor`] replays the journal and follows its live feed
//! - Views: the request board and per-channel commitment activity

pub mod error;
pub mod processor;
pub mod projection;
pub mod read_model;
pub mod views;

pub use error::{ProjectionError, Result};
pub use processor::ProjectionProcessor;
pub use projection::{Projection, ProjectionPosition};
pub use read_model::ReadModel;
pub use views::{ChannelActivity, ChannelActivityView, RequestBoardRow, RequestBoardView};
