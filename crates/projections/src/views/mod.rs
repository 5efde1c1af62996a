//! Read model views over the request journal.

pub mod channel_activity;
pub mod request_board;

pub use channel_activity::{ChannelActivity, ChannelActivityView};
pub use request_board::{RequestBoardRow, RequestBoardView};
