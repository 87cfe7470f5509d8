//! Event channel for pushed session events

mod connection;
mod protocol;

pub use connection::{AUTH_GRACE_FRAMES, AUTH_GRACE_PERIOD, ws_handler};
pub use protocol::{ClientMessage, ServerMessage, event_frame};
