//! Connection, room and presence state for the chat server, plus the message
//! fan-out and call signaling built on top of it.

pub mod auth;
pub mod context;
pub mod error;
pub mod fanout;
pub mod hub;
pub mod presence;
pub mod push;
pub mod registry;
pub mod rooms;
pub mod signaling;
pub mod store;

pub use context::{Limits, RealtimeContext, DEFAULT_MAX_CALL_PARTICIPANTS, MAX_MESSAGE_CHARS};
pub use error::RealtimeError;
pub use presence::Session;
pub use push::{DisabledPushGateway, PushGateway, PushNotification};
pub use registry::Outbox;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
