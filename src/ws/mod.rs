//! WebSocket layer: stream protocol, dispatcher and upgrade handler.
//!
//! The endpoint at `/ws` carries one duplex subscription stream per
//! connection: clients create and cancel subscriptions, the server
//! acknowledges and delivers events.

pub mod dispatcher;
pub mod handler;
pub mod messages;
