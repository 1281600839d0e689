//! Relay WebSocket gateway: wire protocol, per-connection state machine,
//! presence and the cross-process group bus.

pub mod backoff;
pub mod bus;
pub mod events;
pub mod handler;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;
