//! WebSocket Call Sessions
//!
//! - `protocol`: the JSON message format between the browser and the server.
//! - `session`: connection lifecycle, from `init` to teardown.
//! - `provider`: the call engine connection behind each session.

pub mod protocol;
pub mod provider;
pub mod session;

pub use session::ws_handler;
