//! Interview API Library Crate
//!
//! Hosts call sessions for the browser: configuration, shared state, the
//! WebSocket relay that drives an `interview_core` session runtime, and the
//! call engine transport. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod identity;
pub mod router;
pub mod state;
pub mod ws;
