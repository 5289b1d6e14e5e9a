//! Call engine connections backing a session's `CallTransport`.

pub mod call_engine;

pub use call_engine::CallEngineTransport;
